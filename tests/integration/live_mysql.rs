//! MySQL probe against real servers
//!
//! The closed-port case runs everywhere; the others need a live server
//! (see the entry point for the environment variables).

use tokio::net::TcpListener;

use dbha::config::ProbeConfig;
use dbha::coordinator::InstanceRecord;
use dbha::detect::{DBInstance, DetectionProbe, InstanceStatus, MysqlProbe};

use crate::{get_mysql_config, skip_if_not_enabled};

fn instance(host: &str, port: u16) -> DBInstance {
    DBInstance::from(InstanceRecord {
        ip: host.to_string(),
        port,
        db_type: "tendbha:backend".to_string(),
        cluster_type: "tendbha".to_string(),
        cluster: "live".to_string(),
        app: "live".to_string(),
        idc: String::new(),
    })
}

fn probe(user: &str, password: &str) -> MysqlProbe {
    MysqlProbe::new(ProbeConfig {
        user: user.to_string(),
        password: password.to_string(),
        ..ProbeConfig::default()
    })
}

#[tokio::test]
async fn test_closed_port_is_check_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let outcome = probe("root", "")
        .detect(&instance("127.0.0.1", port))
        .await
        .unwrap();
    assert_eq!(outcome.status, InstanceStatus::DbCheckFailed);
}

#[tokio::test]
async fn test_live_server_is_healthy() {
    skip_if_not_enabled!();
    let config = get_mysql_config();

    let outcome = probe(&config.user, &config.password)
        .detect(&instance(&config.host, config.port))
        .await
        .unwrap();
    assert_eq!(outcome.status, InstanceStatus::DbCheckSuccess, "{}", outcome.detail);
}

#[tokio::test]
async fn test_wrong_password_is_auth_failed() {
    skip_if_not_enabled!();
    let config = get_mysql_config();

    let outcome = probe(&config.user, "definitely-not-the-password")
        .detect(&instance(&config.host, config.port))
        .await
        .unwrap();
    assert_eq!(outcome.status, InstanceStatus::DbAuthFailed, "{}", outcome.detail);
}
