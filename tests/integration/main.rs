//! Integration test entry point
//!
//! Run with: cargo test --test integration
//!
//! Agents and switches run against the in-memory collaborators from
//! `dbha::testing`; GM delivery goes over real TCP to a local node.
//! Tests that need a live MySQL server are opt-in.
//!
//! Environment variables:
//! - DBHA_RUN_INTEGRATION_TESTS: Set to "1" to enable live MySQL tests
//! - DBHA_TEST_MYSQL_HOST: MySQL host (default: 127.0.0.1)
//! - DBHA_TEST_MYSQL_PORT: MySQL port (default: 3306)
//! - DBHA_TEST_MYSQL_USER: MySQL user (default: root)
//! - DBHA_TEST_MYSQL_PASS: MySQL password (default: empty)

mod agent;
mod gm_ring;
mod live_mysql;
mod switch;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

use dbha::coordinator::GmNode;
use dbha::gm::{Frame, ReportCodec};

/// Check if live tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("DBHA_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if live tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("Skipping integration test (set DBHA_RUN_INTEGRATION_TESTS=1 to run)");
            return;
        }
    };
}

/// Live MySQL connection config
#[derive(Debug, Clone)]
pub struct MysqlTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

pub fn get_mysql_config() -> MysqlTestConfig {
    MysqlTestConfig {
        host: env::var("DBHA_TEST_MYSQL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("DBHA_TEST_MYSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3306),
        user: env::var("DBHA_TEST_MYSQL_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("DBHA_TEST_MYSQL_PASS").unwrap_or_default(),
    }
}

/// A coordination node in another zone than the test agent
pub fn gm_node(ip: &str, port: u16) -> GmNode {
    GmNode {
        ip: ip.to_string(),
        port,
        zone: "shanghai".to_string(),
        cloud: "default".to_string(),
    }
}

/// A report received by [`LocalGm`]
#[derive(Debug, Clone)]
pub struct ReceivedReport {
    pub detect_type: String,
    pub payload: serde_json::Value,
}

/// Coordination node on 127.0.0.1 that acks every report
pub struct LocalGm {
    pub port: u16,
    received: Arc<Mutex<Vec<ReceivedReport>>>,
}

impl LocalGm {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let sink = sink.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, ReportCodec);
                    while let Some(Ok(frame)) = framed.next().await {
                        if let Frame::Report {
                            detect_type,
                            payload,
                        } = frame
                        {
                            let payload = serde_json::from_slice(&payload).unwrap_or_default();
                            sink.lock().push(ReceivedReport {
                                detect_type,
                                payload,
                            });
                            if framed.send(Frame::Ack).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });

        Self { port, received }
    }

    pub fn received(&self) -> Vec<ReceivedReport> {
        self.received.lock().clone()
    }
}

/// Poll `cond` until it holds or two seconds pass
pub async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
