//! Failover flows through the factory and the stage driver

use dbha::config::AuditPolicy;
use dbha::switch::{run_switch, switch_factory, Binding, SwitchError, SwitchOutcome};
use dbha::testing::{member, route, switch_request, test_config, FakeNode, TestContext};

fn proxy_request() -> dbha::switch::SwitchRequest {
    let mut request = switch_request("tendbha", "proxy");
    request.binds.dns = vec![Binding::new("app.db.example.com", "10.0.0.1", 3306)];
    request.binds.polaris = vec![Binding::new("app-db-polaris", "10.0.0.1", 3306)];
    request
}

#[tokio::test]
async fn test_proxy_failover_writes_one_audit_trail() {
    let ctx = TestContext::new();
    let mut switch = switch_factory(ctx.context(), proxy_request()).unwrap();

    assert_eq!(run_switch(switch.as_mut()).await.unwrap(), SwitchOutcome::Switched);
    assert_eq!(ctx.dns.deregistered(), vec!["app.db.example.com"]);
    assert_eq!(ctx.polaris.deregistered(), vec!["app-db-polaris"]);

    let logs = ctx.audit.switch_logs();
    assert!(logs.len() >= 3);
    assert!(logs.iter().all(|row| row.switch_uid == switch.base().switch_uid));
    assert_eq!(logs.first().map(|r| r.result.as_str()), Some("begin"));
    assert_eq!(logs.last().map(|r| r.result.as_str()), Some("success"));
}

#[tokio::test]
async fn test_last_address_under_domain_is_never_released() {
    let ctx = TestContext::new();
    ctx.dns.set_bound("app.db.example.com", 1);
    let mut switch = switch_factory(ctx.context(), proxy_request()).unwrap();

    let err = run_switch(switch.as_mut()).await.unwrap_err();
    assert!(matches!(err, SwitchError::SingleAddressUnderDomain { ref domains, .. } if domains == &["app.db.example.com"]));
    assert!(ctx.dns.deregistered().is_empty());
    assert!(ctx.polaris.deregistered().is_empty());
    assert!(ctx.audit.switch_logs().iter().any(|r| r.result == "failed"));
}

#[tokio::test]
async fn test_partial_release_keeps_successful_releases() {
    let ctx = TestContext::new();
    ctx.clb.fail_calls();
    let mut request = proxy_request();
    request.binds.clb = vec![Binding::new("lb-1", "10.0.0.1", 3306)];
    let mut switch = switch_factory(ctx.context(), request).unwrap();

    let outcome = run_switch(switch.as_mut()).await.unwrap();
    assert!(matches!(outcome, SwitchOutcome::SwitchedWithWarnings(ref msg) if msg.contains("lb-1")));

    assert_eq!(ctx.dns.deregistered(), vec!["app.db.example.com"]);
    assert_eq!(ctx.polaris.deregistered(), vec!["app-db-polaris"]);
    assert!(ctx.dns.registered().is_empty());
    assert!(ctx.polaris.registered().is_empty());
    assert!(ctx.clb.registered().is_empty());

    let results: Vec<_> = ctx.audit.switch_logs().into_iter().map(|r| r.result).collect();
    assert!(results.iter().any(|r| r == "warning"));
    assert!(!results.iter().any(|r| r == "failed"));
    assert_eq!(results.last().map(String::as_str), Some("success"));
}

#[tokio::test]
async fn test_strict_audit_blocks_switch_while_sink_is_down() {
    let mut config = test_config();
    config.switch.audit_policy = AuditPolicy::Strict;
    let ctx = TestContext::with_config(config);
    ctx.audit.set_failing(true);
    let mut switch = switch_factory(ctx.context(), proxy_request()).unwrap();

    assert!(matches!(
        run_switch(switch.as_mut()).await,
        Err(SwitchError::Audit(_))
    ));
    assert!(ctx.dns.deregistered().is_empty());
}

#[tokio::test]
async fn test_control_primary_failover_repairs_cluster() {
    let ctx = TestContext::new();
    let routes = vec![
        route("SPIDER0", "10.0.1.1", 25000, "SPIDER"),
        route("SPT0", "10.0.2.1", 20000, "mysql"),
        route("TDBCTL0", "10.0.0.1", 26000, "TDBCTL"),
        route("TDBCTL1", "10.0.0.2", 26000, "TDBCTL"),
        route("TDBCTL2", "10.0.0.3", 26000, "TDBCTL"),
    ];
    ctx.coordinator.set_members(
        "cluster-a",
        vec![
            member("10.0.0.1", 26000, "tdbctl", "primary"),
            member("10.0.0.2", 26000, "tdbctl", "secondary"),
            member("10.0.0.3", 26000, "tdbctl", "secondary"),
            member("10.0.1.1", 25000, "spider", "spider_master"),
        ],
    );
    let source = ("10.0.0.1", 26000);
    ctx.control.set_node(
        "10.0.0.1:26000",
        FakeNode {
            unreachable: true,
            ..FakeNode::primary(routes.clone())
        },
    );
    // equal progress: the lower server name wins
    ctx.control
        .set_node("10.0.0.2:26000", FakeNode::secondary(source, 7, 500, routes.clone()));
    ctx.control
        .set_node("10.0.0.3:26000", FakeNode::secondary(source, 7, 500, routes.clone()));
    ctx.control.set_node("10.0.1.1:25000", FakeNode::spider(routes));

    let mut request = switch_request("tendbcluster", "tdbctl");
    request.port = 26000;
    let mut switch = switch_factory(ctx.context(), request).unwrap();

    assert_eq!(run_switch(switch.as_mut()).await.unwrap(), SwitchOutcome::Switched);
    assert_eq!(switch.base().extra.new_primary.as_deref(), Some("TDBCTL1"));

    assert!(ctx.control.node("10.0.0.2:26000").unwrap().is_primary);
    let follower = ctx.control.node("10.0.0.3:26000").unwrap().replication.unwrap();
    assert_eq!(follower.source_host, "10.0.0.2");

    let spider_routes = ctx.control.node("10.0.1.1:25000").unwrap().routes;
    assert!(spider_routes.iter().all(|r| r.server_name != "TDBCTL0"));
    assert!(!ctx.audit.switch_logs().iter().any(|r| r.result == "route_check"));
}

#[tokio::test]
async fn test_unsupported_machine_type() {
    let ctx = TestContext::new();
    let result = switch_factory(ctx.context(), switch_request("tendbha", "backend"));
    assert!(matches!(result, Err(SwitchError::Unsupported { .. })));
}
