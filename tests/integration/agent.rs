//! Detection sweeps end to end: coordinator fetch, probing, GM delivery
//! over TCP, audit rows

use std::sync::Arc;
use std::time::Duration;

use dbha::context::HaContext;
use dbha::detect::{InstanceStatus, MonitorAgent};
use dbha::gm::TcpGmConnector;
use dbha::testing::{record, test_config, TestContext};

use crate::{gm_node, LocalGm};

/// Context whose GM transport is real TCP
fn tcp_context(ctx: &TestContext) -> Arc<HaContext> {
    Arc::new(HaContext {
        config: ctx.config.clone(),
        coordinator: ctx.coordinator.clone(),
        audit: ctx.audit.clone(),
        probes: ctx.probes.clone(),
        gm_connector: Arc::new(TcpGmConnector::new()),
        name_services: Vec::new(),
        control: ctx.control.clone(),
    })
}

#[tokio::test]
async fn test_sweep_reports_unhealthy_instance_once() {
    let gm = LocalGm::start().await;
    let ctx = TestContext::new();
    ctx.coordinator.set_instances(vec![
        record("10.0.0.1", 3306),
        record("10.0.0.2", 3306),
        record("10.0.0.3", 3306),
    ]);
    ctx.coordinator.set_gm_nodes(vec![gm_node("127.0.0.1", gm.port)]);
    ctx.probes.set_status("10.0.0.2", InstanceStatus::DbCheckFailed);

    let agent = Arc::new(MonitorAgent::new(tcp_context(&ctx), "tendbha:backend"));
    let summary = agent.run_once().await;
    assert_eq!(summary.probed, 3);
    assert_eq!(summary.unhealthy, 1);

    let received = gm.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].detect_type, "tendbha:backend");
    assert_eq!(received[0].payload["ip"], "10.0.0.2");
    assert_eq!(received[0].payload["status"], "DB_CHECK_FAILED");
    assert_eq!(received[0].payload["agent_ip"], ctx.config.agent.ip.as_str());

    // still unhealthy, but inside the dedup window
    let summary = agent.run_once().await;
    assert_eq!(summary.unhealthy, 1);
    assert_eq!(gm.received().len(), 1);

    let deliveries = ctx.audit.gm_deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].gm_port, gm.port);
    assert_eq!(ctx.audit.detect_logs().len(), 6);
    assert_eq!(ctx.audit.status_rows().len(), 2);
    assert_eq!(ctx.audit.heartbeats().len(), 2);
}

#[tokio::test]
async fn test_healthy_fleet_sends_nothing() {
    let gm = LocalGm::start().await;
    let ctx = TestContext::new();
    ctx.coordinator
        .set_instances(vec![record("10.0.0.1", 3306), record("10.0.0.2", 3306)]);
    ctx.coordinator.set_gm_nodes(vec![gm_node("127.0.0.1", gm.port)]);

    let agent = Arc::new(MonitorAgent::new(tcp_context(&ctx), "tendbha:backend"));
    let summary = agent.run_once().await;
    assert_eq!(summary.unhealthy, 0);
    assert!(gm.received().is_empty());
    assert!(ctx.audit.status_rows().is_empty());
}

#[tokio::test]
async fn test_coordinator_outage_keeps_stale_instances() {
    let mut config = test_config();
    config.agent.fetch_interval_secs = 0;
    let ctx = TestContext::with_config(config);
    ctx.coordinator
        .set_instances(vec![record("10.0.0.1", 3306), record("10.0.0.2", 3306)]);

    let agent = Arc::new(MonitorAgent::new(ctx.context(), "tendbha:backend"));
    assert_eq!(agent.run_once().await.probed, 2);

    ctx.coordinator.set_failing(true);
    assert_eq!(agent.run_once().await.probed, 2);
    assert_eq!(ctx.probes.calls(), 4);
}

#[tokio::test]
async fn test_sweep_bounds_probe_concurrency() {
    let mut config = test_config();
    config.agent.max_concurrency = 2;
    let ctx = TestContext::with_config(config);
    ctx.coordinator.set_instances(
        (1..=6)
            .map(|i| record(&format!("10.0.0.{}", i), 3306))
            .collect(),
    );
    ctx.probes.set_delay(Duration::from_millis(30));

    let agent = Arc::new(MonitorAgent::new(ctx.context(), "tendbha:backend"));
    let summary = agent.run_once().await;

    assert_eq!(summary.probed, 6);
    assert!(ctx.probes.max_in_flight() <= 2);
    assert_eq!(ctx.probes.in_flight(), 0);
    // the sweep waits for every probe
    assert!(summary.elapsed >= Duration::from_millis(90));
}

#[tokio::test]
async fn test_agents_for_different_db_types_are_independent() {
    let mut config = test_config();
    config.agent.db_types = vec!["tendbha:backend".into(), "tendbha:proxy".into()];
    let ctx = TestContext::with_config(config);
    ctx.coordinator.set_instances(vec![record("10.0.0.1", 3306)]);

    let backend = Arc::new(MonitorAgent::new(ctx.context(), "tendbha:backend"));
    let proxy = Arc::new(MonitorAgent::new(ctx.context(), "tendbha:proxy"));
    backend.run_once().await;
    proxy.run_once().await;

    let heartbeats: Vec<String> = ctx
        .audit
        .heartbeats()
        .into_iter()
        .map(|h| h.db_type)
        .collect();
    assert_eq!(heartbeats, vec!["tendbha:backend", "tendbha:proxy"]);
}
