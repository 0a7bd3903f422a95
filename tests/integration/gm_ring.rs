//! Ring delivery with failing coordination nodes

use std::sync::Arc;

use dbha::detect::{InstanceStatus, MonitorAgent};
use dbha::gm::hash_index;
use dbha::testing::{record, TestContext};

use crate::{gm_node, wait_until};

const RING: [&str; 3] = ["10.1.0.1", "10.1.0.2", "10.1.0.3"];

fn ring_context(failed_ip: &str) -> TestContext {
    let ctx = TestContext::new();
    ctx.coordinator.set_instances(vec![record(failed_ip, 3306)]);
    ctx.coordinator
        .set_gm_nodes(RING.iter().rev().map(|ip| gm_node(ip, 50000)).collect());
    ctx.probes.set_status(failed_ip, InstanceStatus::DbCheckFailed);
    ctx
}

#[tokio::test]
async fn test_broken_node_is_skipped_and_repaired() {
    let failed_ip = "10.0.0.7";
    let home = RING[hash_index(failed_ip, RING.len())];
    let next = RING[(hash_index(failed_ip, RING.len()) + 1) % RING.len()];

    let ctx = ring_context(failed_ip);
    let agent = Arc::new(MonitorAgent::new(ctx.context(), "tendbha:backend"));
    agent.refresh_instance_cache().await;
    agent.refresh_gm_cache().await;

    ctx.gm.fail_sends(home);
    ctx.gm.refuse_connect(home);
    let summary = agent.run_once().await;
    assert_eq!(summary.unhealthy, 1);

    assert_eq!(ctx.gm.send_attempts(), vec![home.to_string(), next.to_string()]);
    assert_eq!(ctx.gm.reports_to(next), 1);
    let deliveries = ctx.audit.gm_deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].gm_ip, next);
    assert!(agent.repairs().is_repairing(home));

    ctx.gm.heal(home);
    let repairs = agent.clone();
    assert!(wait_until(move || !repairs.repairs().is_repairing(home)).await);
}

#[tokio::test]
async fn test_exhausted_ring_retries_next_sweep() {
    let failed_ip = "10.0.0.8";
    let ctx = ring_context(failed_ip);
    let agent = Arc::new(MonitorAgent::new(ctx.context(), "tendbha:backend"));
    agent.refresh_instance_cache().await;
    agent.refresh_gm_cache().await;

    for ip in RING {
        ctx.gm.fail_sends(ip);
        ctx.gm.refuse_connect(ip);
    }
    agent.run_once().await;
    assert!(ctx.audit.gm_deliveries().is_empty());
    assert!(!agent.report_cache().is_suppressed(failed_ip));

    let mut attempts = ctx.gm.send_attempts();
    attempts.sort();
    assert_eq!(attempts, RING.to_vec());

    for ip in RING {
        ctx.gm.heal(ip);
    }
    let repairs = agent.clone();
    assert!(wait_until(move || repairs.repairs().active() == 0).await);

    agent.run_once().await;
    assert_eq!(ctx.audit.gm_deliveries().len(), 1);
    assert!(agent.report_cache().is_suppressed(failed_ip));
}

#[tokio::test]
async fn test_same_zone_and_foreign_cloud_nodes_are_ignored() {
    let ctx = TestContext::new();
    let mut same_zone = gm_node("10.1.0.9", 50000);
    same_zone.zone = ctx.config.agent.zone.clone();
    let mut foreign_cloud = gm_node("10.1.0.8", 50000);
    foreign_cloud.cloud = "other".into();
    ctx.coordinator
        .set_gm_nodes(vec![gm_node("10.1.0.1", 50000), same_zone, foreign_cloud]);

    let agent = Arc::new(MonitorAgent::new(ctx.context(), "tendbha:backend"));
    agent.refresh_gm_cache().await;

    let nodes: Vec<String> = agent.gm_nodes().iter().map(|n| n.ip.clone()).collect();
    assert_eq!(nodes, vec!["10.1.0.1"]);
    assert_eq!(ctx.gm.connects_to("10.1.0.9"), 0);
}
