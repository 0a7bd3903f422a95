//! Detection agent for one (zone, db type) partition
//!
//! Each sweep:
//! 1. Refresh the instance set and the GM node set (time-gated)
//! 2. Probe every instance with bounded concurrency and wait for all of them
//! 3. Write the heartbeat row
//!
//! The instance map and the GM map share one `RwLock`. That lock is never
//! held across an await; per-connection locks are only taken after it has
//! been released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng as _;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::context::HaContext;
use crate::coordinator::{
    CoordinatorError, DetectLogRow, DetectStatusRow, GmDeliveryRow, HeartbeatRow, InstanceQuery,
};
use crate::gm::{report_to_ring, ring_order, Delivery, GMConnection, GmError, RepairSupervisor};
use crate::metrics::metrics;

use super::cache::ReportCache;
use super::probe::{cluster_type_of, ProbeError, ProbeOutcome};
use super::state::{build_instance_map, DBInstance, DetectResult, InstanceStatus};

#[derive(Default)]
struct AgentCache {
    /// ip -> instance for the current sweep
    instances: HashMap<String, DBInstance>,
    /// gm ip -> connection
    gm: HashMap<String, Arc<GMConnection>>,
    last_instance_fetch: Option<Instant>,
    last_gm_fetch: Option<Instant>,
}

/// Result of one completed sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub probed: usize,
    pub unhealthy: usize,
    pub elapsed: Duration,
}

pub struct MonitorAgent {
    db_type: String,
    ctx: Arc<HaContext>,
    cache: RwLock<AgentCache>,
    reports: ReportCache,
    repairs: RepairSupervisor,
}

impl MonitorAgent {
    pub fn new(ctx: Arc<HaContext>, db_type: impl Into<String>) -> Self {
        let repairs = RepairSupervisor::new(
            ctx.gm_connector.clone(),
            ctx.config.gm.repair_delay(),
            ctx.config.gm.connect_timeout(),
        );
        Self {
            db_type: db_type.into(),
            ctx,
            cache: RwLock::new(AgentCache::default()),
            reports: ReportCache::new(),
            repairs,
        }
    }

    pub fn db_type(&self) -> &str {
        &self.db_type
    }

    /// Snapshot of the current instance set
    pub fn instances(&self) -> Vec<DBInstance> {
        self.cache.read().instances.values().cloned().collect()
    }

    /// Snapshot of the known GM nodes
    pub fn gm_nodes(&self) -> Vec<Arc<GMConnection>> {
        self.cache.read().gm.values().cloned().collect()
    }

    pub fn report_cache(&self) -> &ReportCache {
        &self.reports
    }

    pub fn repairs(&self) -> &RepairSupervisor {
        &self.repairs
    }

    /// Pull this agent's partition of the fleet and replace the instance set
    pub async fn fetch_db_instance(&self) -> Result<usize, CoordinatorError> {
        let agent = &self.ctx.config.agent;
        let partition = self
            .ctx
            .coordinator
            .fetch_partition(&agent.zone, &self.db_type)
            .await?;

        let query = InstanceQuery {
            zone: agent.zone.clone(),
            db_type: self.db_type.clone(),
            cluster_type: cluster_type_of(&self.db_type).to_string(),
            modulus: partition.modulus,
            value: partition.value,
        };
        let records = self.ctx.coordinator.fetch_instances(&query).await?;
        let muted = self.ctx.coordinator.fetch_muted_ips().await?;

        let instances = build_instance_map(records, &muted);
        let count = instances.len();
        self.cache.write().instances = instances;

        info!(
            db_type = %self.db_type,
            modulus = partition.modulus,
            value = partition.value,
            instances = count,
            "Instance cache refreshed"
        );
        Ok(count)
    }

    /// Pull the live GM nodes, open connections to new ones and refresh known ones.
    ///
    /// Nodes in the agent's own zone or in another cloud are ignored.
    pub async fn fetch_gm_instance(&self) -> Result<usize, CoordinatorError> {
        let agent = &self.ctx.config.agent;
        let gm_config = &self.ctx.config.gm;
        let nodes = self.ctx.coordinator.fetch_gm_nodes().await?;
        let now = Instant::now();

        let mut accepted = 0;
        for node in nodes {
            if node.zone == agent.zone || node.cloud != agent.cloud {
                debug!(gm = %node.ip, zone = %node.zone, cloud = %node.cloud, "Ignoring GM node");
                continue;
            }
            accepted += 1;

            let known = self.cache.read().gm.get(&node.ip).cloned();
            let conn = match known {
                Some(conn) => {
                    conn.refresh(now).await;
                    conn
                }
                None => {
                    let opened = Arc::new(
                        GMConnection::open(
                            node.ip.clone(),
                            node.port,
                            self.ctx.gm_connector.as_ref(),
                            gm_config.connect_timeout(),
                        )
                        .await,
                    );
                    let (conn, inserted) = {
                        let mut cache = self.cache.write();
                        match cache.gm.get(&node.ip) {
                            Some(existing) => (existing.clone(), false),
                            None => {
                                cache.gm.insert(node.ip.clone(), opened.clone());
                                (opened.clone(), true)
                            }
                        }
                    };
                    if inserted {
                        info!(gm = %conn.addr(), "Discovered GM node");
                    } else {
                        opened.close().await;
                    }
                    conn
                }
            };

            if !conn.is_connected().await {
                self.repairs.spawn_repair(conn);
            }
        }
        Ok(accepted)
    }

    fn is_due(last: Option<Instant>, interval: Duration) -> bool {
        last.map_or(true, |at| at.elapsed() >= interval)
    }

    /// Refresh the instance set if the fetch interval has elapsed.
    ///
    /// A failed refresh keeps the previous set. A successful one clears the
    /// report dedup cache.
    pub async fn refresh_instance_cache(&self) {
        let due = Self::is_due(
            self.cache.read().last_instance_fetch,
            self.ctx.config.agent.fetch_interval(),
        );
        if !due {
            return;
        }
        match self.fetch_db_instance().await {
            Ok(_) => {
                self.reports.clear();
                self.cache.write().last_instance_fetch = Some(Instant::now());
            }
            Err(e) => {
                warn!(db_type = %self.db_type, error = %e, "Instance refresh failed, keeping stale cache");
            }
        }
    }

    /// Refresh the GM set if due, then evict nodes that stopped being listed
    pub async fn refresh_gm_cache(&self) {
        let due = Self::is_due(
            self.cache.read().last_gm_fetch,
            self.ctx.config.agent.fetch_interval(),
        );
        if due {
            match self.fetch_gm_instance().await {
                Ok(_) => self.cache.write().last_gm_fetch = Some(Instant::now()),
                Err(e) => {
                    warn!(db_type = %self.db_type, error = %e, "GM refresh failed, keeping stale cache");
                }
            }
        }

        self.evict_stale_gm(Instant::now()).await;

        let nodes = self.gm_nodes();
        if nodes.is_empty() {
            warn!(db_type = %self.db_type, "No GM nodes available");
        }
        let mut connected = 0;
        for conn in &nodes {
            if conn.is_connected().await {
                connected += 1;
            }
        }
        metrics().set_gm_connected(&self.db_type, connected);
    }

    /// Close and drop every GM node not refreshed within the eviction window
    pub async fn evict_stale_gm(&self, now: Instant) -> Vec<String> {
        let evict_after = self.ctx.config.gm.evict_after();
        let mut stale = Vec::new();
        for conn in self.gm_nodes() {
            let last = conn.last_fetch_time().await;
            if now.saturating_duration_since(last) > evict_after {
                stale.push(conn);
            }
        }
        if stale.is_empty() {
            return Vec::new();
        }

        {
            let mut cache = self.cache.write();
            for conn in &stale {
                cache.gm.remove(&conn.ip);
            }
        }

        let mut evicted = Vec::with_capacity(stale.len());
        for conn in stale {
            self.repairs.cancel(&conn.ip);
            conn.close().await;
            info!(gm = %conn.addr(), "Evicted stale GM node");
            evicted.push(conn.ip.clone());
        }
        evicted
    }

    /// Probe every instance, at most `max_concurrency` at a time, and wait
    /// for all of them. A failing probe never affects its siblings.
    pub async fn process(self: &Arc<Self>, instances: Vec<DBInstance>) -> Vec<DBInstance> {
        let semaphore = Arc::new(Semaphore::new(self.ctx.config.agent.max_concurrency));
        let mut tasks = JoinSet::new();

        for instance in instances {
            let agent = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                agent.do_detect_single(instance).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(instance) => results.push(instance),
                Err(e) => error!(db_type = %self.db_type, error = %e, "Detection task aborted"),
            }
        }
        results
    }

    async fn run_probe(&self, instance: &DBInstance) -> ProbeOutcome {
        let Some(probe) = self.ctx.probes.probe_for(&instance.db_type) else {
            return ProbeOutcome::new(InstanceStatus::Unprobed, "no probe for db type");
        };
        let probe_timeout = self.ctx.config.probe.timeout();
        match timeout(probe_timeout, probe.detect(instance)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ProbeOutcome::new(InstanceStatus::DbCheckFailed, e.to_string()),
            Err(_) => {
                let e = ProbeError::Timeout {
                    addr: instance.addr(),
                    timeout: probe_timeout,
                };
                ProbeOutcome::new(InstanceStatus::DbCheckFailed, e.to_string())
            }
        }
    }

    /// Probe one instance and publish the outcome
    pub async fn do_detect_single(&self, mut instance: DBInstance) -> DBInstance {
        let outcome = self.run_probe(&instance).await;
        instance.status = outcome.status;
        metrics().record_probe(&self.db_type, instance.status.as_str());

        let agent_ip = &self.ctx.config.agent.ip;
        let log = DetectLogRow {
            agent_ip: agent_ip.clone(),
            ip: instance.ip.clone(),
            port: instance.port,
            db_type: instance.db_type.clone(),
            status: instance.status.to_string(),
            comment: outcome.detail.clone(),
            at: Utc::now(),
        };
        if let Err(e) = self.ctx.audit.record_detect_log(&log).await {
            warn!(addr = %instance.addr(), error = %e, "Failed to write detection log");
        }

        if !instance.status.needs_report() {
            debug!(addr = %instance.addr(), status = %instance.status, "Instance checked");
            return instance;
        }

        warn!(addr = %instance.addr(), status = %instance.status, detail = %outcome.detail, "Instance unhealthy");
        let status_row = DetectStatusRow {
            agent_ip: agent_ip.clone(),
            ip: instance.ip.clone(),
            port: instance.port,
            db_type: instance.db_type.clone(),
            status: instance.status.to_string(),
            at: Utc::now(),
        };
        if let Err(e) = self.ctx.audit.update_detect_status(&status_row).await {
            warn!(addr = %instance.addr(), error = %e, "Failed to update detection status");
        }

        // Exhaustion is already logged; the next sweep retries
        let _ = self.report_gm(&instance).await;
        instance
    }

    /// Deliver an unhealthy result to one GM node.
    ///
    /// Returns `Ok(None)` when an earlier report for the same IP is still
    /// inside the dedup window.
    pub async fn report_gm(&self, instance: &DBInstance) -> Result<Option<Delivery>, GmError> {
        if self.reports.is_suppressed(&instance.ip) {
            debug!(addr = %instance.addr(), "GM report suppressed");
            metrics().record_gm_report("suppressed");
            return Ok(None);
        }

        let agent_ip = &self.ctx.config.agent.ip;
        let payload = serde_json::to_vec(&DetectResult::new(instance, agent_ip)).map_err(|e| {
            metrics().record_gm_report("encode_error");
            GmError::Encode(e.to_string())
        })?;

        let ring = ring_order(self.gm_nodes());
        let delivery = match report_to_ring(
            &ring,
            &instance.ip,
            &self.db_type,
            &payload,
            self.ctx.config.gm.send_timeout(),
            |conn| self.repairs.spawn_repair(conn.clone()),
        )
        .await
        {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(addr = %instance.addr(), error = %e, "Failed to deliver report to any GM");
                metrics().record_gm_report("exhausted");
                return Err(e);
            }
        };

        self.reports
            .record(&instance.ip, self.ctx.config.agent.report_expire());
        metrics().record_gm_report("delivered");
        info!(
            addr = %instance.addr(),
            gm = %format!("{}:{}", delivery.gm_ip, delivery.gm_port),
            attempts = delivery.attempts,
            "Reported instance to GM"
        );

        let row = GmDeliveryRow {
            agent_ip: agent_ip.clone(),
            ip: instance.ip.clone(),
            port: instance.port,
            db_type: instance.db_type.clone(),
            status: instance.status.to_string(),
            gm_ip: delivery.gm_ip.clone(),
            gm_port: delivery.gm_port,
            at: Utc::now(),
        };
        if let Err(e) = self.ctx.audit.record_gm_delivery(&row).await {
            warn!(addr = %instance.addr(), error = %e, "Failed to record GM delivery");
        }
        Ok(Some(delivery))
    }

    /// Refresh, probe everything, write the heartbeat
    pub async fn run_once(self: &Arc<Self>) -> SweepSummary {
        let started = Instant::now();
        self.refresh_instance_cache().await;
        self.refresh_gm_cache().await;

        let results = self.process(self.instances()).await;
        let elapsed = started.elapsed();
        let summary = SweepSummary {
            probed: results.len(),
            unhealthy: results.iter().filter(|i| i.status.needs_report()).count(),
            elapsed,
        };

        metrics().record_sweep(&self.db_type, summary.probed, elapsed.as_secs_f64());
        let agent = &self.ctx.config.agent;
        let heartbeat = HeartbeatRow {
            agent_ip: agent.ip.clone(),
            zone: agent.zone.clone(),
            db_type: self.db_type.clone(),
            instance_count: summary.probed,
            sweep_millis: elapsed.as_millis() as u64,
            at: Utc::now(),
        };
        if let Err(e) = self.ctx.audit.record_heartbeat(&heartbeat).await {
            warn!(db_type = %self.db_type, error = %e, "Failed to write heartbeat");
        }
        debug!(
            db_type = %self.db_type,
            probed = summary.probed,
            unhealthy = summary.unhealthy,
            elapsed_ms = elapsed.as_millis() as u64,
            "Sweep complete"
        );
        summary
    }

    /// Sweep forever. The next sweep starts only after the previous one returned.
    pub async fn run(self: Arc<Self>) {
        let pause = self.ctx.config.agent.sweep_pause();
        let stagger = pause.as_millis() as u64;
        if stagger > 0 {
            let initial_delay = rand::thread_rng().gen_range(0..stagger);
            tokio::time::sleep(Duration::from_millis(initial_delay)).await;
        }

        info!(db_type = %self.db_type, "Detection agent started");
        loop {
            self.run_once().await;
            tokio::time::sleep(pause).await;
        }
    }
}
