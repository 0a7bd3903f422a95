//! In-memory collaborators for tests
//!
//! Every fake records the calls it receives so tests can assert on them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::Config;
use crate::context::HaContext;
use crate::coordinator::{
    AgentRegistration, AuditSink, ClusterMember, Coordinator, CoordinatorError, DetectLogRow,
    DetectStatusRow, GmDeliveryRow, GmNode, HeartbeatRow, InstanceQuery, InstanceRecord,
    Partition, SwitchLogRow,
};
use crate::detect::{DBInstance, DetectionProbe, InstanceStatus, ProbeError, ProbeFactory, ProbeOutcome};
use crate::gm::{GmChannel, GmConnector, GmError};
use crate::mysql::ConnectionError;
use crate::switch::tdbctl::{ControlError, ControlNode, ControlNodeConnector, ReplicationStatus, RouteEntry};
use crate::switch::{Binding, NameServiceError, NameServiceProvider, Provider, SwitchRequest};

/// Agent config for tests: zone `shenzhen`, cloud `default`, short timeouts
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.agent.zone = "shenzhen".to_string();
    config.agent.ip = "10.200.0.1".to_string();
    config.agent.db_types = vec!["tendbha:backend".to_string()];
    config.agent.sweep_pause_ms = 10;
    config.gm.repair_delay_ms = 20;
    config.gm.connect_timeout_ms = 500;
    config.gm.send_timeout_ms = 500;
    config.probe.timeout_ms = 500;
    config.switch.control_connect_timeout_ms = 500;
    config.switch.name_service_timeout_ms = 500;
    config
}

pub fn record(ip: &str, port: u16) -> InstanceRecord {
    InstanceRecord {
        ip: ip.to_string(),
        port,
        db_type: "tendbha:backend".to_string(),
        cluster_type: "tendbha".to_string(),
        cluster: "cluster-a".to_string(),
        app: "app-a".to_string(),
        idc: "idc-1".to_string(),
    }
}

/// A failed instance at 10.0.0.1:3306 in `cluster-a` with no bindings
pub fn switch_request(cluster_type: &str, meta_type: &str) -> SwitchRequest {
    SwitchRequest {
        ip: "10.0.0.1".to_string(),
        port: 3306,
        idc: "idc-1".to_string(),
        status: InstanceStatus::DbCheckFailed.to_string(),
        app: "app-a".to_string(),
        cluster_type: cluster_type.to_string(),
        meta_type: meta_type.to_string(),
        check_id: 1,
        cluster: "cluster-a".to_string(),
        binds: Default::default(),
    }
}

pub fn member(ip: &str, port: u16, machine_type: &str, role: &str) -> ClusterMember {
    ClusterMember {
        ip: ip.to_string(),
        port,
        machine_type: machine_type.to_string(),
        role: role.to_string(),
        status: "running".to_string(),
    }
}

pub fn route(server_name: &str, host: &str, port: u16, wrapper: &str) -> RouteEntry {
    RouteEntry {
        server_name: server_name.to_string(),
        host: host.to_string(),
        port,
        wrapper: wrapper.to_string(),
    }
}

fn unavailable(path: &str) -> CoordinatorError {
    CoordinatorError::Request {
        path: path.to_string(),
        message: "coordinator unavailable".to_string(),
    }
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Default)]
struct CoordinatorState {
    partition: Option<Partition>,
    instances: Vec<InstanceRecord>,
    muted: Vec<String>,
    gm_nodes: Vec<GmNode>,
    members: HashMap<String, Vec<ClusterMember>>,
    failing: bool,
    last_query: Option<InstanceQuery>,
    registrations: Vec<AgentRegistration>,
}

#[derive(Default)]
pub struct FakeCoordinator {
    state: Mutex<CoordinatorState>,
}

impl FakeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_partition(&self, modulus: u32, value: u32) {
        self.state.lock().partition = Some(Partition { modulus, value });
    }

    pub fn set_instances(&self, instances: Vec<InstanceRecord>) {
        self.state.lock().instances = instances;
    }

    pub fn set_muted(&self, muted: Vec<String>) {
        self.state.lock().muted = muted;
    }

    pub fn set_gm_nodes(&self, nodes: Vec<GmNode>) {
        self.state.lock().gm_nodes = nodes;
    }

    pub fn set_members(&self, cluster: &str, members: Vec<ClusterMember>) {
        self.state.lock().members.insert(cluster.to_string(), members);
    }

    /// Make every call fail
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn last_query(&self) -> Option<InstanceQuery> {
        self.state.lock().last_query.clone()
    }

    pub fn registrations(&self) -> Vec<AgentRegistration> {
        self.state.lock().registrations.clone()
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn register_agent(&self, agent: &AgentRegistration) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(unavailable("/agents/register"));
        }
        state.registrations.push(agent.clone());
        Ok(())
    }

    async fn fetch_partition(&self, _zone: &str, _db_type: &str) -> Result<Partition, CoordinatorError> {
        let state = self.state.lock();
        if state.failing {
            return Err(unavailable("/partition"));
        }
        Ok(state.partition.unwrap_or(Partition { modulus: 1, value: 0 }))
    }

    async fn fetch_instances(&self, query: &InstanceQuery) -> Result<Vec<InstanceRecord>, CoordinatorError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(unavailable("/instances/query"));
        }
        state.last_query = Some(query.clone());
        Ok(state.instances.clone())
    }

    async fn fetch_gm_nodes(&self) -> Result<Vec<GmNode>, CoordinatorError> {
        let state = self.state.lock();
        if state.failing {
            return Err(unavailable("/gm/nodes"));
        }
        Ok(state.gm_nodes.clone())
    }

    async fn fetch_muted_ips(&self) -> Result<Vec<String>, CoordinatorError> {
        let state = self.state.lock();
        if state.failing {
            return Err(unavailable("/mute"));
        }
        Ok(state.muted.clone())
    }

    async fn fetch_cluster_members(&self, cluster: &str) -> Result<Vec<ClusterMember>, CoordinatorError> {
        let state = self.state.lock();
        if state.failing {
            return Err(unavailable("/clusters"));
        }
        Ok(state.members.get(cluster).cloned().unwrap_or_default())
    }
}

// ============================================================================
// Audit sink
// ============================================================================

#[derive(Default)]
struct AuditState {
    failing: bool,
    heartbeats: Vec<HeartbeatRow>,
    detect_logs: Vec<DetectLogRow>,
    status_rows: Vec<DetectStatusRow>,
    gm_deliveries: Vec<GmDeliveryRow>,
    switch_logs: Vec<SwitchLogRow>,
}

#[derive(Default)]
pub struct FakeAuditSink {
    state: Mutex<AuditState>,
}

impl FakeAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatRow> {
        self.state.lock().heartbeats.clone()
    }

    pub fn detect_logs(&self) -> Vec<DetectLogRow> {
        self.state.lock().detect_logs.clone()
    }

    pub fn status_rows(&self) -> Vec<DetectStatusRow> {
        self.state.lock().status_rows.clone()
    }

    pub fn gm_deliveries(&self) -> Vec<GmDeliveryRow> {
        self.state.lock().gm_deliveries.clone()
    }

    pub fn switch_logs(&self) -> Vec<SwitchLogRow> {
        self.state.lock().switch_logs.clone()
    }

    fn write<F: FnOnce(&mut AuditState)>(&self, path: &str, f: F) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(unavailable(path));
        }
        f(&mut state);
        Ok(())
    }
}

#[async_trait]
impl AuditSink for FakeAuditSink {
    async fn record_heartbeat(&self, row: &HeartbeatRow) -> Result<(), CoordinatorError> {
        self.write("/audit/heartbeat", |s| s.heartbeats.push(row.clone()))
    }

    async fn record_detect_log(&self, row: &DetectLogRow) -> Result<(), CoordinatorError> {
        self.write("/audit/detect", |s| s.detect_logs.push(row.clone()))
    }

    async fn update_detect_status(&self, row: &DetectStatusRow) -> Result<(), CoordinatorError> {
        self.write("/audit/status", |s| s.status_rows.push(row.clone()))
    }

    async fn record_gm_delivery(&self, row: &GmDeliveryRow) -> Result<(), CoordinatorError> {
        self.write("/audit/gm", |s| s.gm_deliveries.push(row.clone()))
    }

    async fn record_switch_log(&self, row: &SwitchLogRow) -> Result<(), CoordinatorError> {
        self.write("/audit/switch", |s| s.switch_logs.push(row.clone()))
    }
}

// ============================================================================
// Probes
// ============================================================================

/// Reports `DbCheckSuccess` unless a status was set for the IP
#[derive(Default)]
pub struct FakeProbe {
    statuses: Mutex<HashMap<String, InstanceStatus>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl DetectionProbe for FakeProbe {
    async fn detect(&self, instance: &DBInstance) -> Result<ProbeOutcome, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let status = self
            .statuses
            .lock()
            .get(&instance.ip)
            .copied()
            .unwrap_or(InstanceStatus::DbCheckSuccess);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ProbeOutcome::new(status, "fake probe"))
    }
}

#[derive(Default)]
pub struct FakeProbeFactory {
    probe: Arc<FakeProbe>,
}

impl FakeProbeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, ip: &str, status: InstanceStatus) {
        self.probe.statuses.lock().insert(ip.to_string(), status);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.probe.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.probe.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.probe.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.probe.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ProbeFactory for FakeProbeFactory {
    fn probe_for(&self, _db_type: &str) -> Option<Arc<dyn DetectionProbe>> {
        Some(self.probe.clone())
    }
}

// ============================================================================
// GM transport
// ============================================================================

#[derive(Default)]
struct GmState {
    refused: HashSet<String>,
    failing: HashSet<String>,
    connects: HashMap<String, usize>,
    reports: HashMap<String, usize>,
    /// Every send attempt in order, successful or not
    attempts: Vec<String>,
}

#[derive(Default)]
pub struct FakeGmConnector {
    state: Arc<Mutex<GmState>>,
}

impl FakeGmConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new connections to `ip`
    pub fn refuse_connect(&self, ip: &str) {
        self.state.lock().refused.insert(ip.to_string());
    }

    /// Fail every send to `ip` on open channels
    pub fn fail_sends(&self, ip: &str) {
        self.state.lock().failing.insert(ip.to_string());
    }

    pub fn heal(&self, ip: &str) {
        let mut state = self.state.lock();
        state.refused.remove(ip);
        state.failing.remove(ip);
    }

    pub fn connects_to(&self, ip: &str) -> usize {
        self.state.lock().connects.get(ip).copied().unwrap_or(0)
    }

    /// Successful reports delivered to `ip`
    pub fn reports_to(&self, ip: &str) -> usize {
        self.state.lock().reports.get(ip).copied().unwrap_or(0)
    }

    pub fn send_attempts(&self) -> Vec<String> {
        self.state.lock().attempts.clone()
    }
}

#[async_trait]
impl GmConnector for FakeGmConnector {
    async fn connect(&self, ip: &str, port: u16) -> Result<Box<dyn GmChannel>, GmError> {
        let mut state = self.state.lock();
        *state.connects.entry(ip.to_string()).or_default() += 1;
        if state.refused.contains(ip) {
            return Err(GmError::Connect {
                addr: format!("{}:{}", ip, port),
                message: "connection refused".to_string(),
            });
        }
        Ok(Box::new(FakeGmChannel {
            ip: ip.to_string(),
            port,
            state: self.state.clone(),
        }))
    }
}

struct FakeGmChannel {
    ip: String,
    port: u16,
    state: Arc<Mutex<GmState>>,
}

#[async_trait]
impl GmChannel for FakeGmChannel {
    async fn report_instance(&mut self, _detect_type: &str, _payload: &[u8]) -> Result<(), GmError> {
        let mut state = self.state.lock();
        state.attempts.push(self.ip.clone());
        if state.failing.contains(&self.ip) {
            return Err(GmError::Send {
                addr: format!("{}:{}", self.ip, self.port),
                message: "broken pipe".to_string(),
            });
        }
        *state.reports.entry(self.ip.clone()).or_default() += 1;
        Ok(())
    }

    async fn close(&mut self) {}
}

// ============================================================================
// Name services
// ============================================================================

#[derive(Default)]
struct NameServiceState {
    bound: HashMap<String, usize>,
    failing: bool,
    registered: Vec<String>,
    deregistered: Vec<String>,
}

/// Names without an explicit count report two bound addresses
pub struct FakeNameService {
    kind: Provider,
    state: Mutex<NameServiceState>,
}

impl FakeNameService {
    pub fn new(kind: Provider) -> Self {
        Self {
            kind,
            state: Mutex::new(NameServiceState::default()),
        }
    }

    pub fn set_bound(&self, name: &str, count: usize) {
        self.state.lock().bound.insert(name.to_string(), count);
    }

    /// Fail register and deregister calls
    pub fn fail_calls(&self) {
        self.state.lock().failing = true;
    }

    pub fn registered(&self) -> Vec<String> {
        self.state.lock().registered.clone()
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.state.lock().deregistered.clone()
    }

    fn failure(&self, name: &str) -> NameServiceError {
        NameServiceError::Provider {
            provider: self.kind,
            name: name.to_string(),
            message: "provider unavailable".to_string(),
        }
    }
}

#[async_trait]
impl NameServiceProvider for FakeNameService {
    fn kind(&self) -> Provider {
        self.kind
    }

    async fn register(&self, binding: &Binding) -> Result<(), NameServiceError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(self.failure(&binding.name));
        }
        state.registered.push(binding.name.clone());
        Ok(())
    }

    async fn deregister(&self, binding: &Binding) -> Result<(), NameServiceError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(self.failure(&binding.name));
        }
        state.deregistered.push(binding.name.clone());
        Ok(())
    }

    async fn bound_address_count(&self, name: &str) -> Result<usize, NameServiceError> {
        Ok(self.state.lock().bound.get(name).copied().unwrap_or(2))
    }
}

// ============================================================================
// Control-table cluster
// ============================================================================

/// State of one simulated control or spider node
#[derive(Debug, Clone, Default)]
pub struct FakeNode {
    pub is_primary: bool,
    pub replication: Option<ReplicationStatus>,
    pub routes: Vec<RouteEntry>,
    pub unreachable: bool,
    /// Operation names that fail on this node (e.g. `change_source`)
    pub failing_ops: Vec<String>,
}

impl FakeNode {
    pub fn primary(routes: Vec<RouteEntry>) -> Self {
        Self {
            is_primary: true,
            routes,
            ..Self::default()
        }
    }

    /// A running secondary replicating from `source` at the given progress
    pub fn secondary(source: (&str, u16), relay_index: u64, exec_pos: u64, routes: Vec<RouteEntry>) -> Self {
        Self {
            replication: Some(ReplicationStatus {
                source_host: source.0.to_string(),
                source_port: source.1,
                relay_index,
                exec_pos,
                sql_thread_running: true,
            }),
            routes,
            ..Self::default()
        }
    }

    pub fn spider(routes: Vec<RouteEntry>) -> Self {
        Self {
            routes,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct ControlState {
    nodes: HashMap<String, FakeNode>,
    /// `addr op` for every mutating operation, in order
    ops: Vec<String>,
}

#[derive(Default)]
pub struct FakeControlConnector {
    state: Arc<Mutex<ControlState>>,
}

impl FakeControlConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node(&self, addr: &str, node: FakeNode) {
        self.state.lock().nodes.insert(addr.to_string(), node);
    }

    pub fn node(&self, addr: &str) -> Option<FakeNode> {
        self.state.lock().nodes.get(addr).cloned()
    }

    pub fn set_unreachable(&self, addr: &str) {
        if let Some(node) = self.state.lock().nodes.get_mut(addr) {
            node.unreachable = true;
        }
    }

    pub fn fail_op(&self, addr: &str, op: &str) {
        if let Some(node) = self.state.lock().nodes.get_mut(addr) {
            node.failing_ops.push(op.to_string());
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }
}

#[async_trait]
impl ControlNodeConnector for FakeControlConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn ControlNode>, ControlError> {
        let addr = format!("{}:{}", host, port);
        let reachable = self
            .state
            .lock()
            .nodes
            .get(&addr)
            .map_or(false, |node| !node.unreachable);
        if !reachable {
            return Err(ControlError::Connect {
                addr,
                source: ConnectionError::Connect("connection refused".to_string()),
            });
        }
        Ok(Box::new(FakeControlNode {
            addr,
            state: self.state.clone(),
        }))
    }
}

struct FakeControlNode {
    addr: String,
    state: Arc<Mutex<ControlState>>,
}

impl FakeControlNode {
    /// Run `f` on this node's state, failing if `op` is scripted to fail
    fn with_node<T>(&self, op: &str, f: impl FnOnce(&mut ControlState, &str) -> T) -> Result<T, ControlError> {
        let mut state = self.state.lock();
        let failing = state
            .nodes
            .get(&self.addr)
            .map_or(true, |node| node.unreachable || node.failing_ops.iter().any(|o| o == op));
        if failing {
            return Err(ControlError::Query {
                addr: self.addr.clone(),
                sql: op.to_string(),
                source: ConnectionError::Disconnected,
            });
        }
        Ok(f(&mut state, &self.addr))
    }

    fn mutate(&self, op: &str, f: impl FnOnce(&mut ControlState, &str)) -> Result<(), ControlError> {
        self.with_node(op, |state, addr| {
            f(state, addr);
            state.ops.push(format!("{} {}", addr, op));
        })
    }
}

fn node_mut<'a>(state: &'a mut ControlState, addr: &str) -> &'a mut FakeNode {
    state.nodes.entry(addr.to_string()).or_default()
}

#[async_trait]
impl ControlNode for FakeControlNode {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn route_table(&mut self) -> Result<Vec<RouteEntry>, ControlError> {
        self.with_node("route_table", |state, addr| node_mut(state, addr).routes.clone())
    }

    async fn is_primary(&mut self) -> Result<bool, ControlError> {
        self.with_node("is_primary", |state, addr| node_mut(state, addr).is_primary)
    }

    async fn replication_status(&mut self) -> Result<Option<ReplicationStatus>, ControlError> {
        self.with_node("replication_status", |state, addr| {
            node_mut(state, addr).replication.clone()
        })
    }

    async fn enable_primary_force(&mut self) -> Result<(), ControlError> {
        self.mutate("enable_primary_force", |state, addr| {
            node_mut(state, addr).is_primary = true;
        })
    }

    async fn drop_route(&mut self, server_name: &str) -> Result<(), ControlError> {
        self.mutate("drop_route", |state, addr| {
            node_mut(state, addr)
                .routes
                .retain(|r| r.server_name != server_name);
        })
    }

    /// Copies this node's routes to every other node
    async fn flush_routing(&mut self) -> Result<(), ControlError> {
        self.mutate("flush_routing", |state, addr| {
            let routes = node_mut(state, addr).routes.clone();
            for node in state.nodes.values_mut() {
                node.routes = routes.clone();
            }
        })
    }

    async fn reset_replica(&mut self) -> Result<(), ControlError> {
        self.mutate("reset_replica", |state, addr| {
            node_mut(state, addr).replication = None;
        })
    }

    async fn change_source(
        &mut self,
        host: &str,
        port: u16,
        _user: &str,
        _password: &str,
    ) -> Result<(), ControlError> {
        self.mutate("change_source", |state, addr| {
            node_mut(state, addr).replication = Some(ReplicationStatus {
                source_host: host.to_string(),
                source_port: port,
                relay_index: 0,
                exec_pos: 0,
                sql_thread_running: true,
            });
        })
    }

    async fn close(self: Box<Self>) {}
}

// ============================================================================
// Context
// ============================================================================

/// Every fake wired into one [`HaContext`]
pub struct TestContext {
    pub config: Config,
    pub coordinator: Arc<FakeCoordinator>,
    pub audit: Arc<FakeAuditSink>,
    pub probes: Arc<FakeProbeFactory>,
    pub gm: Arc<FakeGmConnector>,
    pub dns: Arc<FakeNameService>,
    pub clb: Arc<FakeNameService>,
    pub polaris: Arc<FakeNameService>,
    pub control: Arc<FakeControlConnector>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            coordinator: Arc::new(FakeCoordinator::new()),
            audit: Arc::new(FakeAuditSink::new()),
            probes: Arc::new(FakeProbeFactory::new()),
            gm: Arc::new(FakeGmConnector::new()),
            dns: Arc::new(FakeNameService::new(Provider::Dns)),
            clb: Arc::new(FakeNameService::new(Provider::Clb)),
            polaris: Arc::new(FakeNameService::new(Provider::Polaris)),
            control: Arc::new(FakeControlConnector::new()),
        }
    }

    pub fn context(&self) -> Arc<HaContext> {
        let name_services: Vec<Arc<dyn NameServiceProvider>> =
            vec![self.dns.clone(), self.clb.clone(), self.polaris.clone()];
        Arc::new(HaContext {
            config: self.config.clone(),
            coordinator: self.coordinator.clone(),
            audit: self.audit.clone(),
            probes: self.probes.clone(),
            gm_connector: self.gm.clone(),
            name_services,
            control: self.control.clone(),
        })
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
