use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    /// Coordination node (GM) connection settings
    #[serde(default)]
    pub gm: GmConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub switch: SwitchConfig,
}

impl Config {
    /// Reject configurations the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.zone.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.zone must not be empty".into()));
        }
        if self.agent.db_types.is_empty() {
            return Err(ConfigError::Invalid(
                "agent.db_types must list at least one db type".into(),
            ));
        }
        if self.agent.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_concurrency must be greater than 0".into(),
            ));
        }
        if self.switch.route_check_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "switch.route_check_concurrency must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Agent Configuration
// ============================================================================

/// Detection agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Zone (city / IDC group) this agent probes
    #[serde(default)]
    pub zone: String,
    /// Cloud this agent runs in; coordination nodes in other clouds are ignored
    #[serde(default = "default_cloud")]
    pub cloud: String,
    /// Address the agent registers with the coordinator
    #[serde(default = "default_agent_ip")]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    /// Db types to detect, formatted `cluster_type:machine_type`.
    /// One agent loop runs per entry.
    #[serde(default)]
    pub db_types: Vec<String>,
    /// Seconds between instance / GM cache refreshes
    #[serde(default = "default_fetch_interval_secs")]
    pub fetch_interval_secs: u64,
    /// Maximum probes in flight during one sweep
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Pause between sweeps (milliseconds)
    #[serde(default = "default_sweep_pause_ms")]
    pub sweep_pause_ms: u64,
    /// Window during which a second GM report for the same IP is suppressed
    #[serde(default = "default_report_expire_secs")]
    pub report_expire_secs: u64,
}

fn default_cloud() -> String {
    "default".to_string()
}

fn default_agent_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_fetch_interval_secs() -> u64 {
    60
}

fn default_max_concurrency() -> usize {
    50
}

fn default_sweep_pause_ms() -> u64 {
    1000
}

fn default_report_expire_secs() -> u64 {
    600
}

impl AgentConfig {
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    pub fn sweep_pause(&self) -> Duration {
        Duration::from_millis(self.sweep_pause_ms)
    }

    pub fn report_expire(&self) -> Duration {
        Duration::from_secs(self.report_expire_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            zone: String::new(),
            cloud: default_cloud(),
            ip: default_agent_ip(),
            port: 0,
            db_types: Vec::new(),
            fetch_interval_secs: default_fetch_interval_secs(),
            max_concurrency: default_max_concurrency(),
            sweep_pause_ms: default_sweep_pause_ms(),
            report_expire_secs: default_report_expire_secs(),
        }
    }
}

// ============================================================================
// GM Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct GmConfig {
    /// Nodes not seen in the coordinator's list for this long are evicted
    #[serde(default = "default_evict_after_secs")]
    pub evict_after_secs: u64,
    /// Fixed delay between reconnect attempts for a broken node
    #[serde(default = "default_repair_delay_ms")]
    pub repair_delay_ms: u64,
    #[serde(default = "default_gm_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_gm_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_evict_after_secs() -> u64 {
    30 * 60
}

fn default_repair_delay_ms() -> u64 {
    10_000
}

fn default_gm_connect_timeout_ms() -> u64 {
    3000
}

fn default_gm_send_timeout_ms() -> u64 {
    5000
}

impl GmConfig {
    pub fn evict_after(&self) -> Duration {
        Duration::from_secs(self.evict_after_secs)
    }

    pub fn repair_delay(&self) -> Duration {
        Duration::from_millis(self.repair_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for GmConfig {
    fn default() -> Self {
        Self {
            evict_after_secs: default_evict_after_secs(),
            repair_delay_ms: default_repair_delay_ms(),
            connect_timeout_ms: default_gm_connect_timeout_ms(),
            send_timeout_ms: default_gm_send_timeout_ms(),
        }
    }
}

// ============================================================================
// Coordinator Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Base URL of the coordinator / CMDB API
    #[serde(default = "default_coordinator_url")]
    pub url: String,
    #[serde(default = "default_coordinator_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_coordinator_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_coordinator_timeout_ms() -> u64 {
    5000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: default_coordinator_url(),
            timeout_ms: default_coordinator_timeout_ms(),
        }
    }
}

// ============================================================================
// Probe Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Timeout for a single probe (milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_probe_user() -> String {
    "dbha".to_string()
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            user: default_probe_user(),
            password: String::new(),
        }
    }
}

// ============================================================================
// Switch Configuration
// ============================================================================

/// What a failed audit write means for a failover attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditPolicy {
    /// Audit failures are logged and otherwise ignored
    #[default]
    BestEffort,
    /// A switch refuses to start when its opening audit row cannot be written
    Strict,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchConfig {
    #[serde(default)]
    pub audit_policy: AuditPolicy,
    /// Parallelism when verifying routes on every spider node
    #[serde(default = "default_route_check_concurrency")]
    pub route_check_concurrency: usize,
    #[serde(default = "default_control_connect_timeout_ms")]
    pub control_connect_timeout_ms: u64,
    #[serde(default = "default_control_user")]
    pub control_user: String,
    #[serde(default)]
    pub control_password: String,
    /// Credentials survivors use to replicate from a newly promoted primary
    #[serde(default = "default_replication_user")]
    pub replication_user: String,
    #[serde(default)]
    pub replication_password: String,
    #[serde(default = "default_name_service_timeout_ms")]
    pub name_service_timeout_ms: u64,
}

fn default_route_check_concurrency() -> usize {
    5
}

fn default_control_connect_timeout_ms() -> u64 {
    5000
}

fn default_control_user() -> String {
    "dbha".to_string()
}

fn default_replication_user() -> String {
    "repl".to_string()
}

fn default_name_service_timeout_ms() -> u64 {
    10_000
}

impl SwitchConfig {
    pub fn control_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.control_connect_timeout_ms)
    }

    pub fn name_service_timeout(&self) -> Duration {
        Duration::from_millis(self.name_service_timeout_ms)
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            audit_policy: AuditPolicy::default(),
            route_check_concurrency: default_route_check_concurrency(),
            control_connect_timeout_ms: default_control_connect_timeout_ms(),
            control_user: default_control_user(),
            control_password: String::new(),
            replication_user: default_replication_user(),
            replication_password: String::new(),
            name_service_timeout_ms: default_name_service_timeout_ms(),
        }
    }
}
