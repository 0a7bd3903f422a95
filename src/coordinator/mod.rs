//! Coordinator (CMDB) and audit sink interfaces
//!
//! The coordinator owns fleet metadata: which instances exist, how they are
//! partitioned across agents, which coordination nodes are alive and which
//! IPs an operator has muted. The audit sink receives durable rows
//! (heartbeats, detection logs, detection status, GM deliveries, switch logs).
//! Neither is persisted by this crate.

mod http;

pub use http::HttpCoordinator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coordinator / audit sink errors
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Coordinator request {path} failed: {message}")]
    Request { path: String, message: String },
    #[error("Coordinator returned {status} for {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },
    #[error("Failed to decode coordinator response for {path}: {message}")]
    Decode { path: String, message: String },
}

/// Identity an agent registers under at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub ip: String,
    pub port: u16,
    pub zone: String,
    pub cloud: String,
    pub db_types: Vec<String>,
}

/// Share of the fleet assigned to one agent: instances whose hash
/// satisfies `hash % modulus == value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub modulus: u32,
    pub value: u32,
}

/// Filter for fetching one agent's instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceQuery {
    pub zone: String,
    pub db_type: String,
    pub cluster_type: String,
    pub modulus: u32,
    pub value: u32,
}

/// Instance metadata as stored by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub ip: String,
    pub port: u16,
    pub db_type: String,
    pub cluster_type: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub idc: String,
}

/// A live coordination node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GmNode {
    pub ip: String,
    pub port: u16,
    pub zone: String,
    pub cloud: String,
}

/// One node of a cluster as the coordinator knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub ip: String,
    pub port: u16,
    /// e.g. `spider`, `tdbctl`, `remote`
    pub machine_type: String,
    /// e.g. `spider_master`, `spider_slave`, `tdbctl`
    #[serde(default)]
    pub role: String,
    /// `running` or `unavailable`
    #[serde(default)]
    pub status: String,
}

impl ClusterMember {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn is_available(&self) -> bool {
        !self.status.eq_ignore_ascii_case("unavailable")
    }
}

/// Fleet metadata source
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn register_agent(&self, agent: &AgentRegistration) -> Result<(), CoordinatorError>;

    async fn fetch_partition(&self, zone: &str, db_type: &str) -> Result<Partition, CoordinatorError>;

    async fn fetch_instances(&self, query: &InstanceQuery) -> Result<Vec<InstanceRecord>, CoordinatorError>;

    async fn fetch_gm_nodes(&self) -> Result<Vec<GmNode>, CoordinatorError>;

    /// IPs an operator has muted; they are never probed
    async fn fetch_muted_ips(&self) -> Result<Vec<String>, CoordinatorError>;

    async fn fetch_cluster_members(&self, cluster: &str) -> Result<Vec<ClusterMember>, CoordinatorError>;
}

/// Written after every completed sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRow {
    pub agent_ip: String,
    pub zone: String,
    pub db_type: String,
    pub instance_count: usize,
    pub sweep_millis: u64,
    pub at: DateTime<Utc>,
}

/// One probe outcome, written for every probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectLogRow {
    pub agent_ip: String,
    pub ip: String,
    pub port: u16,
    pub db_type: String,
    pub status: String,
    pub comment: String,
    pub at: DateTime<Utc>,
}

/// Latest known status for an unhealthy instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectStatusRow {
    pub agent_ip: String,
    pub ip: String,
    pub port: u16,
    pub db_type: String,
    pub status: String,
    pub at: DateTime<Utc>,
}

/// Names the coordination node that accepted a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmDeliveryRow {
    pub agent_ip: String,
    pub ip: String,
    pub port: u16,
    pub db_type: String,
    pub status: String,
    pub gm_ip: String,
    pub gm_port: u16,
    pub at: DateTime<Utc>,
}

/// One stage of a failover attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchLogRow {
    pub switch_uid: String,
    pub check_id: u64,
    pub ip: String,
    pub port: u16,
    pub cluster: String,
    pub app: String,
    pub result: String,
    pub comment: String,
    pub at: DateTime<Utc>,
}

/// Durable audit / report sink
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_heartbeat(&self, row: &HeartbeatRow) -> Result<(), CoordinatorError>;

    async fn record_detect_log(&self, row: &DetectLogRow) -> Result<(), CoordinatorError>;

    async fn update_detect_status(&self, row: &DetectStatusRow) -> Result<(), CoordinatorError>;

    async fn record_gm_delivery(&self, row: &GmDeliveryRow) -> Result<(), CoordinatorError>;

    async fn record_switch_log(&self, row: &SwitchLogRow) -> Result<(), CoordinatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_member_availability() {
        let mut member = ClusterMember {
            ip: "10.0.0.1".into(),
            port: 26000,
            machine_type: "tdbctl".into(),
            role: "tdbctl".into(),
            status: "running".into(),
        };
        assert!(member.is_available());
        assert_eq!(member.addr(), "10.0.0.1:26000");

        member.status = "UNAVAILABLE".into();
        assert!(!member.is_available());
    }

    #[test]
    fn test_instance_record_defaults() {
        let record: InstanceRecord = serde_json::from_str(
            r#"{"ip":"10.0.0.1","port":3306,"db_type":"tendbha:backend","cluster_type":"tendbha"}"#,
        )
        .unwrap();
        assert_eq!(record.cluster, "");
        assert_eq!(record.app, "");
    }
}
