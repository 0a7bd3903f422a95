//! Instance model for one detection sweep
//!
//! Instances are rebuilt from the coordinator on every refresh and carry no
//! state from earlier sweeps: the status is whatever the latest probe said.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::InstanceRecord;

/// Outcome of probing one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Not probed yet this sweep, or no probe exists for its db type
    #[default]
    Unprobed,
    DbCheckSuccess,
    DbCheckFailed,
    DbAuthFailed,
    /// Database unreachable but the host answers over SSH
    SshCheckSuccess,
    SshCheckFailed,
    SshAuthFailed,
    RedisAuthFailed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprobed => "UNPROBED",
            Self::DbCheckSuccess => "DB_CHECK_SUCCESS",
            Self::DbCheckFailed => "DB_CHECK_FAILED",
            Self::DbAuthFailed => "DB_AUTH_FAILED",
            Self::SshCheckSuccess => "SSH_CHECK_SUCCESS",
            Self::SshCheckFailed => "SSH_CHECK_FAILED",
            Self::SshAuthFailed => "SSH_AUTH_FAILED",
            Self::RedisAuthFailed => "REDIS_AUTH_FAILED",
        }
    }

    /// Whether the outcome must be delivered to a coordination node
    pub fn needs_report(&self) -> bool {
        !matches!(self, Self::DbCheckSuccess | Self::Unprobed)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance assigned to this agent for the current sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DBInstance {
    pub ip: String,
    pub port: u16,
    pub db_type: String,
    pub cluster_type: String,
    pub cluster: String,
    pub app: String,
    pub idc: String,
    pub status: InstanceStatus,
}

impl DBInstance {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl From<InstanceRecord> for DBInstance {
    fn from(record: InstanceRecord) -> Self {
        Self {
            ip: record.ip,
            port: record.port,
            db_type: record.db_type,
            cluster_type: record.cluster_type,
            cluster: record.cluster,
            app: record.app,
            idc: record.idc,
            status: InstanceStatus::Unprobed,
        }
    }
}

/// Build the per-IP instance map for a sweep.
///
/// Muted IPs are dropped. When several ports share an IP the lowest port
/// wins, independent of input order.
pub fn build_instance_map(
    records: Vec<InstanceRecord>,
    muted: &[String],
) -> HashMap<String, DBInstance> {
    let mut instances: HashMap<String, DBInstance> = HashMap::with_capacity(records.len());
    for record in records {
        if muted.iter().any(|ip| ip == &record.ip) {
            continue;
        }
        match instances.get(&record.ip) {
            Some(existing) if existing.port <= record.port => {}
            _ => {
                instances.insert(record.ip.clone(), DBInstance::from(record));
            }
        }
    }
    instances
}

/// Payload delivered to a coordination node for one unhealthy instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectResult {
    pub ip: String,
    pub port: u16,
    pub db_type: String,
    pub cluster_type: String,
    pub cluster: String,
    pub app: String,
    pub status: InstanceStatus,
    pub agent_ip: String,
    pub detected_at: DateTime<Utc>,
}

impl DetectResult {
    pub fn new(instance: &DBInstance, agent_ip: &str) -> Self {
        Self {
            ip: instance.ip.clone(),
            port: instance.port,
            db_type: instance.db_type.clone(),
            cluster_type: instance.cluster_type.clone(),
            cluster: instance.cluster.clone(),
            app: instance.app.clone(),
            status: instance.status,
            agent_ip: agent_ip.to_string(),
            detected_at: Utc::now(),
        }
    }
}
