//! Detection probe contract
//!
//! A probe issues the actual health check for one instance. Probes are
//! looked up per db type through a [`ProbeFactory`]; db types without a
//! probe stay `Unprobed`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::ProbeConfig;
use crate::mysql::{ConnectOptions, ConnectionError, MysqlConnection};

use super::state::{DBInstance, InstanceStatus};

/// Error raised when a probe cannot produce a verdict at all
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe for {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("Probe for {addr} failed: {message}")]
    Failed { addr: String, message: String },
}

/// Verdict from a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: InstanceStatus,
    /// Free-text detail written to the detection log
    pub detail: String,
}

impl ProbeOutcome {
    pub fn new(status: InstanceStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait DetectionProbe: Send + Sync {
    async fn detect(&self, instance: &DBInstance) -> Result<ProbeOutcome, ProbeError>;
}

pub trait ProbeFactory: Send + Sync {
    fn probe_for(&self, db_type: &str) -> Option<Arc<dyn DetectionProbe>>;
}

/// `cluster_type:machine_type` -> `machine_type`
pub fn machine_type_of(db_type: &str) -> &str {
    db_type.split_once(':').map(|(_, m)| m).unwrap_or(db_type)
}

/// `cluster_type:machine_type` -> `cluster_type`
pub fn cluster_type_of(db_type: &str) -> &str {
    db_type.split_once(':').map(|(c, _)| c).unwrap_or(db_type)
}

/// Reachability + authentication probe for MySQL-protocol db types
pub struct MysqlProbe {
    config: ProbeConfig,
}

impl MysqlProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DetectionProbe for MysqlProbe {
    async fn detect(&self, instance: &DBInstance) -> Result<ProbeOutcome, ProbeError> {
        let opts = ConnectOptions::new(
            instance.ip.clone(),
            instance.port,
            self.config.user.clone(),
            self.config.password.clone(),
        )
        .with_timeouts(self.config.timeout(), self.config.timeout());

        let mut conn = match MysqlConnection::connect(&opts).await {
            Ok(conn) => conn,
            Err(ConnectionError::Auth(message)) => {
                return Ok(ProbeOutcome::new(InstanceStatus::DbAuthFailed, message))
            }
            Err(e) => return Ok(ProbeOutcome::new(InstanceStatus::DbCheckFailed, e.to_string())),
        };

        let outcome = match conn.ping().await {
            Ok(()) => ProbeOutcome::new(InstanceStatus::DbCheckSuccess, "ping ok"),
            Err(e) => ProbeOutcome::new(InstanceStatus::DbCheckFailed, e.to_string()),
        };
        debug!(addr = %instance.addr(), status = %outcome.status, "MySQL probe finished");
        conn.close().await;
        Ok(outcome)
    }
}

/// Serves [`MysqlProbe`] for every MySQL-protocol machine type
pub struct MysqlProbeFactory {
    probe: Arc<MysqlProbe>,
}

impl MysqlProbeFactory {
    const MACHINE_TYPES: [&'static str; 5] = ["backend", "proxy", "spider", "remote", "tdbctl"];

    pub fn new(config: ProbeConfig) -> Self {
        Self {
            probe: Arc::new(MysqlProbe::new(config)),
        }
    }
}

impl ProbeFactory for MysqlProbeFactory {
    fn probe_for(&self, db_type: &str) -> Option<Arc<dyn DetectionProbe>> {
        let machine = machine_type_of(db_type);
        if Self::MACHINE_TYPES.contains(&machine) {
            Some(self.probe.clone())
        } else {
            None
        }
    }
}
