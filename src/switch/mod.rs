//! Failover of a failed instance
//!
//! Every concrete switch implements [`DataBaseSwitch`] on top of a shared
//! [`BaseSwitch`]; [`switch_factory`] picks the implementation from the
//! instance's (cluster type, machine type) and [`run_switch`] drives it.

mod base;
mod flow;
mod name_service;
mod proxy;
mod spider;
pub mod tdbctl;

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::HaContext;
use crate::coordinator::CoordinatorError;

pub use base::{BaseSwitch, SwitchExtra, SwitchRequest};
pub use flow::{run_switch, SwitchOutcome};
pub use name_service::{
    delete_name_service, restore_name_service, single_address_domains, BindEntry, Binding,
    NameServiceError, NameServiceProvider, Provider, Released,
};
pub use proxy::ProxySwitch;
pub use spider::SpiderSwitch;
pub use tdbctl::{
    ControlError, ControlNode, ControlNodeConnector, ElectionError, MysqlControlConnector,
    TdbctlSwitch,
};

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("No switch implementation for {cluster_type}/{meta_type}")]
    Unsupported {
        cluster_type: String,
        meta_type: String,
    },
    #[error("Refusing to release {addr}: it is the only address bound under {}", .domains.join(", "))]
    SingleAddressUnderDomain { addr: String, domains: Vec<String> },
    #[error("No reachable control primary in cluster {cluster}")]
    NoControlPrimary { cluster: String },
    #[error("Audit sink unavailable for strict switch: {0}")]
    Audit(String),
    #[error("Topology repair incomplete: {}", .0.join("; "))]
    PartialRepair(Vec<String>),
    #[error("Rollback incomplete: {}", .0.join("; "))]
    Rollback(Vec<String>),
    #[error(transparent)]
    NameService(#[from] NameServiceError),
    #[error(transparent)]
    Election(#[from] ElectionError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl SwitchError {
    /// Transient failures worth retrying on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            SwitchError::Control(_)
            | SwitchError::Coordinator(_)
            | SwitchError::Audit(_)
            | SwitchError::NoControlPrimary { .. } => true,
            SwitchError::Election(e) => matches!(
                e,
                ElectionError::Control(_) | ElectionError::NoMembershipSource { .. }
            ),
            _ => false,
        }
    }
}

/// One failover attempt
#[async_trait]
pub trait DataBaseSwitch: Send {
    /// Preflight. `Ok(false)` means there is nothing to do.
    async fn check_switch(&mut self) -> Result<bool, SwitchError>;

    async fn do_switch(&mut self) -> Result<(), SwitchError>;

    /// Post-switch repair; not followed by a rollback on failure
    async fn do_final(&mut self) -> Result<(), SwitchError> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SwitchError>;

    fn show_switch_instance_info(&self) -> String {
        self.base().show_info()
    }

    fn base(&self) -> &BaseSwitch;
}

/// Build the switch for a failed instance
pub fn switch_factory(
    ctx: Arc<HaContext>,
    request: SwitchRequest,
) -> Result<Box<dyn DataBaseSwitch>, SwitchError> {
    let base = BaseSwitch::new(request, ctx.audit.clone(), ctx.config.switch.audit_policy);
    let (cluster_type, meta_type) = (base.cluster_type.clone(), base.meta_type.clone());
    match (cluster_type.as_str(), meta_type.as_str()) {
        ("tendbha", "proxy") => Ok(Box::new(ProxySwitch::new(base, ctx))),
        ("tendbcluster", "spider") => Ok(Box::new(SpiderSwitch::new(base, ctx))),
        ("tendbcluster", "tdbctl") => Ok(Box::new(TdbctlSwitch::new(base, ctx))),
        _ => Err(SwitchError::Unsupported {
            cluster_type,
            meta_type,
        }),
    }
}
