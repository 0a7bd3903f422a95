//! Process-wide collaborators
//!
//! Built once at startup and shared by reference with every agent and
//! switch. Nothing here is mutated after construction.

use std::sync::Arc;

use crate::config::Config;
use crate::coordinator::{AuditSink, Coordinator};
use crate::detect::ProbeFactory;
use crate::gm::GmConnector;
use crate::switch::{ControlNodeConnector, NameServiceProvider};

pub struct HaContext {
    pub config: Config,
    pub coordinator: Arc<dyn Coordinator>,
    pub audit: Arc<dyn AuditSink>,
    pub probes: Arc<dyn ProbeFactory>,
    pub gm_connector: Arc<dyn GmConnector>,
    /// One provider per name service (DNS, CLB, Polaris); missing ones are skipped
    pub name_services: Vec<Arc<dyn NameServiceProvider>>,
    pub control: Arc<dyn ControlNodeConnector>,
}
