//! Instance health detection and GM reporting

mod agent;
mod cache;
mod probe;
mod state;

pub use agent::{MonitorAgent, SweepSummary};
pub use cache::{CachedHostInfo, ReportCache};
pub use probe::{
    cluster_type_of, machine_type_of, DetectionProbe, MysqlProbe, MysqlProbeFactory, ProbeError,
    ProbeFactory, ProbeOutcome,
};
pub use state::{build_instance_map, DBInstance, DetectResult, InstanceStatus};
