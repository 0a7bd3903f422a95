//! Database high-availability control plane
//!
//! - [`detect`]: per-zone detection agents that probe instances and report
//!   unhealthy ones to the coordination (GM) ring
//! - [`switch`]: failover of a failed instance, including name-service
//!   release and control-table route repair

pub mod config;
pub mod context;
pub mod coordinator;
pub mod detect;
pub mod gm;
pub mod metrics;
pub mod mysql;
pub mod switch;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
