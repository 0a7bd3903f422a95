//! Reporting detection results to coordination (GM) nodes

mod codec;
mod connection;
mod repair;
mod ring;
mod tcp;

pub use codec::{Frame, ReportCodec};
pub use connection::{GMConnection, GmChannel, GmConnector, GmError};
pub use repair::RepairSupervisor;
pub use ring::{hash_index, report_to_ring, ring_order, Delivery};
pub use tcp::{TcpGmChannel, TcpGmConnector};
