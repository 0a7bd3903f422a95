//! Minimal MySQL client used to probe instances and drive control-table nodes
//!
//! Only the pieces a control plane needs: native-password login, COM_PING
//! and text queries with fully buffered result sets.

pub mod connection;
pub mod handshake;
pub mod packet;
pub mod resultset;

pub use connection::{ConnectOptions, ConnectionError, MysqlConnection};
pub use resultset::{ResultSet, Row};
