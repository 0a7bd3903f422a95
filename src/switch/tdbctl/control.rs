//! Control-table cluster nodes over the MySQL text protocol

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::mysql::{ConnectOptions, ConnectionError, MysqlConnection};

use super::election::ReplicationStatus;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Failed to connect to control node {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: ConnectionError,
    },
    #[error("Control node {addr} failed `{sql}`: {source}")]
    Query {
        addr: String,
        sql: String,
        #[source]
        source: ConnectionError,
    },
    #[error("Control node {addr} returned unexpected data: {message}")]
    Decode { addr: String, message: String },
}

/// One row of the routing table (`mysql.servers`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RouteEntry {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    /// SPIDER, SPIDER_SLAVE, TDBCTL or mysql (remote)
    pub wrapper: String,
}

impl RouteEntry {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_tdbctl(&self) -> bool {
        self.wrapper.eq_ignore_ascii_case("TDBCTL")
    }
}

/// A live session on a control-table or spider node
#[async_trait]
pub trait ControlNode: Send {
    fn addr(&self) -> String;

    /// This node's view of the routing table
    async fn route_table(&mut self) -> Result<Vec<RouteEntry>, ControlError>;

    async fn is_primary(&mut self) -> Result<bool, ControlError>;

    /// `None` when no replication source is configured
    async fn replication_status(&mut self) -> Result<Option<ReplicationStatus>, ControlError>;

    async fn enable_primary_force(&mut self) -> Result<(), ControlError>;

    /// Remove a server from the routing table (no-op if absent)
    async fn drop_route(&mut self, server_name: &str) -> Result<(), ControlError>;

    /// Push the routing table to every cluster node
    async fn flush_routing(&mut self) -> Result<(), ControlError>;

    /// Clear any prior replica state
    async fn reset_replica(&mut self) -> Result<(), ControlError>;

    async fn change_source(
        &mut self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<(), ControlError>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait ControlNodeConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn ControlNode>, ControlError>;
}

/// Connects with the configured admin account
pub struct MysqlControlConnector {
    user: String,
    password: String,
    connect_timeout: Duration,
}

impl MysqlControlConnector {
    pub fn new(user: impl Into<String>, password: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl ControlNodeConnector for MysqlControlConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn ControlNode>, ControlError> {
        let opts = ConnectOptions::new(host, port, self.user.clone(), self.password.clone())
            .with_timeouts(self.connect_timeout, self.connect_timeout);
        let conn = MysqlConnection::connect(&opts)
            .await
            .map_err(|source| ControlError::Connect {
                addr: opts.addr(),
                source,
            })?;
        Ok(Box::new(MysqlControlNode { conn }))
    }
}

pub struct MysqlControlNode {
    conn: MysqlConnection,
}

impl MysqlControlNode {
    async fn exec(&mut self, sql: &str) -> Result<(), ControlError> {
        debug!(node = %self.conn.addr(), sql = %sql, "Executing on control node");
        self.conn
            .execute(sql)
            .await
            .map_err(|source| ControlError::Query {
                addr: self.conn.addr().to_string(),
                sql: sql.to_string(),
                source,
            })
    }

    async fn select(&mut self, sql: &str) -> Result<crate::mysql::ResultSet, ControlError> {
        self.conn
            .query(sql)
            .await
            .map_err(|source| ControlError::Query {
                addr: self.conn.addr().to_string(),
                sql: sql.to_string(),
                source,
            })
    }

    fn decode_error(&self, message: impl Into<String>) -> ControlError {
        ControlError::Decode {
            addr: self.conn.addr().to_string(),
            message: message.into(),
        }
    }
}

/// Quote a string literal for the text protocol
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Quote an identifier
fn quote_ident(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

/// `binlog.000123` -> 123
pub fn log_file_index(file: &str) -> Option<u64> {
    file.rsplit_once('.').and_then(|(_, idx)| idx.parse().ok())
}

#[async_trait]
impl ControlNode for MysqlControlNode {
    fn addr(&self) -> String {
        self.conn.addr().to_string()
    }

    async fn route_table(&mut self) -> Result<Vec<RouteEntry>, ControlError> {
        let rs = self
            .select("SELECT Server_name, Host, Port, Wrapper FROM mysql.servers")
            .await?;
        let mut routes = Vec::new();
        for row in rs.rows() {
            let (Some(server_name), Some(host), Some(port), Some(wrapper)) = (
                row.get("Server_name"),
                row.get("Host"),
                row.get_u64("Port"),
                row.get("Wrapper"),
            ) else {
                return Err(self.decode_error("incomplete mysql.servers row"));
            };
            let port = u16::try_from(port).map_err(|_| self.decode_error(format!("port {} out of range", port)))?;
            routes.push(RouteEntry {
                server_name: server_name.to_string(),
                host: host.to_string(),
                port,
                wrapper: wrapper.to_string(),
            });
        }
        Ok(routes)
    }

    async fn is_primary(&mut self) -> Result<bool, ControlError> {
        let rs = self.select("SELECT @@tc_is_primary AS is_primary").await?;
        let value = rs
            .first()
            .and_then(|row| row.get_u64("is_primary"))
            .ok_or_else(|| self.decode_error("missing @@tc_is_primary"))?;
        Ok(value == 1)
    }

    async fn replication_status(&mut self) -> Result<Option<ReplicationStatus>, ControlError> {
        let rs = self.select("SHOW SLAVE STATUS").await?;
        let Some(row) = rs.first() else {
            return Ok(None);
        };
        let source_host = row.get("Master_Host").unwrap_or_default().to_string();
        if source_host.is_empty() {
            return Ok(None);
        }
        let source_port = row
            .get_u64("Master_Port")
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or_default();
        let relay_master_log_file = row.get("Relay_Master_Log_File").unwrap_or_default();
        Ok(Some(ReplicationStatus {
            source_host,
            source_port,
            relay_index: log_file_index(relay_master_log_file).unwrap_or_default(),
            exec_pos: row.get_u64("Exec_Master_Log_Pos").unwrap_or_default(),
            sql_thread_running: row
                .get("Slave_SQL_Running")
                .map_or(false, |v| v.eq_ignore_ascii_case("yes")),
        }))
    }

    async fn enable_primary_force(&mut self) -> Result<(), ControlError> {
        self.exec("TDBCTL ENABLE PRIMARY FORCE").await
    }

    async fn drop_route(&mut self, server_name: &str) -> Result<(), ControlError> {
        let sql = format!("TDBCTL DROP NODE IF EXISTS {}", quote_ident(server_name));
        self.exec(&sql).await
    }

    async fn flush_routing(&mut self) -> Result<(), ControlError> {
        self.exec("TDBCTL FLUSH ROUTING FORCE").await
    }

    async fn reset_replica(&mut self) -> Result<(), ControlError> {
        self.exec("STOP SLAVE").await?;
        self.exec("RESET SLAVE ALL").await
    }

    async fn change_source(
        &mut self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<(), ControlError> {
        self.exec("STOP SLAVE").await?;
        let sql = format!(
            "CHANGE MASTER TO MASTER_HOST={}, MASTER_PORT={}, MASTER_USER={}, MASTER_PASSWORD={}, MASTER_AUTO_POSITION=1",
            quote(host),
            port,
            quote(user),
            quote(password)
        );
        self.exec(&sql).await?;
        self.exec("START SLAVE").await
    }

    async fn close(self: Box<Self>) {
        let node = *self;
        node.conn.close().await;
    }
}
