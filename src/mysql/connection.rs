use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use super::handshake::{ErrPacket, LoginRequest, ServerGreeting};
use super::packet::{command, Packet, PacketCodec};
use super::resultset::{column_name, parse_row, read_lenenc_int, ResultSet};

/// Where and as whom to connect
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    /// Bounds TCP connect plus authentication
    pub connect_timeout: Duration,
    /// Bounds every query round trip
    pub query_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            database: None,
            connect_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, query: Duration) -> Self {
        self.connect_timeout = connect;
        self.query_timeout = query;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A single client connection speaking the MySQL text protocol
pub struct MysqlConnection {
    framed: Framed<TcpStream, PacketCodec>,
    addr: String,
    server_version: String,
    query_timeout: Duration,
}

impl MysqlConnection {
    /// Connect and authenticate with `mysql_native_password`
    pub async fn connect(opts: &ConnectOptions) -> Result<Self, ConnectionError> {
        let addr = opts.addr();
        match timeout(opts.connect_timeout, Self::handshake(opts, addr.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(addr)),
        }
    }

    async fn handshake(opts: &ConnectOptions, addr: String) -> Result<Self, ConnectionError> {
        debug!(addr = %addr, "Connecting to mysql");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ConnectionError::Connect(format!("{}: {}", addr, e)))?;
        let mut framed = Framed::new(stream, PacketCodec);

        let greeting_packet = recv_packet(&mut framed).await?;
        if greeting_packet.is_err() {
            return Err(server_error(&greeting_packet));
        }
        let greeting = ServerGreeting::parse(&greeting_packet.payload)
            .ok_or_else(|| ConnectionError::Protocol("invalid server greeting".into()))?;

        let login = LoginRequest::new(
            &greeting,
            &opts.user,
            &opts.password,
            opts.database.as_deref(),
        );
        framed
            .send(login.encode(greeting_packet.sequence_id.wrapping_add(1)))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let reply = recv_packet(&mut framed).await?;
        if reply.is_err() {
            let err = ErrPacket::parse(&reply.payload);
            return Err(match err {
                Some(err) if err.is_access_denied() => ConnectionError::Auth(err.error_message),
                Some(err) => ConnectionError::Server {
                    code: err.error_code,
                    message: err.error_message,
                },
                None => ConnectionError::Protocol("malformed error packet".into()),
            });
        }
        if !reply.is_ok() {
            // 0xFE here is an auth switch request; only native password is supported
            return Err(ConnectionError::Protocol(format!(
                "unsupported authentication flow (plugin {})",
                greeting.auth_plugin_name
            )));
        }

        debug!(addr = %addr, server_version = %greeting.server_version, "Authenticated");
        Ok(Self {
            framed,
            addr,
            server_version: greeting.server_version,
            query_timeout: opts.query_timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// COM_PING
    pub async fn ping(&mut self) -> Result<(), ConnectionError> {
        let reply = self.round_trip(Packet::command(command::PING, &[])).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(server_error(&reply))
        }
    }

    /// Run a statement that returns no rows
    pub async fn execute(&mut self, sql: &str) -> Result<(), ConnectionError> {
        self.query(sql).await.map(|_| ())
    }

    /// Run a text query and buffer its result set.
    /// Statements without a result set yield an empty [`ResultSet`].
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet, ConnectionError> {
        let addr = self.addr.clone();
        match timeout(self.query_timeout, self.query_inner(sql)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(addr)),
        }
    }

    async fn query_inner(&mut self, sql: &str) -> Result<ResultSet, ConnectionError> {
        debug!(addr = %self.addr, sql = %sql, "Executing query");
        let first = self
            .round_trip(Packet::command(command::QUERY, sql.as_bytes()))
            .await?;

        if first.is_err() {
            return Err(server_error(&first));
        }
        if first.is_ok() {
            return Ok(ResultSet::default());
        }

        let (column_count, _) = read_lenenc_int(&first.payload)
            .ok_or_else(|| ConnectionError::Protocol("invalid column count".into()))?;
        let column_count = column_count as usize;

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let def = self.recv().await?;
            columns.push(column_name(&def.payload)?);
        }

        // EOF after column definitions
        let marker = self.recv().await?;
        if !marker.is_eof() {
            return Err(ConnectionError::Protocol(
                "expected EOF after column definitions".into(),
            ));
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.recv().await?;
            if packet.is_eof() {
                break;
            }
            if packet.is_err() {
                return Err(server_error(&packet));
            }
            rows.push(parse_row(&packet.payload, column_count)?);
        }

        Ok(ResultSet::new(columns, rows))
    }

    /// Politely close the session
    pub async fn close(mut self) {
        let _ = self.framed.send(Packet::command(command::QUIT, &[])).await;
    }

    async fn round_trip(&mut self, packet: Packet) -> Result<Packet, ConnectionError> {
        self.framed
            .send(packet)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        self.recv().await
    }

    async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        recv_packet(&mut self.framed).await
    }
}

async fn recv_packet(framed: &mut Framed<TcpStream, PacketCodec>) -> Result<Packet, ConnectionError> {
    match framed.next().await {
        Some(Ok(packet)) => Ok(packet),
        Some(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        None => Err(ConnectionError::Disconnected),
    }
}

fn server_error(packet: &Packet) -> ConnectionError {
    match ErrPacket::parse(&packet.payload) {
        Some(err) => ConnectionError::Server {
            code: err.error_code,
            message: err.error_message,
        },
        None => ConnectionError::Protocol("unexpected reply packet".into()),
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("Timed out talking to {0}")]
    Timeout(String),

    #[error("Connection disconnected")]
    Disconnected,
}
