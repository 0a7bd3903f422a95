//! One coordination-node connection and its lifecycle
//!
//! ```text
//! open ──► connected ──send error──► broken ──repair──► connected
//!   │                                  │
//!   └──connect error──► broken         └──evicted──► closed
//! ```
//!
//! All state transitions go through the connection's own mutex.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// GM delivery errors
#[derive(Debug, thiserror::Error)]
pub enum GmError {
    #[error("Failed to connect to GM {addr}: {message}")]
    Connect { addr: String, message: String },
    #[error("Failed to send report to GM {addr}: {message}")]
    Send { addr: String, message: String },
    #[error("GM {addr} timed out")]
    Timeout { addr: String },
    #[error("GM {addr} rejected report: {message}")]
    Rejected { addr: String, message: String },
    #[error("GM {addr} is disconnected")]
    Disconnected { addr: String },
    #[error("GM {addr} is closed")]
    Closed { addr: String },
    #[error("All {ring_size} GM nodes are disconnected")]
    AllDisconnected { ring_size: usize },
    #[error("Failed to encode report: {0}")]
    Encode(String),
}

/// Transport to a single coordination node
#[async_trait]
pub trait GmChannel: Send {
    async fn report_instance(&mut self, detect_type: &str, payload: &[u8]) -> Result<(), GmError>;

    async fn close(&mut self);
}

/// Opens [`GmChannel`]s
#[async_trait]
pub trait GmConnector: Send + Sync {
    async fn connect(&self, ip: &str, port: u16) -> Result<Box<dyn GmChannel>, GmError>;
}

struct ConnState {
    channel: Option<Box<dyn GmChannel>>,
    is_connection: bool,
    is_close: bool,
    last_fetch_time: Instant,
}

/// A coordination node as seen by one agent
pub struct GMConnection {
    pub ip: String,
    pub port: u16,
    state: Mutex<ConnState>,
}

impl GMConnection {
    /// A connection that has not been opened yet
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            state: Mutex::new(ConnState {
                channel: None,
                is_connection: false,
                is_close: false,
                last_fetch_time: Instant::now(),
            }),
        }
    }

    /// Create and try to connect once. A failed connect leaves the
    /// connection broken; the caller decides whether to start a repair.
    pub async fn open(
        ip: impl Into<String>,
        port: u16,
        connector: &dyn GmConnector,
        connect_timeout: Duration,
    ) -> Self {
        let conn = Self::new(ip, port);
        if let Err(e) = conn.reconnect(connector, connect_timeout).await {
            warn!(gm = %conn.addr(), error = %e, "Initial GM connect failed");
        }
        conn
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.is_connection && !state.is_close
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.is_close
    }

    pub async fn last_fetch_time(&self) -> Instant {
        self.state.lock().await.last_fetch_time
    }

    /// The coordinator still lists this node
    pub async fn refresh(&self, now: Instant) {
        self.state.lock().await.last_fetch_time = now;
    }

    /// Send one report. Any transport failure marks the connection broken.
    pub async fn report(
        &self,
        detect_type: &str,
        payload: &[u8],
        send_timeout: Duration,
    ) -> Result<(), GmError> {
        let addr = self.addr();
        let mut state = self.state.lock().await;
        if state.is_close {
            return Err(GmError::Closed { addr });
        }
        if !state.is_connection {
            return Err(GmError::Disconnected { addr });
        }
        let Some(channel) = state.channel.as_mut() else {
            state.is_connection = false;
            return Err(GmError::Disconnected { addr });
        };

        let result = match timeout(send_timeout, channel.report_instance(detect_type, payload)).await {
            Ok(result) => result,
            Err(_) => Err(GmError::Timeout { addr: addr.clone() }),
        };

        if result.is_err() {
            if let Some(mut channel) = state.channel.take() {
                channel.close().await;
            }
            state.is_connection = false;
        }
        result
    }

    /// Mark broken without sending (e.g. the caller saw a failure elsewhere)
    pub async fn mark_disconnected(&self) {
        let mut state = self.state.lock().await;
        state.is_connection = false;
        if let Some(mut channel) = state.channel.take() {
            channel.close().await;
        }
    }

    /// Open a fresh channel. The connect runs outside the lock so senders
    /// are not stalled behind a slow handshake.
    pub async fn reconnect(
        &self,
        connector: &dyn GmConnector,
        connect_timeout: Duration,
    ) -> Result<(), GmError> {
        let addr = self.addr();
        if self.is_closed().await {
            return Err(GmError::Closed { addr });
        }

        let channel = match timeout(connect_timeout, connector.connect(&self.ip, self.port)).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(GmError::Timeout { addr }),
        };

        let mut state = self.state.lock().await;
        if state.is_close {
            let mut channel = channel;
            channel.close().await;
            return Err(GmError::Closed { addr });
        }
        if let Some(mut old) = state.channel.replace(channel) {
            old.close().await;
        }
        state.is_connection = true;
        info!(gm = %addr, "GM connection established");
        Ok(())
    }

    /// Terminal: no further sends or repairs
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.is_close = true;
        state.is_connection = false;
        if let Some(mut channel) = state.channel.take() {
            channel.close().await;
        }
        debug!(gm = %self.addr(), "GM connection closed");
    }
}

impl std::fmt::Debug for GMConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GMConnection")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}
