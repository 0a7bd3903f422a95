use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use super::codec::{Frame, ReportCodec};
use super::connection::{GmChannel, GmConnector, GmError};

/// Persistent TCP transport to coordination nodes
#[derive(Debug, Default, Clone)]
pub struct TcpGmConnector;

impl TcpGmConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GmConnector for TcpGmConnector {
    async fn connect(&self, ip: &str, port: u16) -> Result<Box<dyn GmChannel>, GmError> {
        let addr = format!("{}:{}", ip, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| GmError::Connect {
                addr: addr.clone(),
                message: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(|e| GmError::Connect {
            addr: addr.clone(),
            message: e.to_string(),
        })?;
        debug!(gm = %addr, "Opened GM channel");
        Ok(Box::new(TcpGmChannel {
            framed: Framed::new(stream, ReportCodec),
            addr,
        }))
    }
}

/// One framed TCP stream; each report waits for its ack
pub struct TcpGmChannel {
    framed: Framed<TcpStream, ReportCodec>,
    addr: String,
}

#[async_trait]
impl GmChannel for TcpGmChannel {
    async fn report_instance(&mut self, detect_type: &str, payload: &[u8]) -> Result<(), GmError> {
        self.framed
            .send(Frame::Report {
                detect_type: detect_type.to_string(),
                payload: Bytes::copy_from_slice(payload),
            })
            .await
            .map_err(|e| GmError::Send {
                addr: self.addr.clone(),
                message: e.to_string(),
            })?;

        match self.framed.next().await {
            Some(Ok(Frame::Ack)) => Ok(()),
            Some(Ok(Frame::Nack(message))) => Err(GmError::Rejected {
                addr: self.addr.clone(),
                message,
            }),
            Some(Ok(Frame::Report { .. })) => Err(GmError::Send {
                addr: self.addr.clone(),
                message: "unexpected report frame from GM".into(),
            }),
            Some(Err(e)) => Err(GmError::Send {
                addr: self.addr.clone(),
                message: e.to_string(),
            }),
            None => Err(GmError::Disconnected {
                addr: self.addr.clone(),
            }),
        }
    }

    async fn close(&mut self) {
        let _ = self.framed.close().await;
    }
}
