//! # Connectors
//!
//! A [`Connector`] knows how to open the byte stream of a P1 port. It is
//! reopened by the reader task whenever the link fails or, for serial ports
//! with autodetection, when the current settings do not produce telegrams.

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::constants::TCP_CONNECT_TIMEOUT;
use crate::error::ErrorStatus;

/// Byte stream handed to the reader task.
pub type BoxedStream = Box<dyn AsyncRead + Send + Unpin>;

/// What the reader saw on the link since the last call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A complete telegram was decoded
    Telegram,
    /// A telegram was rejected
    DecodeError,
    /// Periodic tick while no data arrives
    Idle,
}

/// Connector decision on a [`LinkEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    Continue,
    /// Close the stream and open it again, optionally reporting an error
    Reopen { report: Option<ErrorStatus> },
}

#[async_trait]
pub trait Connector: Send {
    /// Opens the stream; failures are returned as the category to report.
    async fn open(&mut self) -> Result<BoxedStream, ErrorStatus>;

    /// Human readable name for logging, e.g. the port path.
    fn name(&self) -> String;

    fn observe(&mut self, _event: LinkEvent, _now: Instant) -> LinkAction {
        LinkAction::Continue
    }
}

/// P1 port exposed by a TCP gateway (ser2net, P1 dongles).
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpConnector {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&mut self) -> Result<BoxedStream, ErrorStatus> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ErrorStatus::ConnectionFailed(format!("timeout connecting to {addr}")))?
            .map_err(|e| ErrorStatus::ConnectionFailed(format!("{addr}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Cannot set TCP_NODELAY on {addr}: {e}");
        }
        log::info!("Connected to P1 gateway {addr}");
        Ok(Box::new(stream))
    }

    fn name(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}
