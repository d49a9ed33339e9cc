//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between execution contexts.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about invocations, replies
//!   or values. It moves opaque buffers. Message framing lives in
//!   [`crate::channel::TransportChannel`].
//! - **Duplex**: Either side may send at any time; `recv` yields whatever the
//!   peer sent next, or `None` once the peer is gone.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use offrpc::RequestId;
use offrpc::WireError;
use tokio::sync::mpsc;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// A message could not be encoded or cloned for sending.
    Codec(WireError),
    /// One received frame could not be decoded. The stream itself is intact;
    /// `request` is the id the frame claimed, when it could be read.
    Malformed { request: Option<RequestId>, error: WireError },
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Malformed { request: Some(request), error } => {
                write!(f, "Malformed frame for {}: {}", request, error)
            }
            Self::Malformed { request: None, error } => write!(f, "Malformed frame: {}", error),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) | Self::Malformed { error: e, .. } => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for TransportError {
    fn from(e: WireError) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A mechanism to send byte buffers to a peer and receive theirs.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a payload to the peer.
    ///
    /// # invariants
    /// - Must not interpret the payload content.
    /// - Must return `Err` if the payload can no longer be delivered.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next payload, or `None` once the peer has closed.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a payload.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Stops sending. The peer observes end-of-stream once it has drained
    /// everything sent before.
    fn close(&self) {}
}

/// An in-memory byte transport built on unbounded tokio channels.
///
/// Messages sent via `send()` appear on the peer's `recv()` and vice versa.
pub struct DuplexTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl DuplexTransport {
    /// Creates a pair of transports connected to each other.
    ///
    /// Bytes sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: Mutex::new(Some(tx_a)),
            rx: Arc::new(tokio::sync::Mutex::new(rx_b)),
        };

        let b = Self {
            tx: Mutex::new(Some(tx_b)),
            rx: Arc::new(tokio::sync::Mutex::new(rx_a)),
        };

        (a, b)
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx
                .send(payload.to_vec())
                .map_err(|_| TransportError::ConnectionLost("Peer dropped".into())),
            None => Err(TransportError::ConnectionLost("Transport closed".into())),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}
