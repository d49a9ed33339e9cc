//! # Message Channels
//!
//! A `Channel` moves whole protocol messages between the caller and the
//! executor, together with the set of payload positions to transfer.
//!
//! Two implementations are provided:
//!
//! - [`DuplexChannel`]: in-process. Transferred values are moved as-is and
//!   keep their storage; everything else is structured-cloned on send.
//! - [`TransportChannel`]: frames messages as JSON tuples over any byte
//!   [`Transport`]. Everything is serialized, so nothing is transferred.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use offrpc::Message;
use offrpc::codec;
use tokio::sync::mpsc;

use crate::transfer::TransferSet;
use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportError;

/// A bidirectional async message channel.
///
/// This trait is designed to be object-safe (`Arc<dyn Channel>`).
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Sends a message. Values at positions in `transfer` move without being
    /// copied where the channel supports it.
    async fn send(&self, message: Message, transfer: TransferSet) -> transport::Result<()>;

    /// Receives the next message, or `None` once the peer has closed.
    ///
    /// A `TransportError::Malformed` covers a single bad frame; receiving may
    /// continue after it. Must be cancel-safe.
    async fn recv(&self) -> transport::Result<Option<Message>>;

    /// Stops sending; the peer sees end-of-stream after draining.
    fn close(&self) {}
}

/// An in-process channel built on unbounded tokio channels.
pub struct DuplexChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl DuplexChannel {
    /// Creates a pair of channels connected to each other.
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
impl Channel for DuplexChannel {
    async fn send(&self, mut message: Message, transfer: TransferSet) -> transport::Result<()> {
        for (i, value) in message.payload_mut().iter_mut().enumerate() {
            if !transfer.contains(i) {
                *value = value.structured_clone()?;
            }
        }

        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| TransportError::ConnectionLost("Peer dropped".into())),
            None => Err(TransportError::ConnectionLost("Channel closed".into())),
        }
    }

    async fn recv(&self) -> transport::Result<Option<Message>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Carries messages as JSON tuples over a byte transport.
pub struct TransportChannel<T: Transport> {
    transport: T,
}

impl<T: Transport> TransportChannel<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait::async_trait]
impl<T: Transport> Channel for TransportChannel<T> {
    async fn send(&self, message: Message, _transfer: TransferSet) -> transport::Result<()> {
        let bytes = codec::encode(&message)?;
        self.transport.send(&bytes).await
    }

    async fn recv(&self) -> transport::Result<Option<Message>> {
        let Some(bytes) = self.transport.recv().await? else {
            return Ok(None);
        };
        codec::decode(&bytes)
            .map(Some)
            .map_err(|error| TransportError::Malformed { request: codec::peek_request(&bytes), error })
    }

    fn close(&self) {
        self.transport.close();
    }
}
