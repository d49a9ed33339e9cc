//! # Caller with Async Pump
//!
//! The caller side of a bridge. Each call allocates a request id, registers a
//! pending controller, and sends an `Invoke` over the channel. A background
//! pump reads replies off the channel and settles them by id, so any number of
//! calls can be outstanding at once and each completes independently.
//!
//! ## Late replies
//!
//! Dropping a call future before its reply arrives abandons the call. The id
//! is remembered and its reply is discarded when it shows up. A reply for an
//! id that was never issued, or was already settled, is a protocol violation
//! and is logged as an error.
//!
//! ## Bad frames and shutdown
//!
//! A frame that fails to decode is skipped; if it names a pending call, that
//! call is rejected with `CallError::Protocol`. Any other receive failure ends
//! the pump: the channel is closed, every pending call is rejected, and later
//! calls fail immediately with the same error.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use offrpc::Invoke;
use offrpc::Message;
use offrpc::RequestId;
use offrpc::SessionId;
use offrpc::Value;
use offrpc::WireError;

use crate::channel::Channel;
use crate::config::Options;
use crate::error::CallError;
use crate::error::Result;
use crate::registry::Registry;
use crate::registry::Settlement;
use crate::session::Session;
use crate::transfer::TransferDetector;
use crate::transport::TransportError;

pub(crate) struct CallerInner {
    name: String,
    channel: Arc<dyn Channel>,
    registry: Arc<Registry>,
    detector: TransferDetector,
    next_request: AtomicU64,
    next_session: AtomicU64,
}

impl Drop for CallerInner {
    fn drop(&mut self) {
        tracing::debug!(caller = %self.name, "last caller handle dropped, closing channel");
        self.channel.close();
    }
}

/// Issues invocations over a channel and correlates their replies.
///
/// Cheap to clone; all clones share the channel, the counters and the pump.
/// When the last clone is dropped the outgoing half of the channel closes.
#[derive(Clone)]
pub struct Caller {
    inner: Arc<CallerInner>,
}

impl Caller {
    /// Creates a caller and spawns the background pump task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(channel: Box<dyn Channel>, options: &Options) -> Self {
        let channel: Arc<dyn Channel> = Arc::from(channel);
        let registry = Arc::new(Registry::new());

        let pump_channel = channel.clone();
        let pump_registry = registry.clone();
        let pump_name = options.name.clone();

        tokio::spawn(async move {
            let error = loop {
                match pump_channel.recv().await {
                    Ok(Some(message)) => Self::handle_message(&pump_name, message, &pump_registry),
                    Ok(None) => break TransportError::ConnectionLost("Channel closed".into()),
                    Err(TransportError::Malformed { request, error }) => {
                        Self::handle_malformed(&pump_name, request, error, &pump_registry);
                    }
                    Err(e) => {
                        tracing::error!(caller = %pump_name, error = %e, "transport error in pump");
                        break e;
                    }
                }
            };

            let pending = pump_registry.pending_count();
            if pending > 0 {
                tracing::warn!(caller = %pump_name, pending, error = %error, "failing pending calls");
            }
            pump_channel.close();
            pump_registry.fail_all(CallError::Transport(error));
        });

        Self {
            inner: Arc::new(CallerInner {
                name: options.name.clone(),
                channel,
                registry,
                detector: TransferDetector::new(options.use_transfer_detection),
                next_request: AtomicU64::new(1),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.registry.pending_count()
    }

    /// Routes one incoming message to the registry.
    fn handle_message(name: &str, message: Message, registry: &Registry) {
        let reply = match message {
            Message::Reply(reply) => reply,
            Message::Invoke(invoke) => {
                tracing::error!(caller = %name, request = %invoke.request, "caller received an invoke");
                return;
            }
        };

        let request = reply.request;
        match registry.settle(request, reply.status) {
            Ok(Settlement::Delivered) => {
                tracing::trace!(caller = %name, %request, "settled");
            }
            Ok(Settlement::Abandoned) => {
                tracing::debug!(caller = %name, %request, "dropped reply for abandoned call");
            }
            Err(e) => {
                tracing::error!(caller = %name, %request, error = %e, "unroutable reply");
            }
        }
    }

    /// Rejects the call a broken reply frame belonged to, if it can be told.
    fn handle_malformed(name: &str, request: Option<RequestId>, error: WireError, registry: &Registry) {
        tracing::error!(caller = %name, ?request, error = %error, "undecodable reply frame");
        let Some(request) = request else {
            return;
        };
        let rejection = CallError::Protocol(format!("reply for {} could not be decoded: {}", request, error));
        match registry.reject(request, rejection) {
            Ok(_) => {}
            Err(e) => tracing::error!(caller = %name, %request, error = %e, "unroutable reply"),
        }
    }

    /// Invokes the remote target with `args` and waits for its result.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.request(|request| Invoke::call(request, args)).await
    }

    /// Starts a generator session. Nothing is sent until its first operation.
    pub fn session(&self, args: Vec<Value>) -> Session {
        Session::new(self.clone(), args)
    }

    pub(crate) fn allocate_session(&self) -> SessionId {
        SessionId(self.inner.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a fresh request, sends the invoke built for it and awaits
    /// the reply.
    pub(crate) async fn request(&self, build: impl FnOnce(RequestId) -> Invoke) -> Result<Value> {
        let request = RequestId(self.inner.next_request.fetch_add(1, Ordering::Relaxed));
        let rx = self.inner.registry.register(request)?;
        let mut guard = AbandonGuard { registry: &self.inner.registry, request, armed: true };

        let message = Message::Invoke(build(request));
        let transfer = self.inner.detector.select(message.payload());
        tracing::debug!(caller = %self.inner.name, %request, transferred = transfer.len(), "invoke");

        if let Err(e) = self.inner.channel.send(message, transfer).await {
            guard.armed = false;
            self.inner.registry.discard(request);
            return Err(e.into());
        }

        let outcome = rx.await;
        guard.armed = false;
        match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Transport(TransportError::ConnectionLost(
                "Reply controller dropped".into(),
            ))),
        }
    }

    /// Sends an invoke whose reply nobody waits for.
    pub(crate) fn notify(&self, build: impl FnOnce(RequestId) -> Invoke + Send + 'static) {
        let request = RequestId(self.inner.next_request.fetch_add(1, Ordering::Relaxed));
        self.inner.registry.expect_ignored(request);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.inner.registry.discard(request);
            return;
        };

        let inner = self.inner.clone();
        runtime.spawn(async move {
            let message = Message::Invoke(build(request));
            let transfer = inner.detector.select(message.payload());
            if let Err(e) = inner.channel.send(message, transfer).await {
                tracing::debug!(caller = %inner.name, %request, error = %e, "notification not sent");
                inner.registry.discard(request);
            }
        });
    }
}

/// Abandons the request if the call future is dropped while still waiting.
struct AbandonGuard<'a> {
    registry: &'a Registry,
    request: RequestId,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(request = %self.request, "call abandoned");
            self.registry.abandon(self.request);
        }
    }
}
