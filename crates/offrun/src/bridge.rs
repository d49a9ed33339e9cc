//! # Bridge
//!
//! The public entry point: bind a target, get back a [`Remote`] that invokes
//! it in an isolated executor.
//!
//! `bridge` runs the executor as its own tokio task behind a
//! [`DuplexChannel`]. `connect` attaches a caller to any other channel whose
//! far end is served by an [`Executor`].

use offrpc::Value;

use crate::caller::Caller;
use crate::channel::Channel;
use crate::channel::DuplexChannel;
use crate::config::Options;
use crate::error::CallError;
use crate::error::Result;
use crate::executor::Executor;
use crate::session::Session;
use crate::target::Target;
use crate::target::TargetKind;

/// A handle to a bridged target. Clones share one caller.
#[derive(Clone)]
pub struct Remote {
    caller: Caller,
    kind: TargetKind,
}

impl Remote {
    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Invokes a plain or async target.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        if self.kind.is_generator() {
            return Err(CallError::KindMismatch { expected: TargetKind::Async, found: self.kind });
        }
        self.caller.call(args).await
    }

    /// Starts a session on a generator target.
    pub fn session(&self, args: Vec<Value>) -> Result<Session> {
        if !self.kind.is_generator() {
            return Err(CallError::KindMismatch { expected: TargetKind::Generator, found: self.kind });
        }
        Ok(self.caller.session(args))
    }
}

/// Binds `target` to a fresh executor task and returns its remote handle.
///
/// Must be called from within a tokio runtime. The executor task ends once
/// every clone of the returned `Remote` (and every session) is dropped.
pub fn bridge(target: Target, options: Options) -> Remote {
    let (near, far) = DuplexChannel::pair();
    let kind = target.kind();

    let executor = Executor::new(target, &options);
    let name = options.name.clone();
    tokio::spawn(async move {
        if let Err(e) = executor.serve(Box::new(far)).await {
            tracing::error!(executor = %name, error = %e, "executor failed");
        }
    });

    connect(Box::new(near), kind, options)
}

/// Attaches a caller to `channel`, whose far end serves a target of `kind`.
pub fn connect(channel: Box<dyn Channel>, kind: TargetKind, options: Options) -> Remote {
    tracing::debug!(caller = %options.name, ?kind, "bridge connected");
    Remote { caller: Caller::new(channel, &options), kind }
}
