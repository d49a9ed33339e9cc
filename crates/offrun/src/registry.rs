//! # Correlation Registry
//!
//! Maps each outstanding request id to the controller that settles it.
//!
//! ## Invariants
//!
//! - An id has at most one pending controller, and it fires at most once.
//! - Settling removes the entry; a second reply for the same id is a protocol
//!   violation and never reaches the controller again.
//! - An abandoned id (the caller stopped waiting) is remembered until its
//!   reply arrives, which is then dropped quietly.
//! - After `fail_all` no new id can be registered, so nothing waits on a
//!   reply stream that is gone.

use std::sync::OnceLock;

use dashmap::DashMap;
use dashmap::DashSet;
use dashmap::mapref::entry::Entry;
use offrpc::RequestId;
use offrpc::Status;
use offrpc::Value;
use tokio::sync::oneshot;

use crate::error::CallError;
use crate::error::Result;

pub type Outcome = Result<Value>;

/// What happened to a reply handed to [`Registry::settle`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// The pending controller was fired.
    Delivered,
    /// Nobody is waiting for this id any more; the reply was discarded.
    Abandoned,
}

#[derive(Default)]
pub struct Registry {
    pending: DashMap<RequestId, oneshot::Sender<Outcome>>,
    abandoned: DashSet<RequestId>,
    closed: OnceLock<CallError>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a controller for `id` and returns the receiving half.
    ///
    /// Fails with the closing error once the registry has been failed.
    pub fn register(&self, id: RequestId) -> Result<oneshot::Receiver<Outcome>> {
        if let Some(error) = self.closed.get() {
            return Err(error.clone());
        }
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id) {
            Entry::Occupied(_) => {
                return Err(CallError::Protocol(format!("{} is already pending", id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // fail_all may have swept the map between the check and the insert
        if let Some(error) = self.closed.get() {
            self.pending.remove(&id);
            return Err(error.clone());
        }
        Ok(rx)
    }

    /// Fires the controller for `id` with the reply status and removes it.
    pub fn settle(&self, id: RequestId, status: Status) -> Result<Settlement> {
        let outcome = match status {
            Status::Ok(value) => Ok(value),
            Status::Err(message) => Err(CallError::Remote(message)),
        };
        self.deliver(id, outcome)
    }

    /// Rejects the call `id` with a local error, e.g. for a reply that
    /// arrived but could not be decoded.
    pub fn reject(&self, id: RequestId, error: CallError) -> Result<Settlement> {
        self.deliver(id, Err(error))
    }

    fn deliver(&self, id: RequestId, outcome: Outcome) -> Result<Settlement> {
        if let Some((_, tx)) = self.pending.remove(&id) {
            // the receiver may have been dropped between removal and here
            let _ = tx.send(outcome);
            return Ok(Settlement::Delivered);
        }

        if self.abandoned.remove(&id).is_some() {
            return Ok(Settlement::Abandoned);
        }

        Err(CallError::Protocol(format!("reply for {}, which is not pending", id)))
    }

    /// Stops waiting for `id`. Its eventual reply will be ignored.
    pub fn abandon(&self, id: RequestId) {
        // mark first so a reply racing with the removal is still recognized
        self.abandoned.insert(id);
        if self.pending.remove(&id).is_none() {
            self.abandoned.remove(&id);
        }
    }

    /// Marks an id whose reply nobody will wait for (fire-and-forget).
    pub fn expect_ignored(&self, id: RequestId) {
        self.abandoned.insert(id);
    }

    /// Forgets `id` entirely, for requests that never left this side.
    pub fn discard(&self, id: RequestId) {
        self.pending.remove(&id);
        self.abandoned.remove(&id);
    }

    /// Rejects every pending call with `error`, and every later
    /// registration too.
    pub fn fail_all(&self, error: CallError) {
        let _ = self.closed.set(error.clone());
        let keys: Vec<RequestId> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
        self.abandoned.clear();
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
