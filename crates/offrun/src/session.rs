//! # Generator Sessions
//!
//! The caller's view of a remote generator. A `Session` behaves like a local
//! async generator: `next`, `return_with` and `throw` each produce one
//! `{value, done}` step, and `into_stream` iterates it once.
//!
//! ## Lifecycle
//!
//! - `Unopened`: nothing sent yet. The first operation opens the session,
//!   waits for the `{undefined, false}` acknowledgment, then applies itself.
//! - `Active`: every operation is one round trip.
//! - `Pending`: an open or a step has been sent and its reply is awaited.
//!   The state only outlives the operation if its future was dropped.
//! - `Completed`: after a `done` step or a rejection. Further operations are
//!   answered locally, like a finished generator: `next` gives
//!   `{undefined, done}`, `return_with(v)` gives `{v, done}`, `throw` rejects.
//!
//! Dropping an active or pending session asks the executor to `return` it so
//! the remote iterator is released. The executor queues that release behind
//! a step still in flight.
//!
//! An operation that finds the session `Pending` follows one whose future was
//! dropped mid-step. Where the generator stopped is unknown, so the session
//! is released, marked `Completed`, and the operation fails with
//! `CallError::Protocol`.

use futures::Stream;
use offrpc::Invoke;
use offrpc::Resume;
use offrpc::SessionId;
use offrpc::Step;
use offrpc::Value;

use crate::caller::Caller;
use crate::error::CallError;
use crate::error::Result;

enum State {
    Unopened(Vec<Value>),
    Active(SessionId),
    Pending(SessionId),
    Completed,
}

/// A remote generator instance. Operations take `&mut self`, so they are
/// applied one at a time and in order.
pub struct Session {
    caller: Caller,
    state: State,
}

impl Session {
    pub(crate) fn new(caller: Caller, args: Vec<Value>) -> Self {
        Self { caller, state: State::Unopened(args) }
    }

    /// The session id, once the session has been opened.
    pub fn id(&self) -> Option<SessionId> {
        match self.state {
            State::Active(id) | State::Pending(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, State::Completed)
    }

    pub async fn next(&mut self, value: impl Into<Value>) -> Result<Step> {
        self.resume(Resume::Next(value.into())).await
    }

    /// Asks the generator to finish early with `value`.
    pub async fn return_with(&mut self, value: impl Into<Value>) -> Result<Step> {
        self.resume(Resume::Return(value.into())).await
    }

    /// Throws `error` into the generator at its current yield.
    pub async fn throw(&mut self, error: impl Into<Value>) -> Result<Step> {
        self.resume(Resume::Throw(error.into())).await
    }

    /// Applies one operation to the remote generator.
    pub async fn resume(&mut self, resume: Resume) -> Result<Step> {
        let session = match std::mem::replace(&mut self.state, State::Completed) {
            State::Completed => return after_completion(resume),
            State::Unopened(args) => self.open(args).await?,
            State::Active(session) => session,
            State::Pending(session) => {
                tracing::warn!(caller = %self.caller.name(), %session, "session was left mid-step, releasing it");
                self.release(session);
                return Err(CallError::Protocol(format!(
                    "{} was left mid-step by a dropped operation",
                    session
                )));
            }
        };
        self.state = State::Pending(session);

        let outcome = self
            .caller
            .request(|request| Invoke::resume(request, session, resume))
            .await
            .and_then(|payload| Ok(Step::from_value(payload)?));

        match outcome {
            Ok(step) => {
                if step.done {
                    tracing::debug!(caller = %self.caller.name(), %session, "session completed");
                    self.state = State::Completed;
                } else {
                    self.state = State::Active(session);
                }
                Ok(step)
            }
            Err(e) => {
                self.state = State::Completed;
                Err(e)
            }
        }
    }

    /// Creates the remote generator. Leaves the session `Completed` on error.
    async fn open(&mut self, args: Vec<Value>) -> Result<SessionId> {
        let session = self.caller.allocate_session();
        self.state = State::Pending(session);
        let payload = self.caller.request(|request| Invoke::open(request, session, args)).await;
        self.state = State::Completed;

        let ack = Step::from_value(payload?)?;
        if !ack.is_ready() {
            return Err(CallError::Protocol(format!(
                "{} opened with {:?} instead of a ready acknowledgment",
                session, ack
            )));
        }

        tracing::debug!(caller = %self.caller.name(), %session, "session opened");
        Ok(session)
    }

    /// Iterates the remaining yielded values, like `for await`. The final
    /// return value is not yielded. Stops after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut session = state?;
            match session.next(Value::Undefined).await {
                Ok(step) if !step.done => Some((Ok(step.value), Some(session))),
                Ok(_) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

fn after_completion(resume: Resume) -> Result<Step> {
    match resume {
        Resume::Next(_) => Ok(Step::done(Value::Undefined)),
        Resume::Return(value) => Ok(Step::done(value)),
        Resume::Throw(error) => Err(CallError::Remote(error.to_text())),
    }
}

impl Session {
    /// Sends a fire-and-forget `return` for `session` and marks it completed.
    fn release(&mut self, session: SessionId) {
        self.state = State::Completed;
        self.caller
            .notify(move |request| Invoke::resume(request, session, Resume::Return(Value::Undefined)));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let State::Active(session) | State::Pending(session) = self.state {
            tracing::debug!(caller = %self.caller.name(), %session, "releasing dropped session");
            self.release(session);
        }
    }
}
