//! # Generators
//!
//! The executor drives generator sessions through the [`Generator`] trait:
//! one `resume` per `next` / `return` / `throw`, each producing a [`Step`] or
//! a thrown value.
//!
//! Two ready-made implementations:
//!
//! - [`Coroutine`]: an async body that suspends at `co.yield_(v).await` and
//!   receives whatever the caller resumes it with. A `return` or `throw` from
//!   the caller surfaces at the suspension point as an [`Abrupt`] error, so
//!   the body can clean up and propagate it with `?`, or catch a throw and
//!   keep going.
//! - [`StreamGenerator`]: adapts any `Stream` of values; it ignores inputs.
//!
//! Both follow the usual generator rules: a generator that was never started
//! finishes immediately on `return`/`throw` without running its body, and a
//! finished generator answers `next` with `{undefined, done}`, `return(v)`
//! with `{v, done}` and rethrows on `throw`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use futures::StreamExt;
use offrpc::Resume;
use offrpc::Step;
use offrpc::Value;

use crate::target::Thrown;

/// A live iterator the executor can resume.
#[async_trait::async_trait]
pub trait Generator: Send {
    /// Applies one operation. `Err` carries the thrown value; after an `Err`
    /// or a `done` step the generator is finished.
    async fn resume(&mut self, resume: Resume) -> Result<Step, Thrown>;
}

/// Answer of a generator that has already finished.
fn finished(resume: Resume) -> Result<Step, Thrown> {
    match resume {
        Resume::Next(_) => Ok(Step::done(Value::Undefined)),
        Resume::Return(value) => Ok(Step::done(value)),
        Resume::Throw(error) => Err(Thrown(error)),
    }
}

// ============================================================================
//  COROUTINE
// ============================================================================

/// How a coroutine body left its suspension point other than by `next`.
#[derive(Clone, Debug, PartialEq)]
pub enum Abrupt {
    /// The caller asked the generator to return this value.
    Return(Value),
    /// The caller, or the body itself, threw this value.
    Throw(Value),
}

impl From<Thrown> for Abrupt {
    fn from(thrown: Thrown) -> Self {
        Abrupt::Throw(thrown.0)
    }
}

type Body = Pin<Box<dyn Future<Output = Result<Value, Abrupt>> + Send>>;
type Start = Box<dyn FnOnce(Co) -> Body + Send>;

/// Hand-off between the driver and a suspended body.
#[derive(Default)]
struct Slot {
    yielded: Option<Value>,
    resumed: Option<Resume>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The yielding handle given to a coroutine body.
pub struct Co {
    slot: Arc<Mutex<Slot>>,
}

impl Co {
    /// Yields `value` to the caller and waits to be resumed.
    ///
    /// Returns the value passed to the next `next(..)`, or the `Abrupt`
    /// completion requested by `return(..)` / `throw(..)`.
    pub async fn yield_(&self, value: impl Into<Value>) -> Result<Value, Abrupt> {
        let suspend = Suspend { slot: self.slot.clone(), value: Some(value.into()) };
        match suspend.await {
            Resume::Next(input) => Ok(input),
            Resume::Return(value) => Err(Abrupt::Return(value)),
            Resume::Throw(error) => Err(Abrupt::Throw(error)),
        }
    }
}

/// Parks the yielded value on first poll, completes once resumed.
struct Suspend {
    slot: Arc<Mutex<Slot>>,
    value: Option<Value>,
}

impl Future for Suspend {
    type Output = Resume;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Resume> {
        let this = self.get_mut();
        let mut slot = lock(&this.slot);
        if let Some(value) = this.value.take() {
            slot.yielded = Some(value);
            return Poll::Pending;
        }
        match slot.resumed.take() {
            Some(resume) => Poll::Ready(resume),
            // the driver polls again right after resuming; no waker needed
            None => Poll::Pending,
        }
    }
}

enum State {
    Fresh(Start),
    Suspended(Body),
    Finished,
}

enum Outcome {
    Yielded(Value),
    Completed(Result<Value, Abrupt>),
}

/// A generator written as an async body.
pub struct Coroutine {
    state: State,
    slot: Arc<Mutex<Slot>>,
}

impl Coroutine {
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Co) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, Abrupt>> + Send + 'static,
    {
        let start: Start = Box::new(move |co| Box::pin(body(co)));
        Self { state: State::Fresh(start), slot: Arc::new(Mutex::new(Slot::default())) }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }
}

#[async_trait::async_trait]
impl Generator for Coroutine {
    async fn resume(&mut self, resume: Resume) -> Result<Step, Thrown> {
        let mut body = match std::mem::replace(&mut self.state, State::Finished) {
            State::Finished => return finished(resume),
            State::Fresh(start) => match resume {
                // the first input has no yield to land on and is dropped
                Resume::Next(_) => start(Co { slot: self.slot.clone() }),
                other => return finished(other),
            },
            State::Suspended(body) => {
                lock(&self.slot).resumed = Some(resume);
                body
            }
        };

        let slot = self.slot.clone();
        let outcome = futures::future::poll_fn(|cx| match body.as_mut().poll(cx) {
            Poll::Ready(result) => Poll::Ready(Outcome::Completed(result)),
            Poll::Pending => match lock(&slot).yielded.take() {
                Some(value) => Poll::Ready(Outcome::Yielded(value)),
                None => Poll::Pending,
            },
        })
        .await;

        match outcome {
            Outcome::Yielded(value) => {
                self.state = State::Suspended(body);
                Ok(Step::yielded(value))
            }
            Outcome::Completed(Ok(value)) => Ok(Step::done(value)),
            Outcome::Completed(Err(Abrupt::Return(value))) => Ok(Step::done(value)),
            Outcome::Completed(Err(Abrupt::Throw(error))) => Err(Thrown(error)),
        }
    }
}

// ============================================================================
//  STREAMS
// ============================================================================

/// A generator over a stream of values. Inputs to `next` are ignored; the
/// return value is `undefined`.
pub struct StreamGenerator {
    stream: Option<Pin<Box<dyn Stream<Item = Value> + Send>>>,
}

impl StreamGenerator {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        Self { stream: Some(Box::pin(stream)) }
    }

    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::new(futures::stream::iter(values))
    }
}

#[async_trait::async_trait]
impl Generator for StreamGenerator {
    async fn resume(&mut self, resume: Resume) -> Result<Step, Thrown> {
        let Some(stream) = self.stream.as_mut() else {
            return finished(resume);
        };
        match resume {
            Resume::Next(_) => match stream.next().await {
                Some(value) => Ok(Step::yielded(value)),
                None => {
                    self.stream = None;
                    Ok(Step::done(Value::Undefined))
                }
            },
            other => {
                self.stream = None;
                finished(other)
            }
        }
    }
}
