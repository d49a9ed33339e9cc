//! # Remote Executor
//!
//! The callee side of a bridge. Reads `Invoke` messages off a channel, runs
//! the bound target, and answers each with exactly one `Reply`.
//!
//! ## Processing model
//!
//! One task, one loop. Invokes are dispatched strictly in arrival order.
//! Plain targets run inline; async targets and generator steps become futures
//! polled concurrently on the same task, so their replies go out in
//! completion order. The live-session table is owned by the loop alone.
//!
//! ## Sessions
//!
//! An `Advance` naming a session id that was never claimed opens a session:
//! the factory runs and `{undefined, false}` is sent back without advancing
//! the generator. On a live session it is `next`. Anything aimed at a session
//! that is gone, or already has a step in flight, is answered with a protocol
//! violation so the caller fails instead of hanging.
//!
//! One exception: a single `Return` may queue behind a step in flight. A
//! caller that gave up on a step sends it to release the generator; it is
//! applied once the step settles, and answered after the step's own reply.
//!
//! ## Bad frames
//!
//! An invoke frame that cannot be decoded is skipped. If its request id can
//! still be read, that request is answered with a protocol violation.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use offrpc::Invoke;
use offrpc::Message;
use offrpc::OpCode;
use offrpc::Reply;
use offrpc::RequestId;
use offrpc::Resume;
use offrpc::SessionId;
use offrpc::Step;
use offrpc::Value;

use crate::channel::Channel;
use crate::config::Options;
use crate::generator::Generator;
use crate::target::Target;
use crate::target::TargetKind;
use crate::transfer::TransferDetector;
use crate::transport;
use crate::transport::TransportError;

/// Prefix of every reply text produced for a protocol violation.
pub const VIOLATION_PREFIX: &str = "protocol violation: ";

/// How many skipped session ids below the high-water mark are remembered.
const MAX_SKIPPED_SESSIONS: u64 = 1024;

enum Slot {
    Idle(Box<dyn Generator>),
    /// A step is in flight; the generator is inside that future.
    Busy {
        /// A `Return` that arrived meanwhile, applied when the step settles.
        release: Option<(RequestId, Value)>,
    },
}

/// A finished unit of in-flight work.
struct Completion {
    request: RequestId,
    outcome: Result<Value, String>,
    /// For generator steps: the session, and its generator if still live.
    session: Option<(SessionId, Option<Box<dyn Generator>>)>,
}

type Task = BoxFuture<'static, Completion>;

/// Remembers which session ids were ever claimed, so a retired id can never
/// open a fresh generator.
#[derive(Default)]
struct SessionLedger {
    high_water: u64,
    skipped: BTreeSet<u64>,
}

impl SessionLedger {
    /// Claims `id` for a new session. False if it was claimed before.
    fn claim(&mut self, id: SessionId) -> bool {
        let n = id.0;
        if n > self.high_water {
            let from = self.high_water.max(n.saturating_sub(MAX_SKIPPED_SESSIONS + 1)) + 1;
            self.skipped.extend(from..n);
            while self.skipped.len() as u64 > MAX_SKIPPED_SESSIONS {
                self.skipped.pop_first();
            }
            self.high_water = n;
            true
        } else {
            self.skipped.remove(&n)
        }
    }
}

/// Runs a target on behalf of a remote caller.
pub struct Executor {
    name: String,
    target: Target,
    detector: TransferDetector,
    sessions: HashMap<SessionId, Slot>,
    ledger: SessionLedger,
}

impl Executor {
    pub fn new(target: Target, options: &Options) -> Self {
        Self {
            name: options.name.clone(),
            target,
            detector: TransferDetector::new(options.use_transfer_detection),
            sessions: HashMap::new(),
            ledger: SessionLedger::default(),
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.target.kind()
    }

    /// Serves invocations until the caller closes the channel.
    ///
    /// Work accepted before the close still gets its reply. Returns the
    /// transport error if the channel failed instead of closing.
    pub async fn serve(mut self, channel: Box<dyn Channel>) -> transport::Result<()> {
        tracing::debug!(executor = %self.name, kind = ?self.target.kind(), "executor started");
        let mut inflight: FuturesUnordered<Task> = FuturesUnordered::new();

        let result = loop {
            tokio::select! {
                incoming = channel.recv() => match incoming {
                    Ok(Some(Message::Invoke(invoke))) => {
                        if let Some(reply) = self.dispatch(invoke, &mut inflight) {
                            if let Err(e) = respond(&self.name, self.detector, &*channel, reply).await {
                                break Err(e);
                            }
                        }
                    }
                    Ok(Some(Message::Reply(reply))) => {
                        tracing::warn!(executor = %self.name, request = %reply.request, "executor received a reply");
                    }
                    Ok(None) => break Ok(()),
                    Err(TransportError::Malformed { request, error }) => {
                        tracing::warn!(executor = %self.name, ?request, error = %error, "undecodable invoke frame");
                        let Some(request) = request else {
                            continue;
                        };
                        let reply = violation(request, format!("invoke could not be decoded: {}", error));
                        if let Err(e) = respond(&self.name, self.detector, &*channel, reply).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                },
                Some(done) = inflight.next(), if !inflight.is_empty() => {
                    let replies = self.complete(done, &mut inflight);
                    if let Err(e) = respond_all(&self.name, self.detector, &*channel, replies).await {
                        break Err(e);
                    }
                }
            }
        };

        if result.is_ok() {
            while let Some(done) = inflight.next().await {
                let replies = self.complete(done, &mut inflight);
                if respond_all(&self.name, self.detector, &*channel, replies).await.is_err() {
                    break;
                }
            }
        }

        let live = self.sessions.len();
        self.sessions.clear();
        channel.close();

        match &result {
            Ok(()) => tracing::debug!(executor = %self.name, live, "executor stopped"),
            Err(e) => tracing::error!(executor = %self.name, live, error = %e, "executor stopped"),
        }
        result
    }

    /// Routes one invoke. Returns the reply when it is available right away.
    fn dispatch(&mut self, invoke: Invoke, inflight: &mut FuturesUnordered<Task>) -> Option<Reply> {
        let Invoke { request, args, op, session } = invoke;
        tracing::debug!(executor = %self.name, %request, ?op, ?session, "dispatch");

        if session.is_none() && op == OpCode::Advance {
            match &self.target {
                Target::Plain(f) => {
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| f(args)));
                    return Some(match outcome {
                        Ok(Ok(value)) => Reply::ok(request, value),
                        Ok(Err(thrown)) => Reply::err(request, thrown.to_text()),
                        Err(panic) => Reply::err(request, panic_text(panic)),
                    });
                }
                Target::Async(f) => {
                    let f = f.clone();
                    let task = async move {
                        let call = AssertUnwindSafe(async move { f(args).await });
                        let outcome = match call.catch_unwind().await {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(thrown)) => Err(thrown.to_text()),
                            Err(panic) => Err(panic_text(panic)),
                        };
                        Completion { request, outcome, session: None }
                    };
                    inflight.push(task.boxed());
                    return None;
                }
                Target::Generator(_) => {
                    return Some(violation(request, "generator targets are driven through sessions"));
                }
            }
        }

        match session {
            Some(session) if self.target.kind().is_generator() => {
                self.dispatch_session(request, session, op, args, inflight)
            }
            Some(session) => Some(violation(request, format!("{} targets a function, not a generator", session))),
            None => Some(violation(request, format!("{:?} requires a session", op))),
        }
    }

    fn dispatch_session(
        &mut self,
        request: RequestId,
        session: SessionId,
        op: OpCode,
        args: Vec<Value>,
        inflight: &mut FuturesUnordered<Task>,
    ) -> Option<Reply> {
        if op == OpCode::Advance && !self.sessions.contains_key(&session) {
            return Some(self.open(request, session, args));
        }

        let Some(slot) = self.sessions.get_mut(&session) else {
            return Some(violation(request, format!("{} is not live", session)));
        };
        let input = args.into_iter().next().unwrap_or_default();

        let generator = match std::mem::replace(slot, Slot::Busy { release: None }) {
            Slot::Idle(generator) => generator,
            Slot::Busy { release: None } if op == OpCode::Return => {
                tracing::debug!(executor = %self.name, %request, %session, "release queued behind step in flight");
                *slot = Slot::Busy { release: Some((request, input)) };
                return None;
            }
            busy @ Slot::Busy { .. } => {
                *slot = busy;
                return Some(violation(request, format!("{} already has a step in flight", session)));
            }
        };

        let resume = match op {
            OpCode::Advance => Resume::Next(input),
            OpCode::Return => Resume::Return(input),
            OpCode::Throw => Resume::Throw(input),
        };
        self.step(request, session, generator, resume, inflight);
        None
    }

    /// Starts one step of a session's generator; the slot stays busy until
    /// the step's completion is folded back in.
    fn step(
        &mut self,
        request: RequestId,
        session: SessionId,
        mut generator: Box<dyn Generator>,
        resume: Resume,
        inflight: &mut FuturesUnordered<Task>,
    ) {
        self.sessions.insert(session, Slot::Busy { release: None });
        let task = async move {
            let outcome = AssertUnwindSafe(generator.resume(resume)).catch_unwind().await;
            let (outcome, live) = match outcome {
                Ok(Ok(step)) if !step.done => (Ok(step.into_value()), true),
                Ok(Ok(step)) => (Ok(step.into_value()), false),
                Ok(Err(thrown)) => (Err(thrown.to_text()), false),
                Err(panic) => (Err(panic_text(panic)), false),
            };
            Completion { request, outcome, session: Some((session, live.then_some(generator))) }
        };
        inflight.push(task.boxed());
    }

    /// Creates a generator for a never-seen session id.
    fn open(&mut self, request: RequestId, session: SessionId, args: Vec<Value>) -> Reply {
        let Target::Generator(factory) = &self.target else {
            return violation(request, "target is not a generator");
        };
        if !self.ledger.claim(session) {
            return violation(request, format!("{} has already completed", session));
        }

        match std::panic::catch_unwind(AssertUnwindSafe(|| factory(args))) {
            Ok(generator) => {
                self.sessions.insert(session, Slot::Idle(generator));
                tracing::debug!(executor = %self.name, %session, live = self.sessions.len(), "session opened");
                Reply::ok(request, Step::ready().into_value())
            }
            Err(panic) => Reply::err(request, panic_text(panic)),
        }
    }

    /// Folds a finished task back into the session table.
    ///
    /// Returns the task's reply, followed by the reply to a queued release if
    /// the generator finished on its own and the release has nothing to do.
    fn complete(&mut self, done: Completion, inflight: &mut FuturesUnordered<Task>) -> Vec<Reply> {
        let mut replies = vec![match done.outcome {
            Ok(value) => Reply::ok(done.request, value),
            Err(message) => Reply::err(done.request, message),
        }];

        let Some((session, generator)) = done.session else {
            return replies;
        };
        let release = match self.sessions.remove(&session) {
            Some(Slot::Busy { release }) => release,
            _ => None,
        };

        match (generator, release) {
            (Some(generator), Some((request, value))) => {
                self.step(request, session, generator, Resume::Return(value), inflight);
            }
            (Some(generator), None) => {
                self.sessions.insert(session, Slot::Idle(generator));
            }
            (None, release) => {
                if let Some((request, value)) = release {
                    replies.push(Reply::ok(request, Step::done(value).into_value()));
                }
                tracing::debug!(executor = %self.name, %session, "session retired");
            }
        }
        replies
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// Sends a reply, transferring what the detector selects.
///
/// If the payload cannot be sent (e.g. an un-transferred port), the caller
/// gets an error reply instead.
async fn respond(
    name: &str,
    detector: TransferDetector,
    channel: &dyn Channel,
    reply: Reply,
) -> transport::Result<()> {
    let request = reply.request;
    let message = Message::Reply(reply);
    let transfer = detector.select(message.payload());

    match channel.send(message, transfer).await {
        Err(TransportError::Codec(e)) => {
            tracing::warn!(executor = %name, %request, error = %e, "reply payload could not be sent");
            let fallback = Message::Reply(Reply::err(request, e.to_string()));
            channel.send(fallback, Default::default()).await
        }
        other => other,
    }
}

async fn respond_all(
    name: &str,
    detector: TransferDetector,
    channel: &dyn Channel,
    replies: Vec<Reply>,
) -> transport::Result<()> {
    for reply in replies {
        respond(name, detector, channel, reply).await?;
    }
    Ok(())
}

fn violation(request: RequestId, detail: impl std::fmt::Display) -> Reply {
    tracing::warn!(%request, %detail, "protocol violation");
    Reply::err(request, format!("{}{}", VIOLATION_PREFIX, detail))
}

fn panic_text(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {}", msg)
    } else {
        "panic".into()
    }
}
