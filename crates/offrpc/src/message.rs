//! # Protocol Messages
//!
//! Defines the two envelopes exchanged over a channel: `Invoke` travels from
//! caller to executor, `Reply` travels back.
//!
//! ## Invariants
//! - A plain call carries no session id and always uses `OpCode::Advance`.
//! - A generator operation always carries a session id.
//! - `OpCode::Advance` with a session id means "open" for an unseen session and
//!   "next" for a live one; the executor resolves which (see `OpKind`).

use crate::error::Result;
use crate::error::WireError;
use crate::ids::RequestId;
use crate::ids::SessionId;
use crate::value::Value;

/// The semantic operation an invocation performs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Plain invocation, or the opening of a generator session.
    Call,
    Next,
    Return,
    Throw,
}

impl OpKind {
    /// The wire code for this operation. `Call` and `Next` share a code.
    pub fn code(self) -> OpCode {
        match self {
            OpKind::Call | OpKind::Next => OpCode::Advance,
            OpKind::Return => OpCode::Return,
            OpKind::Throw => OpCode::Throw,
        }
    }
}

/// The operation discriminator as it appears on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Advance = 0,
    Return = 1,
    Throw = 2,
}

impl OpCode {
    pub fn from_u64(code: u64) -> Result<Self> {
        match code {
            0 => Ok(OpCode::Advance),
            1 => Ok(OpCode::Return),
            2 => Ok(OpCode::Throw),
            other => Err(WireError::Malformed(format!("unknown op code {}", other))),
        }
    }
}

/// How a generator is resumed, with the value handed to it.
#[derive(Clone, Debug, PartialEq)]
pub enum Resume {
    Next(Value),
    Return(Value),
    Throw(Value),
}

impl Resume {
    pub fn kind(&self) -> OpKind {
        match self {
            Resume::Next(_) => OpKind::Next,
            Resume::Return(_) => OpKind::Return,
            Resume::Throw(_) => OpKind::Throw,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Resume::Next(v) | Resume::Return(v) | Resume::Throw(v) => v,
        }
    }
}

/// A request from caller to executor.
#[derive(Clone, Debug, PartialEq)]
pub struct Invoke {
    pub request: RequestId,
    pub args: Vec<Value>,
    pub op: OpCode,
    pub session: Option<SessionId>,
}

impl Invoke {
    /// A plain invocation of the target.
    pub fn call(request: RequestId, args: Vec<Value>) -> Self {
        Self { request, args, op: OpCode::Advance, session: None }
    }

    /// Opens a generator session by invoking the factory with `args`.
    pub fn open(request: RequestId, session: SessionId, args: Vec<Value>) -> Self {
        Self { request, args, op: OpCode::Advance, session: Some(session) }
    }

    /// Resumes a live generator session.
    pub fn resume(request: RequestId, session: SessionId, resume: Resume) -> Self {
        let op = resume.kind().code();
        Self { request, args: vec![resume.into_value()], op, session: Some(session) }
    }
}

/// Outcome carried by a reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    Ok(Value),
    /// Only the textual description of the failure crosses the boundary.
    Err(String),
}

impl Status {
    pub fn code(&self) -> u8 {
        match self {
            Status::Ok(_) => 0,
            Status::Err(_) => 1,
        }
    }
}

/// A response from executor to caller.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub request: RequestId,
    pub status: Status,
}

impl Reply {
    pub fn ok(request: RequestId, payload: Value) -> Self {
        Self { request, status: Status::Ok(payload) }
    }

    pub fn err(request: RequestId, message: impl Into<String>) -> Self {
        Self { request, status: Status::Err(message.into()) }
    }
}

/// Top-level envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Invoke(Invoke),
    Reply(Reply),
}

impl Message {
    pub fn request(&self) -> RequestId {
        match self {
            Message::Invoke(invoke) => invoke.request,
            Message::Reply(reply) => reply.request,
        }
    }

    /// The primary payload: the arguments of an invoke, or the single value
    /// of a successful reply. Error replies have none.
    pub fn payload(&self) -> &[Value] {
        match self {
            Message::Invoke(invoke) => &invoke.args,
            Message::Reply(Reply { status: Status::Ok(value), .. }) => std::slice::from_ref(value),
            Message::Reply(_) => &[],
        }
    }

    pub fn payload_mut(&mut self) -> &mut [Value] {
        match self {
            Message::Invoke(invoke) => &mut invoke.args,
            Message::Reply(Reply { status: Status::Ok(value), .. }) => std::slice::from_mut(value),
            Message::Reply(_) => &mut [],
        }
    }
}

impl From<Invoke> for Message {
    fn from(invoke: Invoke) -> Self {
        Message::Invoke(invoke)
    }
}

impl From<Reply> for Message {
    fn from(reply: Reply) -> Self {
        Message::Reply(reply)
    }
}

/// One iterator result, carried as a `{value, done}` object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Step {
    pub value: Value,
    pub done: bool,
}

impl Step {
    pub fn yielded(value: impl Into<Value>) -> Self {
        Self { value: value.into(), done: false }
    }

    pub fn done(value: impl Into<Value>) -> Self {
        Self { value: value.into(), done: true }
    }

    /// The acknowledgment sent when a session opens: `{undefined, false}`.
    pub fn ready() -> Self {
        Self { value: Value::Undefined, done: false }
    }

    pub fn is_ready(&self) -> bool {
        !self.done && self.value.is_undefined()
    }

    pub fn into_value(self) -> Value {
        Value::object([("value", self.value), ("done", Value::Bool(self.done))])
    }

    /// Reads a step back out of a reply payload.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(WireError::Malformed(format!("expected a step object, got {:?}", other.kind())));
            }
        };
        let done = fields
            .remove("done")
            .and_then(|d| d.as_bool())
            .ok_or_else(|| WireError::Malformed("step is missing a boolean `done`".into()))?;
        let value = fields.remove("value").unwrap_or_default();
        Ok(Self { value, done })
    }
}
