//! # JSON Tuple Codec
//!
//! Messages travel as ordered JSON tuples:
//!
//! - `Invoke  = [requestId, args, opCode, sessionId?]`
//! - `Success = [requestId, 0, payload]`
//! - `Failure = [requestId, 1, message]`
//!
//! An invoke is recognized by its second element being an array; a reply by
//! it being a status number.

use serde::Serialize;
use serde::Serializer;
use serde::ser::SerializeTuple;
use serde_json::Value as Json;

use crate::error::Result;
use crate::error::WireError;
use crate::ids::RequestId;
use crate::ids::SessionId;
use crate::message::Invoke;
use crate::message::Message;
use crate::message::OpCode;
use crate::message::Reply;
use crate::message::Status;
use crate::value::Value;

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Message::Invoke(invoke) => {
                let len = if invoke.session.is_some() { 4 } else { 3 };
                let mut tuple = serializer.serialize_tuple(len)?;
                tuple.serialize_element(&invoke.request)?;
                tuple.serialize_element(&invoke.args)?;
                tuple.serialize_element(&(invoke.op as u8))?;
                if let Some(session) = &invoke.session {
                    tuple.serialize_element(session)?;
                }
                tuple.end()
            }
            Message::Reply(reply) => {
                let mut tuple = serializer.serialize_tuple(3)?;
                tuple.serialize_element(&reply.request)?;
                tuple.serialize_element(&reply.status.code())?;
                match &reply.status {
                    Status::Ok(payload) => tuple.serialize_element(payload)?,
                    Status::Err(message) => tuple.serialize_element(message)?,
                }
                tuple.end()
            }
        }
    }
}

/// Encodes a message into its JSON bytes.
///
/// Ports have no JSON form; a payload holding one fails with
/// `WireError::Unserializable`.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    if message.payload().iter().any(Value::holds_port) {
        return Err(WireError::Unserializable("MessagePort"));
    }
    Ok(serde_json::to_vec(message)?)
}

/// Decodes a message from JSON bytes.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let json: Json = serde_json::from_slice(bytes)?;
    from_json(json)
}

/// Best-effort request id of a frame that failed to decode, so the failure
/// can still be routed to the call it belongs to.
pub fn peek_request(bytes: &[u8]) -> Option<RequestId> {
    match serde_json::from_slice::<Json>(bytes).ok()? {
        Json::Array(items) => items.first().and_then(Json::as_u64).map(RequestId),
        _ => None,
    }
}

/// Reads a message out of an already-parsed JSON tuple.
pub fn from_json(json: Json) -> Result<Message> {
    let Json::Array(items) = json else {
        return Err(WireError::Malformed("message is not a tuple".into()));
    };
    let mut items = items.into_iter();

    let request = match items.next() {
        Some(id) => RequestId(expect_u64(&id, "requestId")?),
        None => return Err(WireError::Malformed("empty tuple".into())),
    };

    match items.next() {
        Some(Json::Array(args)) => {
            let args = args.into_iter().map(Value::try_from).collect::<Result<Vec<_>>>()?;
            let op = match items.next() {
                Some(code) => OpCode::from_u64(expect_u64(&code, "opKind")?)?,
                None => OpCode::Advance,
            };
            let session = match items.next() {
                None | Some(Json::Null) => None,
                Some(id) => Some(SessionId(expect_u64(&id, "sessionId")?)),
            };
            expect_end(items)?;
            Ok(Message::Invoke(Invoke { request, args, op, session }))
        }
        Some(status) => {
            let status_code = expect_u64(&status, "status")?;
            let payload = items.next().unwrap_or(Json::Null);
            expect_end(items)?;
            let status = match status_code {
                0 => Status::Ok(Value::try_from(payload)?),
                1 => match payload {
                    Json::String(message) => Status::Err(message),
                    other => Status::Err(other.to_string()),
                },
                other => return Err(WireError::Malformed(format!("unknown status {}", other))),
            };
            Ok(Message::Reply(Reply { request, status }))
        }
        None => Err(WireError::Malformed(format!("tuple for {} has no body", request))),
    }
}

fn expect_u64(json: &Json, field: &str) -> Result<u64> {
    json.as_u64()
        .ok_or_else(|| WireError::Malformed(format!("`{}` must be a non-negative integer, got {}", field, json)))
}

fn expect_end(mut items: impl Iterator<Item = Json>) -> Result<()> {
    match items.next() {
        None => Ok(()),
        Some(extra) => Err(WireError::Malformed(format!("unexpected trailing element {}", extra))),
    }
}
