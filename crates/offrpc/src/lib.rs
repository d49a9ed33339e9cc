//! # OffRPC
//!
//! The wire protocol for running calls and generators in an isolated worker.
//!
//! ## Architecture
//!
//! A caller sends `Invoke` envelopes, the executor answers each with exactly
//! one `Reply` carrying the same request id. Generator sessions are
//! multiplexed over the same stream by a separate session id. This crate only
//! defines the shapes and their JSON tuple form; moving them around and
//! executing targets lives in `offrun`.

pub mod codec;
pub mod error;
pub mod ids;
pub mod message;
pub mod value;

pub use error::Result;
pub use error::WireError;
pub use ids::RequestId;
pub use ids::SessionId;
pub use message::Invoke;
pub use message::Message;
pub use message::OpCode;
pub use message::OpKind;
pub use message::Reply;
pub use message::Resume;
pub use message::Status;
pub use message::Step;
pub use value::Bitmap;
pub use value::Buffer;
pub use value::Kind;
pub use value::Port;
pub use value::Value;
