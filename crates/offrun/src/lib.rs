//! # Offrun
//!
//! Runs plain functions, async functions and generators in an isolated
//! executor, and calls them from elsewhere as if they were local.
//!
//! ## Architecture
//!
//! - **Caller**: allocates request ids, registers pending calls, sends
//!   invokes, and settles them from a reply pump.
//! - **Session**: the caller's handle on a remote generator.
//! - **Executor**: runs the bound target and owns the live generators.
//! - **Channel**: moves messages between the two, transferring buffers,
//!   ports and bitmaps instead of copying them when enabled.

pub mod bridge;
pub mod caller;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod generator;
pub mod registry;
pub mod session;
pub mod target;
pub mod transfer;
pub mod transport;

pub use bridge::Remote;
pub use bridge::bridge;
pub use bridge::connect;
pub use caller::Caller;
pub use channel::Channel;
pub use channel::DuplexChannel;
pub use channel::TransportChannel;
pub use config::Options;
pub use error::CallError;
pub use executor::Executor;
pub use generator::Abrupt;
pub use generator::Co;
pub use generator::Coroutine;
pub use generator::Generator;
pub use generator::StreamGenerator;
pub use session::Session;
pub use target::Target;
pub use target::TargetKind;
pub use target::Thrown;
pub use transfer::TransferDetector;
pub use transfer::TransferSet;
pub use transport::DuplexTransport;
pub use transport::Transport;
pub use transport::TransportError;

pub use offrpc::Value;
