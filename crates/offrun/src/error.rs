//! # Error Definitions
//!
//! What a caller can observe when a remote call does not produce a value.

use offrpc::WireError;

use crate::target::TargetKind;
use crate::transport::TransportError;

/// Errors surfaced by remote calls and session operations.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The target threw, rejected or panicked. Only its text crosses over.
    Remote(String),
    /// A message broke the protocol (unknown id, malformed acknowledgment).
    Protocol(String),
    /// The channel failed or closed before a reply arrived.
    Transport(TransportError),
    /// `call` was used on a generator, or `session` on a function.
    KindMismatch { expected: TargetKind, found: TargetKind },
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(msg) => write!(f, "{}", msg),
            Self::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            Self::Transport(e) => write!(f, "Transport failure: {}", e),
            Self::KindMismatch { expected, found } => {
                write!(f, "Target kind mismatch: expected {:?}, found {:?}", expected, found)
            }
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<WireError> for CallError {
    fn from(e: WireError) -> Self {
        Self::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
