//! # Error Definitions
//!
//! Failures of the wire layer itself: turning values and messages into bytes
//! and back, or cloning values that cannot be cloned.

/// Operational failures within the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// serde_json rejected the input or output.
    Json(String),
    /// The JSON was valid but did not have the shape of a message.
    Malformed(String),
    /// A value kind that has no JSON representation (e.g. a port).
    Unserializable(&'static str),
    /// A value kind that can only be transferred, never copied.
    DataClone(&'static str),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "JSON error: {}", msg),
            Self::Malformed(msg) => write!(f, "Malformed message: {}", msg),
            Self::Unserializable(kind) => write!(f, "{} cannot be serialized", kind),
            Self::DataClone(kind) => write!(f, "{} could not be cloned; it must be transferred", kind),
        }
    }
}

impl std::error::Error for WireError {}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
