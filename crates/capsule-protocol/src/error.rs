//! Protocol-level error types.

use std::fmt;

use crate::envelope::MessageType;

/// Errors raised by framing, envelope decoding, or response correlation.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error on channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unexpected {kind} message (id {id})")]
    UnexpectedMessage { id: u64, kind: MessageType },

    #[error("response id {0} does not match any pending request")]
    UnmatchedId(u64),

    #[error("channel is closed")]
    Closed,

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

/// A value fell outside the interchange set and cannot cross the channel.
///
/// `type_name` names the offending value's type; `reason` says what was wrong
/// with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationError {
    pub type_name: String,
    pub reason: String,
}

impl SerializationError {
    pub fn new(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    /// Replace a generic type name with the caller's concrete one while
    /// keeping the detail about the offending nested value.
    pub(crate) fn within(self, outer: &str) -> Self {
        Self {
            reason: format!("{} (in value of type {})", self.reason, outer),
            type_name: self.type_name,
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "value of type `{}` cannot cross the channel: {}",
            self.type_name, self.reason
        )
    }
}

impl std::error::Error for SerializationError {}

impl serde::ser::Error for SerializationError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        SerializationError::new("unknown", msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_error_names_type() {
        let err = SerializationError::new("f64", "non-finite float NaN");
        let message = err.to_string();
        assert!(message.contains("`f64`"));
        assert!(message.contains("NaN"));
    }

    #[test]
    fn test_within_keeps_inner_type() {
        let err = SerializationError::new("i32", "map keys must be text").within("my::Config");
        assert_eq!(err.type_name, "i32");
        assert!(err.reason.contains("my::Config"));
    }
}
