//! Error taxonomy surfaced to callers.

use std::fmt;
use std::time::Duration;

use capsule_protocol::{ErrorPayload, ProtocolError, SerializationError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failure raised inside the environment while serving a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteException {
    /// Remote error type name, e.g. `AttributeError` or `Panic`.
    pub error_type: String,
    pub message: String,
    pub traceback: String,
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote {}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for RemoteException {}

impl From<ErrorPayload> for RemoteException {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            error_type: payload.error_type,
            message: payload.message,
            traceback: payload.traceback,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("environment `{0}` already exists")]
    EnvironmentAlreadyExists(String),

    #[error("environment `{0}` not found")]
    EnvironmentNotFound(String),

    #[error("invalid dependency spec: {0}")]
    InvalidSpec(String),

    #[error("environment `{name}` did not become ready within {timeout:?}")]
    LaunchTimeout { name: String, timeout: Duration },

    #[error("environment `{name}` failed to launch: {reason}")]
    LaunchFailed { name: String, reason: String },

    #[error("protocol error: {0}")]
    ProtocolError(ProtocolError),

    #[error(transparent)]
    SerializationError(#[from] SerializationError),

    #[error(transparent)]
    RemoteException(#[from] RemoteException),

    #[error("environment `{name}` crashed: {reason}")]
    EnvironmentCrashed { name: String, reason: String },

    #[error("environment `{0}` is closed")]
    EnvironmentClosed(String),

    #[error("call to {target} timed out after {timeout:?}")]
    CallTimeout { target: String, timeout: Duration },

    #[error("environment `{name}` did not exit within {timeout:?}")]
    ShutdownTimeout { name: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Serialization(e) => Error::SerializationError(e),
            other => Error::ProtocolError(other),
        }
    }
}

impl From<capsule_env::SpecError> for Error {
    fn from(err: capsule_env::SpecError) -> Self {
        Error::InvalidSpec(err.to_string())
    }
}

impl Error {
    /// The remote failure, when this error carries one.
    pub fn remote(&self) -> Option<&RemoteException> {
        match self {
            Error::RemoteException(e) => Some(e),
            _ => None,
        }
    }

    /// Errors after which the environment can no longer serve calls.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::EnvironmentCrashed { .. } | Error::EnvironmentClosed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_exception_from_payload() {
        let err: Error = RemoteException::from(ErrorPayload {
            error_type: "ValueError".into(),
            message: "bad".into(),
            traceback: "line 1".into(),
        })
        .into();
        let remote = err.remote().unwrap();
        assert_eq!(remote.error_type, "ValueError");
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_protocol_serialization_is_flattened() {
        let err: Error =
            ProtocolError::Serialization(SerializationError::new("f64", "NaN")).into();
        assert!(matches!(err, Error::SerializationError(_)));

        let err: Error = ProtocolError::UnmatchedId(9).into();
        assert!(matches!(err, Error::ProtocolError(ProtocolError::UnmatchedId(9))));
    }

    #[test]
    fn test_spec_error_becomes_invalid_spec() {
        let err: Error = capsule_env::SpecError::UnknownPackageManager("npm".into()).into();
        assert!(matches!(err, Error::InvalidSpec(ref m) if m.contains("npm")));
    }

    #[test]
    fn test_terminal_errors() {
        assert!(Error::EnvironmentClosed("x".into()).is_terminal());
        assert!(!Error::EnvironmentNotFound("x".into()).is_terminal());
    }
}
