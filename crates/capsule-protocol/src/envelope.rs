//! Message envelope and typed payloads.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, SerializationError};
use crate::value::{Kwargs, Value};

/// Version carried by READY. The controller refuses a launcher speaking any
/// other version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Import,
    Call,
    Result,
    Error,
    Log,
    Ready,
    Shutdown,
}

impl MessageType {
    /// Requests that must be answered by exactly one RESULT or ERROR.
    pub fn is_request(self) -> bool {
        matches!(self, MessageType::Import | MessageType::Call)
    }

    /// Messages that complete a pending request.
    pub fn is_response(self) -> bool {
        matches!(self, MessageType::Result | MessageType::Error)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Import => "IMPORT",
            MessageType::Call => "CALL",
            MessageType::Result => "RESULT",
            MessageType::Error => "ERROR",
            MessageType::Log => "LOG",
            MessageType::Ready => "READY",
            MessageType::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// One framed message: `{ "id", "type", "payload" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// IMPORT request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportPayload {
    pub module: String,
}

/// RESULT payload answering an IMPORT: the module's exported callables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub module: String,
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// CALL request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub module: String,
    pub attribute: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl CallPayload {
    pub fn new(
        module: impl Into<String>,
        attribute: impl Into<String>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            module: module.into(),
            attribute: attribute.into(),
            args,
            kwargs,
        }
    }

    /// `module.attribute`, used in logs and pending-call targets.
    pub fn target(&self) -> String {
        format!("{}.{}", self.module, self.attribute)
    }
}

/// ERROR payload: a failure raised on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub traceback: String,
}

/// READY payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    pub protocol_version: u32,
}

/// Output stream a LOG line was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => f.write_str("stdout"),
            LogStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// LOG payload: one line of output produced while serving a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub stream: LogStream,
    pub text: String,
}

fn payload_json<T: Serialize>(payload: &T) -> Result<serde_json::Value, SerializationError> {
    serde_json::to_value(payload).map_err(|e| {
        SerializationError::new(std::any::type_name::<T>(), e.to_string())
    })
}

impl Envelope {
    fn new(id: u64, kind: MessageType, payload: serde_json::Value) -> Self {
        Self { id, kind, payload }
    }

    pub fn import(id: u64, module: impl Into<String>) -> Self {
        Self::new(
            id,
            MessageType::Import,
            serde_json::json!({ "module": module.into() }),
        )
    }

    pub fn call(id: u64, payload: &CallPayload) -> Result<Self, SerializationError> {
        for arg in &payload.args {
            arg.check_encodable()?;
        }
        for value in payload.kwargs.values() {
            value.check_encodable()?;
        }
        Ok(Self::new(id, MessageType::Call, payload_json(payload)?))
    }

    pub fn result(id: u64, value: &Value) -> Result<Self, SerializationError> {
        value.check_encodable()?;
        Ok(Self::new(id, MessageType::Result, payload_json(value)?))
    }

    pub fn module_info(id: u64, info: &ModuleInfo) -> Result<Self, SerializationError> {
        Ok(Self::new(id, MessageType::Result, payload_json(info)?))
    }

    pub fn error(id: u64, payload: &ErrorPayload) -> Result<Self, SerializationError> {
        Ok(Self::new(id, MessageType::Error, payload_json(payload)?))
    }

    pub fn log(id: u64, stream: LogStream, text: impl Into<String>) -> Self {
        Self::new(
            id,
            MessageType::Log,
            serde_json::json!({ "stream": stream, "text": text.into() }),
        )
    }

    pub fn ready() -> Self {
        Self::new(
            0,
            MessageType::Ready,
            serde_json::json!({ "protocolVersion": PROTOCOL_VERSION }),
        )
    }

    pub fn shutdown(id: u64) -> Self {
        Self::new(id, MessageType::Shutdown, serde_json::Value::Null)
    }

    /// Decode the payload into its typed form.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ProtocolError::Malformed(format!(
                "{} payload (id {}) is not a valid {}: {}",
                self.kind,
                self.id,
                std::any::type_name::<T>(),
                e
            ))
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
