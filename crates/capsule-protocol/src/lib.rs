//! Wire protocol between a capsule controller and the launcher running inside
//! an isolated environment.
//!
//! Every message is an [`Envelope`] (`{id, type, payload}`) encoded as JSON and
//! sent in a length-prefixed frame:
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [JSON envelope bytes]
//! ```
//!
//! The framing and correlation logic know nothing about the transport. The
//! controller speaks over the child's stdio pipes; tests use in-memory duplex
//! streams.
//!
//! ```ignore
//! use capsule_protocol::{channel, Envelope, CallPayload, PendingCalls};
//!
//! let (mut reader, mut writer) = channel(child_stdout, child_stdin);
//! let pending = PendingCalls::new();
//! let (id, rx) = pending.register("m.add");
//! writer.send(&Envelope::call(id, &CallPayload::new("m", "add", args, kwargs))?).await?;
//! ```

pub mod channel;
pub mod connection;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod value;

pub use channel::{channel, ChannelReader, ChannelWriter};
pub use correlation::{Completion, PendingCalls};
pub use envelope::{
    CallPayload, Envelope, ErrorPayload, ImportPayload, LogPayload, LogStream, MessageType,
    ModuleInfo, ReadyPayload, PROTOCOL_VERSION,
};
pub use error::{ProtocolError, SerializationError};
pub use value::{from_value, to_value, Kwargs, Value};
