//! Callable capability interface
//!
//! The core does not care what a model is. Anything exposing one entry
//! point that accepts positional and named arguments and returns either a
//! single value or a lazily-produced chunk sequence can be bound to a
//! worker. The outcome is an explicit tagged union; the core never probes
//! return types to decide whether a result is streaming.

use offramp_common::Result;
use serde_json::{Map, Value};
use std::fmt;

/// Payload of one streamed unit, text or binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    /// A text fragment (framed as SSE lines by the transport layer)
    Text(String),

    /// A binary fragment (framed as raw chunk writes by the transport layer)
    Binary(Vec<u8>),
}

impl ChunkPayload {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            ChunkPayload::Text(s) => s.len(),
            ChunkPayload::Binary(b) => b.len(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the payload as text, lossily decoding binary data
    pub fn into_text(self) -> String {
        match self {
            ChunkPayload::Text(s) => s,
            ChunkPayload::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
        }
    }

    /// Consume the payload as raw bytes
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ChunkPayload::Text(s) => s.into_bytes(),
            ChunkPayload::Binary(b) => b,
        }
    }
}

/// Lazily-produced sequence of chunk payloads
///
/// The worker pulls items one at a time on its own thread; producing the
/// next item may block.
pub type ChunkIter = Box<dyn Iterator<Item = Result<ChunkPayload>> + Send>;

/// Tagged outcome of a callable invocation
pub enum CallOutcome {
    /// A single value
    Value(Value),

    /// A lazily-produced chunk sequence
    Stream(ChunkIter),
}

impl fmt::Debug for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            CallOutcome::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

/// Capability interface consumed by workers
///
/// A callable instance is exclusively owned by one worker thread for its
/// entire lifetime and is never invoked concurrently, so implementations
/// need not be thread-safe; `Send` is required only for the initial move
/// into the worker thread.
pub trait Callable: Send + 'static {
    /// Invoke the callable with positional and named arguments
    fn invoke(&mut self, args: &[Value], kwargs: &Map<String, Value>) -> Result<CallOutcome>;
}
