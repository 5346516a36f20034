//! Request data model
//!
//! A request is immutable after creation: the dispatcher stamps it with a
//! process-unique id and a submission timestamp, then hands it to exactly
//! one worker.

use serde_json::{Map, Value};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Unique identifier for a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh id, unique for the process lifetime of the dispatcher
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single inference request routed to a worker
#[derive(Debug, Clone)]
pub struct InferRequest {
    /// Unique request identifier
    pub id: RequestId,

    /// Positional arguments
    pub args: Vec<Value>,

    /// Named arguments
    pub kwargs: Map<String, Value>,

    /// Whether the caller expects an ordered chunk sequence
    pub stream: bool,

    /// Submission time
    pub submitted_at: Instant,
}

impl InferRequest {
    /// Create a new request, stamping id and submission time
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>, stream: bool) -> Self {
        Self {
            id: RequestId::new(),
            args,
            kwargs,
            stream,
            submitted_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = InferRequest::new(Vec::new(), Map::new(), false);
        let b = InferRequest::new(Vec::new(), Map::new(), false);

        assert_ne!(a.id, b.id);
    }
}
