//! Single-resolution result hand-off
//!
//! A Bridge delivers exactly one result (or error) from a worker thread to
//! a suspended asynchronous waiter. The waiter parks on the runtime, never
//! on an OS thread, and the producing side never blocks: resolving an
//! abandoned Bridge simply discards the result.

use offramp_common::{OfframpError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Resolution = Result<Value>;

/// Producing half of a Bridge
///
/// Clonable so the dispatcher can keep a copy in its pending registry
/// while the worker carries another; the internal take-once slot keeps
/// resolution exactly-once regardless of how many clones exist.
#[derive(Clone)]
pub struct BridgeResolver {
    slot: Arc<Mutex<Option<oneshot::Sender<Resolution>>>>,
}

/// Consuming half of a Bridge
pub struct BridgeWaiter {
    rx: oneshot::Receiver<Resolution>,
}

/// Single-resolution synchronization primitive tying one request to its
/// suspended consumer
pub struct Bridge;

impl Bridge {
    /// Create a fresh Bridge for one request
    pub fn create() -> (BridgeResolver, BridgeWaiter) {
        let (tx, rx) = oneshot::channel();
        let resolver = BridgeResolver {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (resolver, BridgeWaiter { rx })
    }
}

impl BridgeResolver {
    /// Deliver a value; a no-op if the Bridge is already settled
    pub fn resolve(&self, value: Value) {
        self.settle(Ok(value));
    }

    /// Deliver an error; a no-op if the Bridge is already settled
    pub fn reject(&self, err: OfframpError) {
        self.settle(Err(err));
    }

    /// Whether the Bridge has already been settled
    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }

    fn settle(&self, resolution: Resolution) {
        let tx = self.slot.lock().take();
        match tx {
            Some(tx) => {
                if tx.send(resolution).is_err() {
                    // Consumer abandoned the call; the result is discarded.
                    trace!("bridge consumer gone, result discarded");
                }
            }
            None => {
                debug!("bridge already settled, ignoring late resolution");
            }
        }
    }
}

impl BridgeWaiter {
    /// Suspend until the producing side settles the Bridge
    ///
    /// Surfaces a worker fault if every resolver was dropped unresolved.
    pub async fn await_result(self) -> Result<Value> {
        match self.rx.await {
            Ok(resolution) => resolution,
            Err(_) => Err(OfframpError::worker_fault(
                "bridge dropped before resolution",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_delivers_value() {
        let (resolver, waiter) = Bridge::create();

        resolver.resolve(json!({"message": "Hello, X!"}));

        let value = waiter.await_result().await.unwrap();
        assert_eq!(value, json!({"message": "Hello, X!"}));
    }

    #[tokio::test]
    async fn test_reject_delivers_error() {
        let (resolver, waiter) = Bridge::create();

        resolver.reject(OfframpError::callable("boom"));

        let err = waiter.await_result().await.unwrap_err();
        assert!(matches!(err, OfframpError::Callable(_)));
    }

    #[tokio::test]
    async fn test_second_resolution_is_ignored() {
        let (resolver, waiter) = Bridge::create();

        resolver.resolve(json!(1));
        resolver.resolve(json!(2));
        resolver.reject(OfframpError::callable("late"));

        assert!(resolver.is_settled());
        assert_eq!(waiter.await_result().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_late_resolution_after_abandonment() {
        let (resolver, waiter) = Bridge::create();
        drop(waiter);

        // Must neither block nor panic; the result is simply discarded.
        resolver.resolve(json!("discarded"));
        assert!(resolver.is_settled());
    }

    #[tokio::test]
    async fn test_dropped_resolver_surfaces_fault() {
        let (resolver, waiter) = Bridge::create();
        drop(resolver);

        let err = waiter.await_result().await.unwrap_err();
        assert!(matches!(err, OfframpError::WorkerFault(_)));
    }

    #[tokio::test]
    async fn test_clones_share_the_resolution_slot() {
        let (resolver, waiter) = Bridge::create();
        let clone = resolver.clone();

        clone.resolve(json!("first"));
        resolver.resolve(json!("second"));

        assert_eq!(waiter.await_result().await.unwrap(), json!("first"));
    }
}
