//! Request routing to worker queues
//!
//! The dispatcher is stateless routing: it stamps the request, picks a
//! live worker under the configured load-balancing policy, registers the
//! pending call, and enqueues with a bounded, non-blocking send. The
//! calling task never suspends beyond that enqueue; when every live queue
//! is at capacity the submission is rejected synchronously so memory
//! stays bounded and backpressure reaches the caller.

use crate::bridge::{Bridge, BridgeWaiter};
use crate::request::InferRequest;
use crate::stream::{StreamChannel, StreamConsumer};
use crate::worker::{PendingMap, Responder, WorkerHandle, WorkerJob};
use offramp_common::config::{DispatchConfig, RoutePolicy};
use offramp_common::{metrics::METRICS, OfframpError, Result};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Awaitable handle returned by `submit`
pub enum InferHandle {
    /// Non-streaming: awaits one value
    Single(BridgeWaiter),

    /// Streaming: an ordered, cancellable chunk sequence
    Stream(StreamConsumer),
}

impl std::fmt::Debug for InferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferHandle::Single(_) => f.write_str("InferHandle::Single"),
            InferHandle::Stream(_) => f.write_str("InferHandle::Stream"),
        }
    }
}

impl InferHandle {
    /// Unwrap the non-streaming waiter
    pub fn into_single(self) -> Option<BridgeWaiter> {
        match self {
            InferHandle::Single(waiter) => Some(waiter),
            InferHandle::Stream(_) => None,
        }
    }

    /// Unwrap the streaming consumer
    pub fn into_stream(self) -> Option<StreamConsumer> {
        match self {
            InferHandle::Stream(consumer) => Some(consumer),
            InferHandle::Single(_) => None,
        }
    }
}

/// Routes submissions to workers and returns awaitable handles
pub struct Dispatcher {
    workers: Arc<Vec<WorkerHandle>>,
    pending: PendingMap,
    policy: RoutePolicy,
    stream_capacity: usize,
    rr_cursor: AtomicUsize,
    accepting: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(
        workers: Arc<Vec<WorkerHandle>>,
        pending: PendingMap,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            workers,
            pending,
            policy: config.policy,
            stream_capacity: config.stream_capacity,
            rr_cursor: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    /// Submit a request and get back an awaitable handle
    ///
    /// Never suspends: the request is either enqueued on a live worker or
    /// rejected immediately (overload, shutdown, no workers).
    pub fn submit(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        stream: bool,
    ) -> Result<InferHandle> {
        METRICS.dispatch.submissions_total.inc();

        if !self.accepting.load(Ordering::Acquire) {
            return Err(OfframpError::shutdown(
                "dispatcher no longer accepting submissions",
            ));
        }

        let request = InferRequest::new(args, kwargs, stream);
        let request_id = request.id;

        let (responder, handle) = if stream {
            let (producer, consumer) = StreamChannel::create(self.stream_capacity);
            METRICS.stream.streams_opened.inc();
            (Responder::Stream(producer), InferHandle::Stream(consumer))
        } else {
            let (resolver, waiter) = Bridge::create();
            (Responder::Single(resolver), InferHandle::Single(waiter))
        };

        // Register before enqueueing so the worker can resolve and
        // deregister the instant it finishes.
        self.pending.lock().insert(request_id, responder.clone());

        match self.enqueue(WorkerJob { request, responder }) {
            Ok(worker_id) => {
                METRICS.dispatch.active_requests.inc();
                debug!(request = %request_id, worker = worker_id, stream, "request enqueued");
                Ok(handle)
            }
            Err(err) => {
                self.pending.lock().remove(&request_id);
                Err(err)
            }
        }
    }

    /// Place the job on a live worker's queue under the routing policy
    fn enqueue(&self, job: WorkerJob) -> Result<usize> {
        let live: Vec<&WorkerHandle> =
            self.workers.iter().filter(|w| w.is_alive()).collect();
        if live.is_empty() {
            return Err(OfframpError::worker_unavailable("no live workers"));
        }

        let order: Vec<usize> = match self.policy {
            RoutePolicy::RoundRobin => {
                let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % live.len();
                (0..live.len()).map(|i| (start + i) % live.len()).collect()
            }
            RoutePolicy::LeastDepth => {
                let mut order: Vec<usize> = (0..live.len()).collect();
                order.sort_by_key(|&i| live[i].queue_depth());
                order
            }
        };

        let mut job = job;
        for idx in order {
            match live[idx].try_enqueue(job) {
                Ok(()) => {
                    METRICS
                        .worker
                        .queue_depth
                        .set(self.total_queue_depth() as i64);
                    return Ok(live[idx].id());
                }
                Err(returned) => job = returned,
            }
        }

        METRICS.dispatch.overload_rejections.inc();
        Err(OfframpError::overloaded(format!(
            "all {} worker queues at capacity",
            live.len()
        )))
    }

    /// Per-worker queue depth snapshot
    pub fn queue_depths(&self) -> Vec<(usize, usize)> {
        self.workers
            .iter()
            .map(|w| (w.id(), w.queue_depth()))
            .collect()
    }

    fn total_queue_depth(&self) -> usize {
        self.workers.iter().map(|w| w.queue_depth()).sum()
    }

    /// Whether submissions are still accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }
}
