//! Worker threads
//!
//! Each worker is a dedicated OS thread exclusively owning one callable
//! instance. It pulls requests from its private bounded queue and executes
//! them strictly one at a time; the instance is never touched by any other
//! thread, which is the entire thread-safety story for libraries that are
//! not internally thread-safe.
//!
//! Callable failures (error returns and panics alike) are delivered to the
//! caller through the request's Bridge or StreamChannel and never crash
//! the loop. A panic escaping the worker's own dispatch logic is a fatal
//! fault: the worker is marked dead, its in-flight and queued requests are
//! failed, and the dispatcher stops routing to it.

use crate::bridge::BridgeResolver;
use crate::callable::{Callable, CallOutcome, ChunkIter, ChunkPayload};
use crate::request::{InferRequest, RequestId};
use crate::stream::StreamProducer;
use offramp_common::{metrics::METRICS, OfframpError};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Producing half of a request's result path
#[derive(Clone)]
pub enum Responder {
    /// Single-value delivery
    Single(BridgeResolver),

    /// Chunk-sequence delivery
    Stream(StreamProducer),
}

impl Responder {
    /// Fail the call without blocking; safe from the async side
    pub fn reject(&self, err: OfframpError) {
        match self {
            Responder::Single(resolver) => resolver.reject(err),
            Responder::Stream(producer) => producer.abort(err),
        }
    }
}

/// Registry of in-flight requests, shared by dispatcher, workers, and
/// supervisor; exactly one entry per request from submission to resolution
pub type PendingMap = Arc<Mutex<HashMap<RequestId, Responder>>>;

/// A request paired with its result path, queued to one worker
pub struct WorkerJob {
    pub request: InferRequest,
    pub responder: Responder,
}

/// Handle to one worker thread
pub struct WorkerHandle {
    id: usize,
    tx: Mutex<Option<Sender<WorkerJob>>>,
    alive: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Worker identifier
    pub fn id(&self) -> usize {
        self.id
    }

    /// Current depth of the private request queue
    pub fn queue_depth(&self) -> usize {
        self.tx.lock().as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    /// Whether the worker loop is still running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Whether the worker is currently executing a request
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Bounded enqueue; returns the job when the queue is full, closed, or
    /// the worker is gone
    pub(crate) fn try_enqueue(&self, job: WorkerJob) -> std::result::Result<(), WorkerJob> {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.try_send(job).map_err(|err| match err {
                TrySendError::Full(job) => job,
                TrySendError::Disconnected(job) => job,
            }),
            None => Err(job),
        }
    }

    /// Drop the queue sender so an idle worker wakes up and exits
    pub(crate) fn close_queue(&self) {
        self.tx.lock().take();
    }

    /// Whether the worker thread has terminated
    pub(crate) fn is_finished(&self) -> bool {
        self.join
            .lock()
            .as_ref()
            .map(|join| join.is_finished())
            .unwrap_or(true)
    }

    /// Join the thread if it has terminated
    pub(crate) fn reap(&self) {
        let mut guard = self.join.lock();
        if guard.as_ref().map(|join| join.is_finished()).unwrap_or(false) {
            if let Some(join) = guard.take() {
                let _ = join.join();
            }
        }
    }
}

/// Spawn a worker thread bound to one callable instance
pub(crate) fn spawn_worker(
    id: usize,
    callable: Box<dyn Callable>,
    queue_depth: usize,
    pending: PendingMap,
    shutdown: Arc<AtomicBool>,
) -> offramp_common::Result<WorkerHandle> {
    let (tx, rx) = channel::bounded(queue_depth);
    let alive = Arc::new(AtomicBool::new(true));
    let busy = Arc::new(AtomicBool::new(false));

    let thread_alive = alive.clone();
    let thread_busy = busy.clone();
    let join = thread::Builder::new()
        .name(format!("offramp-worker-{}", id))
        .spawn(move || worker_loop(id, callable, rx, pending, shutdown, thread_alive, thread_busy))
        .map_err(|e| OfframpError::internal(format!("failed to spawn worker {}: {}", id, e)))?;

    Ok(WorkerHandle {
        id,
        tx: Mutex::new(Some(tx)),
        alive,
        busy,
        join: Mutex::new(Some(join)),
    })
}

/// Cleans up on loop exit; on a panic this doubles as the fault handler
struct FaultGuard {
    id: usize,
    alive: Arc<AtomicBool>,
    pending: PendingMap,
    queue: Receiver<WorkerJob>,
    current: Option<RequestId>,
}

impl Drop for FaultGuard {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        METRICS.worker.live_workers.dec();

        if !thread::panicking() {
            return;
        }

        METRICS.worker.worker_faults.inc();
        error!(worker = self.id, "worker fault, marking worker dead");

        // Fail the in-flight request and whatever was already queued;
        // nobody will ever drain this queue again.
        if let Some(id) = self.current.take() {
            if let Some(responder) = self.pending.lock().remove(&id) {
                responder.reject(OfframpError::worker_fault(format!(
                    "worker {} died executing request {}",
                    self.id, id
                )));
                METRICS.dispatch.requests_failed.inc();
                METRICS.dispatch.active_requests.dec();
            }
        }
        while let Ok(job) = self.queue.try_recv() {
            let id = job.request.id;
            self.pending.lock().remove(&id);
            job.responder.reject(OfframpError::worker_fault(format!(
                "worker {} died before executing request {}",
                self.id, id
            )));
            METRICS.dispatch.requests_failed.inc();
            METRICS.dispatch.active_requests.dec();
        }
    }
}

fn worker_loop(
    id: usize,
    mut callable: Box<dyn Callable>,
    rx: Receiver<WorkerJob>,
    pending: PendingMap,
    shutdown: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
) {
    METRICS.worker.live_workers.inc();
    let mut guard = FaultGuard {
        id,
        alive,
        pending: pending.clone(),
        queue: rx.clone(),
        current: None,
    };
    debug!(worker = id, "worker loop started");

    while let Ok(job) = rx.recv() {
        if shutdown.load(Ordering::Acquire) {
            // Draining no further: the shutdown sweep fails this job.
            break;
        }

        let request_id = job.request.id;
        METRICS
            .worker
            .queue_time
            .observe(job.request.submitted_at.elapsed().as_secs_f64());

        guard.current = Some(request_id);
        busy.store(true, Ordering::Release);
        execute(callable.as_mut(), job);
        busy.store(false, Ordering::Release);
        guard.current = None;

        pending.lock().remove(&request_id);

        if shutdown.load(Ordering::Acquire) {
            // Current request finished; do not drain further.
            break;
        }
    }

    debug!(worker = id, "worker loop exited");
}

/// Execute one request against the exclusively-owned callable
fn execute(callable: &mut dyn Callable, job: WorkerJob) {
    let WorkerJob { request, responder } = job;
    let started = Instant::now();

    let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
        callable.invoke(&request.args, &request.kwargs)
    }));
    METRICS
        .worker
        .execute_duration
        .observe(started.elapsed().as_secs_f64());

    let failed = match invoked {
        Err(payload) => {
            METRICS.worker.callable_errors.inc();
            responder.reject(OfframpError::callable(panic_message(payload)));
            true
        }
        Ok(Err(err)) => {
            METRICS.worker.callable_errors.inc();
            warn!(request = %request.id, "callable failed: {}", err);
            responder.reject(err);
            true
        }
        Ok(Ok(CallOutcome::Value(value))) => match responder {
            Responder::Single(resolver) => {
                resolver.resolve(value);
                false
            }
            Responder::Stream(producer) => {
                // Declared streaming but produced a single value: deliver
                // it as one chunk followed by the terminal marker.
                let payload = match value {
                    Value::String(s) => ChunkPayload::Text(s),
                    other => ChunkPayload::Text(other.to_string()),
                };
                let _ = producer.push(payload);
                producer.close();
                false
            }
        },
        Ok(Ok(CallOutcome::Stream(iter))) => match responder {
            Responder::Stream(producer) => pump_stream(iter, &producer, request.id),
            Responder::Single(resolver) => {
                resolver.reject(OfframpError::invalid_input(
                    "callable produced a stream for a non-streaming request",
                ));
                true
            }
        },
    };

    if failed {
        METRICS.dispatch.requests_failed.inc();
    } else {
        METRICS.dispatch.requests_completed.inc();
    }
    METRICS.dispatch.active_requests.dec();
    METRICS
        .dispatch
        .request_duration
        .observe(request.submitted_at.elapsed().as_secs_f64());
}

/// Drive a chunk iterator into the stream channel
///
/// Returns whether the stream ended in failure.
fn pump_stream(mut iter: ChunkIter, producer: &StreamProducer, request_id: RequestId) -> bool {
    loop {
        let item = panic::catch_unwind(AssertUnwindSafe(|| iter.next()));
        match item {
            Err(payload) => {
                METRICS.worker.callable_errors.inc();
                producer.push_error(OfframpError::callable(panic_message(payload)));
                return true;
            }
            Ok(None) => {
                producer.close();
                return false;
            }
            Ok(Some(Err(err))) => {
                METRICS.worker.callable_errors.inc();
                warn!(request = %request_id, "stream producer failed: {}", err);
                producer.push_error(err);
                return true;
            }
            Ok(Some(Ok(payload))) => {
                if producer.push(payload).is_err() {
                    // Consumer cancelled; abandon the generator. Its
                    // in-progress step already completed, nothing to undo.
                    trace!(request = %request_id, "stream cancelled by consumer, abandoning");
                    return false;
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callable panicked".to_string()
    }
}
