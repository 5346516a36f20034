//! Worker pool lifecycle
//!
//! The supervisor owns the worker handles: it spawns one dedicated thread
//! per callable instance (the instance count IS the degree of
//! parallelism), exposes pool health, and drives graceful-then-forced
//! shutdown. Forced shutdown never kills a thread mid-call; it abandons
//! the thread, fails its pending work, and relies on late-resolution
//! tolerance to discard whatever the call eventually produces.

use crate::callable::Callable;
use crate::dispatch::Dispatcher;
use crate::worker::{spawn_worker, PendingMap, Responder, WorkerHandle};
use offramp_common::config::DispatchConfig;
use offramp_common::{metrics::METRICS, OfframpError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, trace, warn};

/// Owns the worker pool from startup to shutdown
pub struct Supervisor {
    workers: Arc<Vec<WorkerHandle>>,
    dispatcher: Arc<Dispatcher>,
    pending: PendingMap,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Spawn one worker thread per callable instance
    pub fn start(
        callables: Vec<Box<dyn Callable>>,
        config: &DispatchConfig,
    ) -> Result<Self> {
        if callables.is_empty() {
            return Err(OfframpError::config(
                "at least one callable instance is required",
            ));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(callables.len());
        for (id, callable) in callables.into_iter().enumerate() {
            workers.push(spawn_worker(
                id,
                callable,
                config.queue_depth,
                pending.clone(),
                shutdown.clone(),
            )?);
        }
        info!(workers = workers.len(), "worker pool started");

        let workers = Arc::new(workers);
        let dispatcher = Arc::new(Dispatcher::new(workers.clone(), pending.clone(), config));

        Ok(Self {
            workers,
            dispatcher,
            pending,
            shutdown,
        })
    }

    /// The submission surface backed by this pool
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Number of workers whose loop is still running
    pub fn live_worker_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    /// Stop intake, let each worker finish its current request, then fail
    /// everything still pending once the deadline elapses
    pub async fn shutdown(&self, deadline: Duration) {
        info!(?deadline, "shutdown requested");

        self.dispatcher.stop_accepting();
        self.shutdown.store(true, Ordering::Release);

        // Dropping the queue senders wakes idle workers; busy workers
        // observe the flag once their current request finishes and drain
        // no further.
        for worker in self.workers.iter() {
            worker.close_queue();
        }

        let started = Instant::now();
        while started.elapsed() < deadline
            && self.workers.iter().any(|w| !w.is_finished())
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for worker in self.workers.iter() {
            worker.reap();
        }

        // Queued-but-unstarted requests and the in-flight requests of
        // workers that missed the deadline are failed here; a worker that
        // later finishes resolves into a settled handle, which discards.
        let remaining: Vec<(_, Responder)> = self.pending.lock().drain().collect();
        if !remaining.is_empty() {
            warn!(
                pending = remaining.len(),
                "failing requests still pending at shutdown deadline"
            );
            for (request_id, responder) in remaining {
                trace!(request = %request_id, "rejecting pending request at shutdown");
                responder.reject(OfframpError::shutdown("shutdown deadline elapsed"));
                METRICS.dispatch.requests_failed.inc();
                METRICS.dispatch.active_requests.dec();
            }
        }

        let stragglers = self.workers.iter().filter(|w| !w.is_finished()).count();
        if stragglers > 0 {
            warn!(
                stragglers,
                "abandoning workers still executing, late results will be discarded"
            );
        }
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::{CallOutcome, ChunkPayload};
    use offramp_common::config::DispatchConfig;
    use serde_json::{json, Map, Value};
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;

    fn test_config(queue_depth: usize) -> DispatchConfig {
        DispatchConfig {
            queue_depth,
            ..DispatchConfig::default()
        }
    }

    #[test]
    fn test_start_requires_a_callable() {
        let err = Supervisor::start(Vec::new(), &test_config(8)).unwrap_err();
        assert!(matches!(err, OfframpError::Config(_)));
    }

    #[tokio::test]
    async fn test_one_callable_never_runs_two_requests_at_once() {
        /// Records (start, end) of every invocation
        struct IntervalRecorder {
            intervals: Arc<StdMutex<Vec<(Instant, Instant)>>>,
        }

        impl Callable for IntervalRecorder {
            fn invoke(
                &mut self,
                _args: &[Value],
                _kwargs: &Map<String, Value>,
            ) -> offramp_common::Result<CallOutcome> {
                let start = Instant::now();
                std::thread::sleep(Duration::from_millis(20));
                self.intervals.lock().unwrap().push((start, Instant::now()));
                Ok(CallOutcome::Value(json!(null)))
            }
        }

        let intervals = Arc::new(StdMutex::new(Vec::new()));
        let supervisor = Supervisor::start(
            vec![Box::new(IntervalRecorder {
                intervals: intervals.clone(),
            })],
            &test_config(8),
        )
        .unwrap();
        let dispatcher = supervisor.dispatcher();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                dispatcher
                    .submit(Vec::new(), Map::new(), false)
                    .unwrap()
                    .into_single()
                    .unwrap()
            })
            .collect();
        for waiter in waiters {
            waiter.await_result().await.unwrap();
        }

        let intervals = intervals.lock().unwrap();
        assert_eq!(intervals.len(), 4);
        for pair in intervals.windows(2) {
            // Strictly one at a time: each invocation ends before the
            // next begins.
            assert!(pair[0].1 <= pair[1].0);
        }

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_two_chunk_stream_with_observable_delay() {
        struct TwoParts;

        impl Callable for TwoParts {
            fn invoke(
                &mut self,
                _args: &[Value],
                _kwargs: &Map<String, Value>,
            ) -> offramp_common::Result<CallOutcome> {
                let mut step = 0u32;
                Ok(CallOutcome::Stream(Box::new(std::iter::from_fn(
                    move || {
                        step += 1;
                        match step {
                            1 => Some(Ok(ChunkPayload::Text("Part 1".into()))),
                            2 => {
                                std::thread::sleep(Duration::from_millis(80));
                                Some(Ok(ChunkPayload::Text("Part 2".into())))
                            }
                            _ => None,
                        }
                    },
                ))))
            }
        }

        let supervisor = Supervisor::start(vec![Box::new(TwoParts)], &test_config(8)).unwrap();
        let mut stream = supervisor
            .dispatcher()
            .submit(Vec::new(), Map::new(), true)
            .unwrap()
            .into_stream()
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload, ChunkPayload::Text("Part 1".into()));
        let received_first = Instant::now();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.payload, ChunkPayload::Text("Part 2".into()));
        assert!(received_first.elapsed() >= Duration::from_millis(60));
        assert_eq!((first.seq, second.seq), (0, 1));

        let marker = stream.next().await.unwrap().unwrap();
        assert!(marker.last);
        assert!(stream.next().await.is_none());

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_callable_error_leaves_worker_alive() {
        struct FailsOnce {
            failed: bool,
        }

        impl Callable for FailsOnce {
            fn invoke(
                &mut self,
                _args: &[Value],
                _kwargs: &Map<String, Value>,
            ) -> offramp_common::Result<CallOutcome> {
                if !self.failed {
                    self.failed = true;
                    return Err(OfframpError::callable("model exploded"));
                }
                Ok(CallOutcome::Value(json!("recovered")))
            }
        }

        let supervisor =
            Supervisor::start(vec![Box::new(FailsOnce { failed: false })], &test_config(8))
                .unwrap();
        let dispatcher = supervisor.dispatcher();

        let err = dispatcher
            .submit(Vec::new(), Map::new(), false)
            .unwrap()
            .into_single()
            .unwrap()
            .await_result()
            .await
            .unwrap_err();
        assert!(matches!(err, OfframpError::Callable(_)));

        // The worker survived and serves the next request.
        assert_eq!(supervisor.live_worker_count(), 1);
        let value = dispatcher
            .submit(Vec::new(), Map::new(), false)
            .unwrap()
            .into_single()
            .unwrap()
            .await_result()
            .await
            .unwrap();
        assert_eq!(value, json!("recovered"));

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_panicking_callable_is_contained() {
        struct PanicsOnce {
            panicked: bool,
        }

        impl Callable for PanicsOnce {
            fn invoke(
                &mut self,
                _args: &[Value],
                _kwargs: &Map<String, Value>,
            ) -> offramp_common::Result<CallOutcome> {
                if !self.panicked {
                    self.panicked = true;
                    panic!("segfault in disguise");
                }
                Ok(CallOutcome::Value(json!("still here")))
            }
        }

        let supervisor = Supervisor::start(
            vec![Box::new(PanicsOnce { panicked: false })],
            &test_config(8),
        )
        .unwrap();
        let dispatcher = supervisor.dispatcher();

        let err = dispatcher
            .submit(Vec::new(), Map::new(), false)
            .unwrap()
            .into_single()
            .unwrap()
            .await_result()
            .await
            .unwrap_err();
        assert!(matches!(err, OfframpError::Callable(_)));
        assert!(err.to_string().contains("segfault in disguise"));

        assert_eq!(supervisor.live_worker_count(), 1);
        let value = dispatcher
            .submit(Vec::new(), Map::new(), false)
            .unwrap()
            .into_single()
            .unwrap()
            .await_result()
            .await
            .unwrap();
        assert_eq!(value, json!("still here"));

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cancellation_discards_the_late_result() {
        struct Slow;

        impl Callable for Slow {
            fn invoke(
                &mut self,
                _args: &[Value],
                _kwargs: &Map<String, Value>,
            ) -> offramp_common::Result<CallOutcome> {
                std::thread::sleep(Duration::from_millis(30));
                Ok(CallOutcome::Value(json!("too late")))
            }
        }

        let supervisor = Supervisor::start(vec![Box::new(Slow)], &test_config(8)).unwrap();
        let dispatcher = supervisor.dispatcher();

        let waiter = dispatcher
            .submit(Vec::new(), Map::new(), false)
            .unwrap()
            .into_single()
            .unwrap();
        // Cancel immediately; control returns without waiting.
        drop(waiter);

        // The abandoned computation completes without error and the
        // worker goes on to serve an observed request.
        let value = dispatcher
            .submit(Vec::new(), Map::new(), false)
            .unwrap()
            .into_single()
            .unwrap()
            .await_result()
            .await
            .unwrap();
        assert_eq!(value, json!("too late"));
        assert_eq!(supervisor.live_worker_count(), 1);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_work_and_rejects_new_submissions() {
        struct Gated {
            release: StdMutex<mpsc::Receiver<()>>,
        }

        impl Callable for Gated {
            fn invoke(
                &mut self,
                _args: &[Value],
                _kwargs: &Map<String, Value>,
            ) -> offramp_common::Result<CallOutcome> {
                self.release.lock().unwrap().recv().ok();
                Ok(CallOutcome::Value(json!("finished late")))
            }
        }

        let (gate, release) = mpsc::channel();
        let supervisor = Supervisor::start(
            vec![Box::new(Gated {
                release: StdMutex::new(release),
            })],
            &test_config(8),
        )
        .unwrap();
        let dispatcher = supervisor.dispatcher();

        // One request stuck in the callable, one queued behind it.
        let in_flight = dispatcher
            .submit(Vec::new(), Map::new(), false)
            .unwrap()
            .into_single()
            .unwrap();
        let queued = dispatcher
            .submit(Vec::new(), Map::new(), false)
            .unwrap()
            .into_single()
            .unwrap();

        supervisor.shutdown(Duration::from_millis(50)).await;

        let err = queued.await_result().await.unwrap_err();
        assert!(matches!(err, OfframpError::Shutdown(_)));
        let err = in_flight.await_result().await.unwrap_err();
        assert!(matches!(err, OfframpError::Shutdown(_)));

        // Submissions after shutdown are rejected synchronously.
        let err = dispatcher
            .submit(Vec::new(), Map::new(), false)
            .unwrap_err();
        assert!(matches!(err, OfframpError::Shutdown(_)));

        // Release the abandoned worker; its late resolution is discarded.
        gate.send(()).ok();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}
