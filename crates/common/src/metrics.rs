//! Metrics collection for Offramp
//!
//! This module provides Prometheus metrics for observability.
//! All metrics are carefully designed to minimize overhead in the hot path.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Offramp
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub dispatch: DispatchMetrics,
    pub worker: WorkerMetrics,
    pub stream: StreamMetrics,
}

/// Dispatch-related metrics
#[derive(Debug, Clone)]
pub struct DispatchMetrics {
    /// Total number of submissions
    pub submissions_total: IntCounter,

    /// Total number of completed requests
    pub requests_completed: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Submissions rejected because every queue was at capacity
    pub overload_rejections: IntCounter,

    /// Request duration histogram (submission to resolution)
    pub request_duration: Histogram,

    /// Current in-flight requests
    pub active_requests: IntGauge,
}

/// Worker-specific metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Callable execution duration
    pub execute_duration: Histogram,

    /// Time requests spend in a worker queue before processing
    pub queue_time: Histogram,

    /// Aggregate queue depth across workers
    pub queue_depth: IntGauge,

    /// Live workers
    pub live_workers: IntGauge,

    /// Errors raised by callables
    pub callable_errors: IntCounter,

    /// Fatal worker faults
    pub worker_faults: IntCounter,
}

/// Streaming-specific metrics
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    /// Streams opened
    pub streams_opened: IntCounter,

    /// Streams cancelled by the consumer before completion
    pub streams_cancelled: IntCounter,

    /// Chunks pushed by workers
    pub chunks_pushed: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Dispatch metrics
        let submissions_total = IntCounter::new(
            "dispatch_submissions_total",
            "Total number of submissions",
        )
        .unwrap();

        let requests_completed = IntCounter::new(
            "dispatch_requests_completed_total",
            "Total number of completed requests",
        )
        .unwrap();

        let requests_failed = IntCounter::new(
            "dispatch_requests_failed_total",
            "Total number of failed requests",
        )
        .unwrap();

        let overload_rejections = IntCounter::new(
            "dispatch_overload_rejections_total",
            "Submissions rejected with every worker queue at capacity",
        )
        .unwrap();

        let request_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "dispatch_request_duration_seconds",
                "Request duration from submission to resolution",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )
        .unwrap();

        let active_requests = IntGauge::new(
            "dispatch_active_requests",
            "Current number of in-flight requests",
        )
        .unwrap();

        // Worker metrics
        let execute_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "worker_execute_duration_seconds",
                "Callable execution duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )
        .unwrap();

        let queue_time = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "worker_queue_time_seconds",
                "Time requests spend in queue before processing",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.1, 0.5]),
        )
        .unwrap();

        let queue_depth = IntGauge::new(
            "worker_queue_depth",
            "Aggregate depth of worker request queues",
        )
        .unwrap();

        let live_workers = IntGauge::new("worker_live_total", "Current number of live workers")
            .unwrap();

        let callable_errors = IntCounter::new(
            "worker_callable_errors_total",
            "Total number of errors raised by callables",
        )
        .unwrap();

        let worker_faults = IntCounter::new(
            "worker_faults_total",
            "Total number of fatal worker faults",
        )
        .unwrap();

        // Stream metrics
        let streams_opened =
            IntCounter::new("stream_opened_total", "Total number of streams opened").unwrap();

        let streams_cancelled = IntCounter::new(
            "stream_cancelled_total",
            "Streams cancelled by the consumer before completion",
        )
        .unwrap();

        let chunks_pushed =
            IntCounter::new("stream_chunks_pushed_total", "Chunks pushed by workers").unwrap();

        // Register all metrics
        registry.register(Box::new(submissions_total.clone())).unwrap();
        registry.register(Box::new(requests_completed.clone())).unwrap();
        registry.register(Box::new(requests_failed.clone())).unwrap();
        registry.register(Box::new(overload_rejections.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();
        registry.register(Box::new(active_requests.clone())).unwrap();

        registry.register(Box::new(execute_duration.clone())).unwrap();
        registry.register(Box::new(queue_time.clone())).unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry.register(Box::new(live_workers.clone())).unwrap();
        registry.register(Box::new(callable_errors.clone())).unwrap();
        registry.register(Box::new(worker_faults.clone())).unwrap();

        registry.register(Box::new(streams_opened.clone())).unwrap();
        registry.register(Box::new(streams_cancelled.clone())).unwrap();
        registry.register(Box::new(chunks_pushed.clone())).unwrap();

        let dispatch = DispatchMetrics {
            submissions_total,
            requests_completed,
            requests_failed,
            overload_rejections,
            request_duration,
            active_requests,
        };

        let worker = WorkerMetrics {
            execute_duration,
            queue_time,
            queue_depth,
            live_workers,
            callable_errors,
            worker_faults,
        };

        let stream = StreamMetrics {
            streams_opened,
            streams_cancelled,
            chunks_pushed,
        };

        MetricsRegistry {
            registry,
            dispatch,
            worker,
            stream,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        // Record some metrics
        metrics.dispatch.submissions_total.inc();
        metrics.dispatch.active_requests.inc();
        metrics.worker.queue_depth.set(10);
        metrics.stream.chunks_pushed.inc_by(3);

        // Gather metrics
        let output = metrics.gather();
        assert!(output.contains("dispatch_submissions_total"));
        assert!(output.contains("worker_queue_depth"));
        assert!(output.contains("stream_chunks_pushed_total"));
    }
}
