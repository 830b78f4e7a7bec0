//! Metrics collection for RecServe
//!
//! This module provides Prometheus metrics for observability.
//! Per-request updates are plain counter/histogram operations and stay cheap
//! on the execution path.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics registry for RecServe
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub requests: RequestMetrics,
    pub instance: InstanceMetrics,
}

/// Request-related metrics
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Total number of requests received
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Failed requests, labelled by error kind
    pub requests_failed: IntCounterVec,

    /// Samples per request
    pub samples_per_request: Histogram,
}

/// Instance-level metrics
#[derive(Debug, Clone)]
pub struct InstanceMetrics {
    /// Total number of execute calls
    pub executions_total: IntCounter,

    /// Execute call duration
    pub execution_duration: Histogram,

    /// Scoring call duration
    pub predict_duration: Histogram,

    /// Bytes currently held by device buffers
    pub device_bytes_allocated: IntGauge,

    /// Currently loaded instances
    pub instances_loaded: IntGauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounter::new(
            "recserve_requests_total",
            "Total number of scoring requests"
        ).unwrap();

        let requests_success = IntCounter::new(
            "recserve_requests_success_total",
            "Total number of successful scoring requests"
        ).unwrap();

        let requests_failed = IntCounterVec::new(
            Opts::new(
                "recserve_requests_failed_total",
                "Total number of failed scoring requests by error kind"
            ),
            &["kind"]
        ).unwrap();

        let samples_per_request = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "recserve_samples_per_request",
                "Samples carried by each request"
            ).buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0])
        ).unwrap();

        let executions_total = IntCounter::new(
            "recserve_executions_total",
            "Total number of execute calls"
        ).unwrap();

        let execution_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "recserve_execution_duration_seconds",
                "Duration of an execute call over a request batch"
            ).buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0])
        ).unwrap();

        let predict_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "recserve_predict_duration_seconds",
                "Duration of a single scoring call"
            ).buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1])
        ).unwrap();

        let device_bytes_allocated = IntGauge::new(
            "recserve_device_bytes_allocated",
            "Bytes currently held by staging buffers"
        ).unwrap();

        let instances_loaded = IntGauge::new(
            "recserve_instances_loaded",
            "Currently loaded model instances"
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(requests_success.clone())).unwrap();
        registry.register(Box::new(requests_failed.clone())).unwrap();
        registry.register(Box::new(samples_per_request.clone())).unwrap();

        registry.register(Box::new(executions_total.clone())).unwrap();
        registry.register(Box::new(execution_duration.clone())).unwrap();
        registry.register(Box::new(predict_duration.clone())).unwrap();
        registry.register(Box::new(device_bytes_allocated.clone())).unwrap();
        registry.register(Box::new(instances_loaded.clone())).unwrap();

        let requests = RequestMetrics {
            requests_total,
            requests_success,
            requests_failed,
            samples_per_request,
        };

        let instance = InstanceMetrics {
            executions_total,
            execution_duration,
            predict_duration,
            device_bytes_allocated,
            instances_loaded,
        };

        MetricsRegistry {
            registry,
            requests,
            instance,
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

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
