//! Prometheus metrics for monitoring the gateway.
//!
//! This module provides a centralized metrics registry for tracking requests,
//! latency, and admission control outcomes.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by method, endpoint, model, service, and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by endpoint
    pub active_requests: GaugeVec,

    /// Time spent waiting for admission, by limiter kind
    pub admission_wait: HistogramVec,

    /// Admissions refused, by limiter kind and reason (`deadline` or `canceled`)
    pub admission_rejections: IntCounterVec,

    /// Upstream response latency (time to headers) in seconds
    pub upstream_latency: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
///
/// # Examples
///
/// ```no_run
/// use llm_gateway::core::metrics::init_metrics;
///
/// let metrics = init_metrics();
/// metrics.request_count.with_label_values(&["GET", "/health", "unknown", "unknown", "200"]).inc();
/// ```
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "llm_gateway_requests_total",
            "Total number of requests",
            &["method", "endpoint", "model", "service", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "llm_gateway_request_duration_seconds",
            "Request duration in seconds",
            &["method", "endpoint", "model", "service"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "llm_gateway_active_requests",
            "Number of active requests",
            &["endpoint"]
        )
        .expect("Failed to register active_requests metric");

        let admission_wait = register_histogram_vec!(
            "llm_gateway_admission_wait_seconds",
            "Time spent waiting for a rate token or concurrency slot",
            &["kind"],
            vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register admission_wait metric");

        let admission_rejections = register_int_counter_vec!(
            "llm_gateway_admission_rejections_total",
            "Requests refused by admission control",
            &["kind", "reason"]
        )
        .expect("Failed to register admission_rejections metric");

        let upstream_latency = register_histogram_vec!(
            "llm_gateway_upstream_latency_seconds",
            "Upstream response latency in seconds",
            &["service"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register upstream_latency metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            admission_wait,
            admission_rejections,
            upstream_latency,
        }
    })
}

/// Get the global metrics instance, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}
