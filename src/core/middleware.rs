//! HTTP middleware for request tracking and metrics.
//!
//! Handlers attach the resolved model and service to the response as
//! extensions; [`MetricsMiddleware::track_metrics`] reads them back to label
//! the request metrics.

use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Header carrying the request ID, accepted from clients and echoed back.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Extension type for storing model name in response
#[derive(Clone, Debug)]
pub struct ModelName(pub String);

/// Extension type for storing the selected service name in response
#[derive(Clone, Debug)]
pub struct ServiceName(pub String);

/// Assign a request ID (reusing a client-supplied `x-request-id` when present),
/// scope it for logging and echo it on the response.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Middleware for tracking request metrics.
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Track metrics for incoming requests.
    ///
    /// Active requests are counted for every endpoint; request count and
    /// duration are recorded only for requests a handler routed to a service.
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let endpoint = request.uri().path().to_string();
        let method = request.method().to_string();

        // Skip metrics endpoint itself to avoid recursion
        if endpoint == "/metrics" {
            return next.run(request).await;
        }

        let metrics = get_metrics();
        metrics
            .active_requests
            .with_label_values(&[&endpoint])
            .inc();

        let start = Instant::now();
        let response = next.run(request).await;
        let duration = start.elapsed().as_secs_f64();
        let status_code = response.status().as_u16().to_string();

        let model = response
            .extensions()
            .get::<ModelName>()
            .map(|m| m.0.as_str())
            .unwrap_or("unknown");
        let service = response
            .extensions()
            .get::<ServiceName>()
            .map(|s| s.0.as_str())
            .unwrap_or("unknown");

        if service != "unknown" {
            metrics
                .request_count
                .with_label_values(&[&method, &endpoint, model, service, &status_code])
                .inc();
            metrics
                .request_duration
                .with_label_values(&[&method, &endpoint, model, service])
                .observe(duration);

            // For relayed bodies this is time to headers, not to the last byte
            tracing::info!(
                "{} {} - status={} model={} service={} ttfb={:.3}s",
                method,
                endpoint,
                status_code,
                model,
                service,
                duration
            );
        } else {
            tracing::info!(
                "{} {} - status={} duration={:.3}s",
                method,
                endpoint,
                status_code,
                duration
            );
        }

        metrics
            .active_requests
            .with_label_values(&[&endpoint])
            .dec();

        response
    }
}
