//! HTTP request handlers for the gateway API.
//!
//! This module contains all endpoint handlers including chat completions,
//! health checks, model listings, and metrics.

use crate::api::auth::extract_bearer;
use crate::api::models::*;
use crate::core::logging::{get_request_id, get_service_context};
use crate::core::metrics::get_metrics;
use crate::core::middleware::{ModelName, ServiceName};
use crate::core::{AdmissionGuard, AppError, Result};
use crate::services::{ModelRouter, ResolvedRoute, RouteRequest, RANDOM_MODEL};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ModelRouter>,
    /// Client for backends reached without a proxy
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self::with_client(router, reqwest::Client::new())
    }

    pub fn with_client(router: Arc<ModelRouter>, client: reqwest::Client) -> Self {
        Self { router, client }
    }
}

/// Handle chat completion requests.
///
/// The request is routed and admitted, its model rewritten to the backend's
/// name, and the upstream response relayed byte for byte. Streaming and
/// non-streaming responses take the same path.
#[tracing::instrument(skip(state, headers, body), fields(request_id = %get_request_id()))]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let mut payload: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid chat completion request: {}", e)))?;

    let resolved = state
        .router
        .resolve(&RouteRequest {
            model: &payload.model,
            api_key: extract_bearer(&headers),
            multi_content: payload.has_multi_content(),
            stream: payload.is_stream(),
        })
        .await?;
    let (route, guard) = resolved.into_parts();

    payload.model = route.final_model.clone();
    let service_name = route.backend.service_name.clone();

    crate::with_request_context!(
        get_request_id(),
        service_name,
        forward_chat(state, route, payload, guard)
    )
}

async fn forward_chat(
    state: Arc<AppState>,
    route: ResolvedRoute,
    payload: ChatCompletionRequest,
    guard: AdmissionGuard,
) -> Result<Response> {
    let backend = &route.backend;
    let url = format!("{}/chat/completions", backend.server_url.trim_end_matches('/'));
    let client = route
        .transport
        .as_ref()
        .map(|t| t.client.clone())
        .unwrap_or_else(|| state.client.clone());

    tracing::debug!(
        service = %backend.service_name,
        model = %route.client_model,
        upstream_model = %route.final_model,
        stream = route.stream,
        proxied = route.transport.is_some(),
        "Forwarding chat completion request"
    );

    let mut upstream = client.post(&url).timeout(backend.timeout).json(&payload);
    if let Some(api_key) = route.credentials.api_key() {
        upstream = upstream.bearer_auth(api_key);
    }

    let start = Instant::now();
    let response = upstream.send().await.map_err(|e| {
        tracing::error!(
            request_id = %get_request_id(),
            service = %get_service_context(),
            url = %url,
            model = %route.final_model,
            error = %e,
            error_source = ?e.source(),
            is_timeout = e.is_timeout(),
            is_connect = e.is_connect(),
            "HTTP request failed to backend"
        );
        AppError::from(e)
    })?;

    get_metrics()
        .upstream_latency
        .with_label_values(&[&backend.service_name])
        .observe(start.elapsed().as_secs_f64());

    let status = response.status();
    if !status.is_success() {
        tracing::warn!(
            service = %backend.service_name,
            status = %status,
            "Backend returned error status"
        );
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .cloned();

    // The guard rides along with the body so a concurrency slot stays taken
    // until the relay finishes or the client goes away.
    let stream = response.bytes_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    });

    let mut relayed = Response::new(Body::from_stream(stream));
    *relayed.status_mut() =
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    if let Some(value) = content_type {
        if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
            relayed.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }
    relayed
        .extensions_mut()
        .insert(ModelName(route.client_model.clone()));
    relayed
        .extensions_mut()
        .insert(ServiceName(backend.service_name.clone()));

    Ok(relayed)
}

/// Embeddings are indexed for routing but not served.
#[tracing::instrument]
pub async fn embeddings() -> Result<Response> {
    Err(AppError::NotImplemented(
        "embeddings endpoint is not supported".to_string(),
    ))
}

/// List available models, with `random` appended.
#[tracing::instrument(skip(state))]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let models = state.router.listed_models();
    if models.is_empty() {
        tracing::warn!("No models configured");
        let body = json!({
            "error": {
                "message": "No models found",
                "type": "invalid_request_error",
                "code": StatusCode::NOT_FOUND.as_u16()
            }
        });
        return (StatusCode::NOT_FOUND, Json(body)).into_response();
    }

    tracing::debug!(count = models.len(), "Listing available models");
    let names = models
        .into_iter()
        .chain(std::iter::once(RANDOM_MODEL.to_string()));
    Json(ModelList::from_names(names, chrono::Utc::now().timestamp())).into_response()
}

/// Basic health check endpoint.
#[tracing::instrument(skip(state))]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let models = state.router.table().index.len();
    Json(HealthResponse {
        status: "ok".to_string(),
        models,
    })
}

/// Prometheus metrics endpoint.
#[tracing::instrument]
pub async fn metrics_handler() -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response())
}
