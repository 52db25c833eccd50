//! LLM Gateway - An OpenAI-compatible gateway that routes requests across
//! configured backend services.
//!
//! This library provides the routing and admission-control engine behind the
//! gateway, with features including:
//!
//! - **Model Resolution**: Global and per-service redirects, per-service model
//!   name mapping, and a `random` pseudo-model
//! - **Load Balancing**: `first`, `random`, `round_robin` and `hash` selection
//!   over backends and credential sets
//! - **Admission Control**: Token-bucket QPS, sliding-window QPM/RPM and
//!   concurrency limits with bounded, cancellable waits
//! - **Proxy Policy**: Per-service HTTP or SOCKS5 proxy transports
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//! - **Hot Reload**: The routing table can be rebuilt from the config file
//!   without restarting
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: Core functionality (config, errors, logging, metrics, middleware,
//!   admission limiters)
//! - [`services`]: Routing engine (model index, selection, credentials, proxy
//!   policy, access control)
//! - [`api`]: HTTP handlers, request/response models and the router
//!
//! # Configuration
//!
//! The gateway reads a JSON or YAML file (default `config.json`, or the path
//! given as the first argument). `${VAR}` and `${VAR:-default}` references are
//! expanded from the environment before parsing.
//!
//! Optional environment variables:
//! - `RUST_LOG`: Overrides the log filter derived from `log_level`
//! - `LOG_FORMAT`: `json` for JSON log lines
//! - `NO_COLOR`: Disable ANSI colors in logs
//! - `TOKIO_WORKER_THREADS`: Runtime worker thread count

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState, ChatCompletionRequest};
pub use core::{AppError, CancelHandle, GatewayConfig, Result};
pub use services::{ModelRouter, RouteRequest};
