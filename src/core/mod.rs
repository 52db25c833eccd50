//! Core functionality for the gateway.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration loading
//! - Error handling
//! - Logging, metrics and HTTP middleware
//! - Admission control and cancellation

pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;

// Re-export commonly used types
pub use cancel::CancelHandle;
pub use config::{ApiKeyConfig, GatewayConfig, LimitConfig, ProxyConfig, ServiceModel};
pub use error::{AppError, ConfigError, Result};
pub use logging::{get_request_id, init_tracing, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{request_id_middleware, MetricsMiddleware};
pub use rate_limiter::{
    AdmissionGuard, LimitKind, LimitSpec, Limiter, LimiterRegistry, WaitContext, WaitError,
};
