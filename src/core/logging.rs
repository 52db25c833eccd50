//! Logging setup and request-scoped logging context.
//!
//! Request IDs and the selected service are kept in task-local storage so
//! that log lines emitted anywhere on the request path can carry them
//! without threading them through every function.

use chrono::Local;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the service chosen to serve the current request.
    pub static SERVICE_CONTEXT: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current service name from context, if set.
pub fn get_service_context() -> String {
    SERVICE_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Execute an async block with request context (request_id, service).
///
/// ```ignore
/// with_request_context!(request_id, service_name, async {
///     // handler logic here
/// })
/// ```
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $service_name:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::SERVICE_CONTEXT
                    .scope($service_name, $body)
                    .await
            })
            .await
    };
    ($request_id:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID.scope($request_id, $body).await
    };
}

/// Map the configured `log_level` to a default filter directive.
///
/// `prod` logs warnings and errors only, `dev` adds info and `debug` adds
/// debug output from this crate. Unknown values behave like `prod`.
pub fn default_filter(log_level: &str) -> &'static str {
    match log_level.trim().to_ascii_lowercase().as_str() {
        "debug" => "info,llm_gateway=debug",
        "dev" => "info",
        _ => "warn",
    }
}

/// Build the env filter: `RUST_LOG` wins over the configured level, and
/// noisy HTTP library logs are always suppressed.
pub fn build_filter(log_level: &str) -> EnvFilter {
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(log_level).to_string());

    EnvFilter::new(format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    ))
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Install the global tracing subscriber.
///
/// `LOG_FORMAT=json` switches to JSON lines; `NO_COLOR` disables ANSI colors.
/// Calling this twice is harmless: the second install is ignored.
pub fn init_tracing(log_level: &str) {
    let filter = build_filter(log_level);
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let no_color = std::env::var("NO_COLOR").is_ok();

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(LocalTime)
                    .with_current_span(false),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(!no_color),
            )
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    async fn test_request_id_get() {
        REQUEST_ID
            .scope("test-request-123".to_string(), async {
                assert_eq!(get_request_id(), "test-request-123");
            })
            .await;
    }

    #[tokio::test]
    async fn test_request_id_isolation() {
        let task1 = tokio::spawn(async {
            REQUEST_ID
                .scope("request-1".to_string(), async {
                    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                    get_request_id()
                })
                .await
        });

        let task2 = tokio::spawn(async {
            REQUEST_ID
                .scope("request-2".to_string(), async {
                    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                    get_request_id()
                })
                .await
        });

        assert_eq!(task1.await.unwrap(), "request-1");
        assert_eq!(task2.await.unwrap(), "request-2");
    }

    #[tokio::test]
    async fn test_context_defaults() {
        assert_eq!(get_request_id(), "");
        assert_eq!(get_service_context(), "");
    }

    #[tokio::test]
    async fn test_with_request_context_macro() {
        let seen = crate::with_request_context!(
            "req-9".to_string(),
            "siliconflow".to_string(),
            async { (get_request_id(), get_service_context()) }
        );
        assert_eq!(seen, ("req-9".to_string(), "siliconflow".to_string()));
    }

    #[test]
    fn test_generate_request_id() {
        let id1 = generate_request_id();
        let id2 = generate_request_id();

        assert_eq!(id1.len(), 36);
        assert_ne!(id1, id2);
        assert_eq!(id1.split('-').count(), 5);
    }

    #[test]
    fn test_default_filter_levels() {
        assert_eq!(default_filter("prod"), "warn");
        assert_eq!(default_filter("DEV"), "info");
        assert_eq!(default_filter("debug"), "info,llm_gateway=debug");
        assert_eq!(default_filter("verbose"), "warn");
    }

    #[test]
    #[serial]
    fn test_rust_log_overrides_level() {
        unsafe {
            std::env::set_var("RUST_LOG", "trace");
        }
        let filter = build_filter("prod").to_string();
        unsafe {
            std::env::remove_var("RUST_LOG");
        }
        let directives: Vec<&str> = filter.split(',').collect();
        assert!(directives.contains(&"trace"));
        assert!(directives.contains(&"hyper=warn"));
        assert!(!directives.contains(&"warn"));
    }
}
