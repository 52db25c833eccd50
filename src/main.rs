//! LLM Gateway - Main entry point
//!
//! This binary loads the configuration file, builds the routing engine and
//! runs the HTTP server until Ctrl-C or SIGTERM.

use anyhow::{Context, Result};
use llm_gateway::{
    api::{build_router, AppState},
    core::{init_metrics, init_tracing, CancelHandle, GatewayConfig},
    services::ModelRouter,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config.json";

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    // Detect optimal worker threads from environment or cgroup
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .or_else(detect_cpu_limit)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

    // Build custom Tokio runtime with explicit thread count
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = GatewayConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    init_tracing(config.effective_log_level());
    init_metrics();

    let addr = config.listen_addr()?;
    let cancel = CancelHandle::new();
    let router = Arc::new(ModelRouter::new(&config, cancel.clone()));

    let table = router.table();
    tracing::info!(
        config = %config_path.display(),
        models = table.index.len(),
        load_balancing = table.strategy.as_str(),
        proxy = ?table.proxy.strategy(),
        "Configuration loaded"
    );
    drop(table);

    let client = create_http_client(&config)?;
    let state = Arc::new(AppState::with_client(router.clone(), client));
    let app = build_router(state, config.enable_web);

    spawn_reload_listener(router, config_path);

    tracing::info!("Starting LLM Gateway on {}", addr);
    tracing::info!("OpenAI API: /v1/chat/completions, /v1/models");
    tracing::info!("Metrics endpoint: /metrics");
    if config.enable_web {
        tracing::info!("Web UI: /static");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Create HTTP client with connection pooling
fn create_http_client(config: &GatewayConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .context("failed to build HTTP client")?;
    Ok(client)
}

/// Rebuild the routing table from the config file on SIGHUP.
#[cfg(unix)]
fn spawn_reload_listener(router: Arc<ModelRouter>, config_path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Could not install SIGHUP handler, reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match GatewayConfig::load(&config_path) {
                Ok(config) => {
                    router.reload(&config);
                    tracing::info!(config = %config_path.display(), "Configuration reloaded");
                }
                Err(e) => {
                    tracing::error!(
                        config = %config_path.display(),
                        error = %e,
                        "Reload failed, keeping current configuration"
                    );
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_router: Arc<ModelRouter>, _config_path: PathBuf) {}

/// Wait for Ctrl-C or SIGTERM, then cancel pending admission waits.
async fn shutdown_signal(cancel: CancelHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    cancel.cancel();
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    // Try cgroup v2 first
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if parts.len() == 2 {
            if let (Ok(quota), Ok(period)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
                if quota > 0 {
                    return Some(((quota as f64 / period as f64).ceil() as usize).max(1));
                }
            }
        }
    }

    // Fallback to cgroup v1
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    if quota > 0 {
        Some(((quota as f64 / period as f64).ceil() as usize).max(1))
    } else {
        None
    }
}
