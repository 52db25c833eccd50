//! Configuration management for the gateway.
//!
//! This module handles loading and parsing the gateway configuration from JSON
//! or YAML files (chosen by file extension), with support for environment
//! variable expansion.

use crate::core::error::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Credential set attached to a service, as free-form key/value pairs.
pub type Credentials = serde_json::Map<String, serde_json::Value>;

const DEFAULT_SERVER_PORT: &str = ":9090";
const DEFAULT_LOAD_BALANCING: &str = "random";
const DEFAULT_LOG_LEVEL: &str = "prod";
const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;
const CONFIG_DIR: &str = "config";

/// Main gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen address, e.g. `:9090` or `127.0.0.1:8080`
    #[serde(default)]
    pub server_port: String,

    #[serde(default)]
    pub debug: bool,

    /// One of `prod`, `dev`, `debug`
    #[serde(default)]
    pub log_level: String,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Optional master key every request must present
    #[serde(default)]
    pub api_key: Option<String>,

    /// Load balancing strategy name (`first`, `random`, `round_robin`, `hash`)
    #[serde(default)]
    pub load_balancing: String,

    /// Extra models allowed to receive multi-part content (`name*` prefixes allowed)
    #[serde(default)]
    pub multi_content_models: Vec<String>,

    /// Global model redirect table, applied before any backend is chosen
    #[serde(default)]
    pub model_redirect: HashMap<String, String>,

    /// Service name -> service offerings
    #[serde(default)]
    pub services: BTreeMap<String, Vec<ServiceModel>>,

    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,

    /// Serve `./static` when set
    #[serde(default)]
    pub enable_web: bool,

    /// Timeout for upstream requests without a per-service timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// One offering of a service: a set of models sharing credentials, limits and proxy policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceModel {
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub models: Vec<String>,

    #[serde(default)]
    pub embedding_models: Vec<String>,

    #[serde(default)]
    pub embedding_limit: LimitConfig,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub credentials: Credentials,

    /// Rotated credential sets; takes precedence over `credentials` when non-empty
    #[serde(default)]
    pub credential_list: Vec<Credentials>,

    #[serde(default)]
    pub server_url: String,

    /// Client model -> provider model rewrite
    #[serde(default)]
    pub model_map: HashMap<String, String>,

    /// Model -> model routing override for this service
    #[serde(default)]
    pub model_redirect: HashMap<String, String>,

    #[serde(default)]
    pub limit: LimitConfig,

    /// Tri-state proxy opt-in: unset, true or false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_proxy: Option<bool>,

    /// Upstream timeout in seconds
    #[serde(default)]
    pub timeout: u64,
}

/// Admission limit for a service. The first positive value among
/// qps, qpm, rpm and concurrency (in that order) governs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    #[serde(default)]
    pub qps: f64,

    #[serde(default)]
    pub qpm: f64,

    #[serde(default)]
    pub rpm: f64,

    #[serde(default)]
    pub concurrency: f64,

    /// Admission timeout in seconds
    #[serde(default)]
    pub timeout: u64,
}

/// Outbound proxy settings shared by every proxied service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `forceall`, `all`, `default` or `disabled`
    #[serde(default)]
    pub strategy: String,

    /// `http` or `socks5`
    #[serde(default, rename = "type")]
    pub proxy_type: String,

    #[serde(default)]
    pub http_proxy: String,

    #[serde(default)]
    pub https_proxy: String,

    #[serde(default)]
    pub socks5_proxy: String,

    /// Dial timeout in seconds
    #[serde(default)]
    pub timeout: u64,
}

/// A client API key and the models it may request, grouped by service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub api_key: String,

    /// Service name -> model names; a `*` entry authorizes every model
    #[serde(default)]
    pub supported_models: HashMap<String, Vec<String>>,
}

fn default_request_timeout() -> u64 {
    DEFAULT_SERVICE_TIMEOUT_SECS
}

/// Supported configuration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Pick the format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        match ext.as_str() {
            "json" => Ok(Self::Json),
            "yml" | "yaml" => Ok(Self::Yaml),
            _ => Err(ConfigError::UnsupportedFormat(ext)),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON or YAML file.
    ///
    /// Relative names that do not exist are retried under `config/`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_gateway::core::config::GatewayConfig;
    ///
    /// let config = GatewayConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = resolve_config_path(path.as_ref());
        let format = ConfigFormat::from_path(&path)?;

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        tracing::info!(path = %path.display(), ?format, "Loading configuration");
        Self::parse(&content, format)
    }

    /// Parse configuration content in the given format.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);

        let mut config: GatewayConfig = match format {
            ConfigFormat::Json => serde_json::from_str(&expanded).map_err(|source| {
                let context = error_context(&expanded, source.line(), source.column());
                ConfigError::Json {
                    line: source.line(),
                    column: source.column(),
                    context,
                    source,
                }
            })?,
            ConfigFormat::Yaml => serde_yaml::from_str(&expanded)?,
        };

        config.apply_defaults();
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.server_port.trim().is_empty() {
            self.server_port = DEFAULT_SERVER_PORT.to_string();
        }
        if self.load_balancing.trim().is_empty() {
            self.load_balancing = DEFAULT_LOAD_BALANCING.to_string();
        }
        if self.log_level.trim().is_empty() {
            self.log_level = DEFAULT_LOG_LEVEL.to_string();
        }
        if self.proxy.timeout == 0 {
            self.proxy.timeout = DEFAULT_PROXY_TIMEOUT_SECS;
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = DEFAULT_SERVICE_TIMEOUT_SECS;
        }
        for service in self.services.values_mut().flatten() {
            if service.timeout == 0 {
                service.timeout = self.request_timeout_secs;
            }
        }
    }

    /// Logging level to run with; `debug: true` forces `debug`.
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    /// Socket address to bind, accepting the `:port` shorthand.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = self.server_port.trim();
        let normalized = if raw.starts_with(':') {
            format!("0.0.0.0{}", raw)
        } else if raw.parse::<u16>().is_ok() {
            format!("0.0.0.0:{}", raw)
        } else {
            raw.to_string()
        };

        normalized
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(raw.to_string()))
    }
}

/// Return `path` if it exists, else the same name under `config/`.
fn resolve_config_path(path: &Path) -> PathBuf {
    if path.exists() || path.is_absolute() {
        return path.to_path_buf();
    }

    let fallback = Path::new(CONFIG_DIR).join(path);
    if fallback.exists() {
        tracing::debug!(
            requested = %path.display(),
            resolved = %fallback.display(),
            "Config not found, using config directory"
        );
        return fallback;
    }

    path.to_path_buf()
}

/// Up to 20 bytes either side of a 1-based line/column position.
fn error_context(content: &str, line: usize, column: usize) -> String {
    let line_start: usize = content
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    let offset = (line_start + column.saturating_sub(1)).min(content.len());

    let mut start = offset.saturating_sub(20);
    let mut end = (offset + 20).min(content.len());
    while !content.is_char_boundary(start) {
        start -= 1;
    }
    while !content.is_char_boundary(end) {
        end += 1;
    }

    content[start..end].trim().to_string()
}

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-?([^}]*))?\}").expect("valid env var pattern")
});

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}
