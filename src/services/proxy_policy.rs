//! Outbound proxy policy and transport construction.
//!
//! The global strategy decides per backend whether requests go through the
//! configured HTTP or SOCKS5 proxy. The proxied client is built on first use
//! and shared afterwards.

use crate::core::config::ProxyConfig;
use crate::core::error::AppError;
use crate::services::model_index::BackendDescriptor;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Global proxy strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyStrategy {
    /// Every backend is proxied
    ForceAll,
    /// Proxied unless the backend opts out
    All,
    /// Proxied only if the backend opts in
    Default,
    #[default]
    Disabled,
}

impl ProxyStrategy {
    /// Parse a configured strategy; unknown values disable proxying.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "forceall" => ProxyStrategy::ForceAll,
            "all" => ProxyStrategy::All,
            "default" => ProxyStrategy::Default,
            "disabled" | "" => ProxyStrategy::Disabled,
            other => {
                tracing::warn!(strategy = %other, "Unknown proxy strategy, proxy disabled");
                ProxyStrategy::Disabled
            }
        }
    }

    /// Whether a backend with the given opt-in flag is proxied.
    pub fn requires_proxy(&self, use_proxy: Option<bool>) -> bool {
        match self {
            ProxyStrategy::ForceAll => true,
            ProxyStrategy::All => use_proxy != Some(false),
            ProxyStrategy::Default => use_proxy == Some(true),
            ProxyStrategy::Disabled => false,
        }
    }
}

/// Proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks5,
}

impl ProxyKind {
    pub fn parse(name: &str) -> Result<Self, AppError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyKind::Http),
            "socks5" => Ok(ProxyKind::Socks5),
            other => Err(AppError::UnsupportedProxyType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        }
    }
}

/// An HTTP client that dials through a proxy.
#[derive(Debug, Clone)]
pub struct ProxyTransport {
    pub kind: ProxyKind,
    /// Proxy address as used for dialing (`host:port` for SOCKS5)
    pub address: String,
    pub client: reqwest::Client,
}

/// Reduce `socks5://host:port` to `host:port`; other forms pass through.
pub fn socks5_address(raw: &str) -> Result<String, AppError> {
    let raw = raw.trim();
    if !raw.to_ascii_lowercase().starts_with("socks5:") {
        return Ok(raw.to_string());
    }

    let url = reqwest::Url::parse(raw)
        .map_err(|e| AppError::ProxyTransport(format!("invalid SOCKS5 URL {}: {}", raw, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| AppError::ProxyTransport(format!("SOCKS5 URL {} has no host", raw)))?;

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Build a proxied client.
///
/// HTTP proxies use `address` for all traffic, or for plain HTTP only when a
/// separate `https_address` is given. Connect and keep-alive timeouts both
/// equal `timeout`. SOCKS5 proxies bound each dial by `timeout`.
pub fn build_transport(
    kind: &str,
    address: &str,
    https_address: Option<&str>,
    timeout: Duration,
) -> Result<ProxyTransport, AppError> {
    let kind = ProxyKind::parse(kind)?;
    let proxy_err = |e: reqwest::Error| AppError::ProxyTransport(e.to_string());

    let (address, builder) = match kind {
        ProxyKind::Http => {
            let https_address = https_address.filter(|a| !a.trim().is_empty());
            let mut builder = reqwest::Client::builder()
                .connect_timeout(timeout)
                .tcp_keepalive(timeout);

            builder = match https_address {
                Some(https) => {
                    if !address.trim().is_empty() {
                        builder = builder.proxy(reqwest::Proxy::http(address).map_err(proxy_err)?);
                    }
                    builder.proxy(reqwest::Proxy::https(https).map_err(proxy_err)?)
                }
                None => {
                    if address.trim().is_empty() {
                        return Err(AppError::ProxyTransport(
                            "no HTTP proxy address configured".to_string(),
                        ));
                    }
                    builder.proxy(reqwest::Proxy::all(address).map_err(proxy_err)?)
                }
            };
            (address.trim().to_string(), builder)
        }
        ProxyKind::Socks5 => {
            let address = socks5_address(address)?;
            if address.is_empty() {
                return Err(AppError::ProxyTransport(
                    "no SOCKS5 proxy address configured".to_string(),
                ));
            }
            let proxy =
                reqwest::Proxy::all(format!("socks5://{}", address)).map_err(proxy_err)?;
            let builder = reqwest::Client::builder()
                .connect_timeout(timeout)
                .proxy(proxy);
            (address, builder)
        }
    };

    let client = builder.build().map_err(proxy_err)?;
    tracing::info!(kind = kind.as_str(), address = %address, "Proxy transport ready");

    Ok(ProxyTransport {
        kind,
        address,
        client,
    })
}

/// Resolves, per backend, whether to proxy and with which transport.
pub struct ProxyResolver {
    strategy: ProxyStrategy,
    config: ProxyConfig,
    transport: OnceCell<Arc<ProxyTransport>>,
}

impl ProxyResolver {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            strategy: ProxyStrategy::parse(&config.strategy),
            config: config.clone(),
            transport: OnceCell::new(),
        }
    }

    pub fn strategy(&self) -> ProxyStrategy {
        self.strategy
    }

    pub fn is_required(&self, backend: &BackendDescriptor) -> bool {
        self.strategy.requires_proxy(backend.use_proxy)
    }

    /// Transport for `backend`, or `None` when it goes direct.
    ///
    /// Build failures are returned to the caller rather than falling back to
    /// a direct connection.
    pub fn transport_for(
        &self,
        backend: &BackendDescriptor,
    ) -> Result<Option<Arc<ProxyTransport>>, AppError> {
        if !self.is_required(backend) {
            return Ok(None);
        }

        let transport = self
            .transport
            .get_or_try_init(|| self.build_configured().map(Arc::new))?;
        Ok(Some(transport.clone()))
    }

    fn build_configured(&self) -> Result<ProxyTransport, AppError> {
        let timeout = if self.config.timeout == 0 {
            DEFAULT_PROXY_TIMEOUT
        } else {
            Duration::from_secs(self.config.timeout)
        };

        match ProxyKind::parse(&self.config.proxy_type)? {
            ProxyKind::Http => build_transport(
                "http",
                &self.config.http_proxy,
                Some(self.config.https_proxy.as_str()),
                timeout,
            ),
            ProxyKind::Socks5 => build_transport("socks5", &self.config.socks5_proxy, None, timeout),
        }
    }
}
