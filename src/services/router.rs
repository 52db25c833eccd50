//! Model resolution pipeline.
//!
//! Turns a client model name and API key into a concrete backend, rewritten
//! model name, credential set, admission decision and optional proxy
//! transport:
//!
//! 1. access check on the client model
//! 2. global redirect (with the `all` / `random` sentinels)
//! 3. candidate lookup, enabled filter and backend selection
//! 4. backend redirect, then backend model mapping
//! 5. multi-content check on the final model
//! 6. credential rotation and limiter lookup
//! 7. proxy transport
//!
//! Admission (waiting on the limiter) is a separate async step so callers can
//! inspect the route before suspending.

use crate::core::cancel::CancelHandle;
use crate::core::config::GatewayConfig;
use crate::core::error::AppError;
use crate::core::metrics::get_metrics;
use crate::core::rate_limiter::{AdmissionGuard, LimitSpec, Limiter, LimiterRegistry, WaitContext};
use crate::services::access::AccessControl;
use crate::services::credentials::{choose_credentials, CredentialChoice};
use crate::services::load_balancer::{Selector, Strategy};
use crate::services::model_index::{BackendDescriptor, ModelIndex, RANDOM_MODEL};
use crate::services::proxy_policy::{ProxyResolver, ProxyTransport};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Instant;

/// Models that accept multi-part content out of the box. A trailing `*`
/// matches by prefix.
pub const DEFAULT_MULTI_CONTENT_MODELS: &[&str] = &[
    "gpt-4-turbo",
    "glm-4v",
    "gemini-*",
    "yi-vision",
    "gpt-4o*",
];

/// Allow-list of models that accept multi-part (e.g. image + text) content.
#[derive(Debug, Clone)]
pub struct MultiContentPolicy {
    patterns: Vec<String>,
}

impl MultiContentPolicy {
    /// The built-in list followed by `extra` entries.
    pub fn new(extra: &[String]) -> Self {
        let patterns = DEFAULT_MULTI_CONTENT_MODELS
            .iter()
            .map(|m| m.to_string())
            .chain(extra.iter().cloned())
            .collect();
        Self { patterns }
    }

    pub fn allows(&self, model: &str) -> bool {
        self.patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => pattern == model,
        })
    }
}

impl Default for MultiContentPolicy {
    fn default() -> Self {
        Self::new(&[])
    }
}

/// Everything built from one configuration; replaced wholesale on reload.
pub struct RoutingTable {
    pub index: ModelIndex,
    pub strategy: Strategy,
    pub multi_content: MultiContentPolicy,
    pub access: AccessControl,
    pub proxy: ProxyResolver,
}

impl RoutingTable {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            index: ModelIndex::build(config),
            strategy: Strategy::parse(&config.load_balancing),
            multi_content: MultiContentPolicy::new(&config.multi_content_models),
            access: AccessControl::from_config(config),
            proxy: ProxyResolver::new(&config.proxy),
        }
    }
}

/// What the front door knows about one inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub model: &'a str,
    pub api_key: Option<&'a str>,
    /// Any message carries multi-part content
    pub multi_content: bool,
    pub stream: bool,
}

/// The limiter governing a route and the key it is cached under.
#[derive(Debug, Clone)]
pub struct AdmissionPlan {
    pub key: String,
    pub spec: LimitSpec,
    pub limiter: Arc<Limiter>,
}

/// A resolved route, not yet admitted.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub backend: Arc<BackendDescriptor>,
    /// Model as sent by the client
    pub client_model: String,
    /// Model the backend was looked up under
    pub lookup_model: String,
    /// Model to put in the outbound request
    pub final_model: String,
    pub credentials: CredentialChoice,
    pub admission: Option<AdmissionPlan>,
    pub transport: Option<Arc<ProxyTransport>>,
    pub stream: bool,
}

/// A route that passed admission. Holds the concurrency slot, if any, until dropped.
#[derive(Debug)]
pub struct ResolvedRequest {
    pub route: ResolvedRoute,
    guard: AdmissionGuard,
}

impl ResolvedRequest {
    pub fn holds_slot(&self) -> bool {
        self.guard.holds_slot()
    }

    /// Split into the route and the guard that must outlive the upstream call.
    pub fn into_parts(self) -> (ResolvedRoute, AdmissionGuard) {
        (self.route, self.guard)
    }
}

/// The routing engine: swappable routing table plus state that outlives reloads.
pub struct ModelRouter {
    table: ArcSwap<RoutingTable>,
    selector: Selector,
    limiters: LimiterRegistry,
    cancel: CancelHandle,
}

impl ModelRouter {
    pub fn new(config: &GatewayConfig, cancel: CancelHandle) -> Self {
        Self::from_table(RoutingTable::from_config(config), cancel)
    }

    pub fn from_table(table: RoutingTable, cancel: CancelHandle) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            selector: Selector::new(),
            limiters: LimiterRegistry::new(),
            cancel,
        }
    }

    /// Swap in a routing table built from `config`.
    ///
    /// In-flight requests keep the table they started with.
    pub fn reload(&self, config: &GatewayConfig) {
        let table = RoutingTable::from_config(config);
        tracing::info!(
            models = table.index.len(),
            strategy = table.strategy.as_str(),
            "Routing table reloaded"
        );
        self.table.store(Arc::new(table));
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn limiters(&self) -> &LimiterRegistry {
        &self.limiters
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    /// Models to advertise, sorted.
    pub fn listed_models(&self) -> Vec<String> {
        self.table.load().index.listed_models()
    }

    /// Run the synchronous part of the pipeline.
    pub fn resolve_route(&self, request: &RouteRequest<'_>) -> Result<ResolvedRoute, AppError> {
        let table = self.table.load();

        table.access.check(request.api_key, request.model)?;

        let redirected = table.index.global_redirect(request.model);
        let lookup_model = if redirected == RANDOM_MODEL {
            self.pick_any_model(&table)?
        } else {
            redirected
        };

        let candidates = table.index.enabled_candidates(&lookup_model)?;
        let position = self
            .selector
            .select(table.strategy, &lookup_model, candidates.len());
        let backend = candidates[position].clone();

        let final_model = {
            let redirected = backend.redirect_model(&lookup_model);
            backend.map_model(redirected).to_string()
        };

        if request.multi_content && !table.multi_content.allows(&final_model) {
            tracing::warn!(model = %final_model, "Multi-part content not supported by model");
            return Err(AppError::UnsupportedMultiContent(final_model));
        }

        let credentials = choose_credentials(&self.selector, table.strategy, &backend);
        let admission = self.plan_admission(&backend, &credentials);
        let transport = table.proxy.transport_for(&backend)?;

        tracing::info!(
            service = %backend.service_name,
            client_model = %request.model,
            lookup_model = %lookup_model,
            final_model = %final_model,
            limit = admission.as_ref().map(|a| a.spec.kind.as_str()).unwrap_or("none"),
            proxied = transport.is_some(),
            "Route resolved"
        );

        Ok(ResolvedRoute {
            backend,
            client_model: request.model.to_string(),
            lookup_model,
            final_model,
            credentials,
            admission,
            transport,
            stream: request.stream,
        })
    }

    /// Any indexed model, drawn with the configured strategy.
    fn pick_any_model(&self, table: &RoutingTable) -> Result<String, AppError> {
        if table.index.is_empty() {
            return Err(AppError::ModelNotFound(RANDOM_MODEL.to_string()));
        }
        let position = self
            .selector
            .select(table.strategy, RANDOM_MODEL, table.index.len());
        table
            .index
            .model_at(position)
            .map(str::to_string)
            .ok_or_else(|| AppError::ModelNotFound(RANDOM_MODEL.to_string()))
    }

    /// Backend limit first (keyed by service ID), then the credential's own limit.
    fn plan_admission(
        &self,
        backend: &BackendDescriptor,
        credentials: &CredentialChoice,
    ) -> Option<AdmissionPlan> {
        let (key, spec) = match backend.limit_spec() {
            Some(spec) => (backend.service_id.clone(), spec),
            None => {
                let spec = credentials.limit_spec()?;
                (credentials.limiter_key(backend).to_string(), spec)
            }
        };

        let limiter = self.limiters.acquire(&key, &spec);
        Some(AdmissionPlan { key, spec, limiter })
    }

    /// Wait for the route's limiter, bounded by its timeout and the shutdown signal.
    pub async fn admit(&self, route: ResolvedRoute) -> Result<ResolvedRequest, AppError> {
        let Some(plan) = route.admission.clone() else {
            return Ok(ResolvedRequest {
                route,
                guard: AdmissionGuard::default(),
            });
        };

        let kind = plan.spec.kind.as_str();
        let ctx = WaitContext::new(plan.spec.timeout, self.cancel.clone());
        let start = Instant::now();
        let result = plan.limiter.admit(&ctx).await;
        let waited = start.elapsed();

        let metrics = get_metrics();
        metrics
            .admission_wait
            .with_label_values(&[kind])
            .observe(waited.as_secs_f64());

        match result {
            Ok(guard) => {
                tracing::debug!(
                    service = %route.backend.service_name,
                    kind = kind,
                    waited_ms = waited.as_millis() as u64,
                    "Admitted"
                );
                Ok(ResolvedRequest { route, guard })
            }
            Err(err) => {
                metrics
                    .admission_rejections
                    .with_label_values(&[kind, err.reason()])
                    .inc();
                tracing::warn!(
                    service = %route.backend.service_name,
                    limiter_key = %plan.key,
                    kind = kind,
                    reason = err.reason(),
                    timeout_secs = plan.spec.timeout.as_secs(),
                    waited_ms = waited.as_millis() as u64,
                    "Admission refused"
                );
                Err(AppError::RateLimited(format!(
                    "{} limit: {} after {:.3}s",
                    kind,
                    err,
                    waited.as_secs_f64()
                )))
            }
        }
    }

    /// Resolve and admit in one step.
    pub async fn resolve(&self, request: &RouteRequest<'_>) -> Result<ResolvedRequest, AppError> {
        let route = self.resolve_route(request)?;
        self.admit(route).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{LimitConfig, ProxyConfig, ServiceModel};
    use crate::core::rate_limiter::LimitKind;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::collections::HashMap;

    fn offering(models: &[&str]) -> ServiceModel {
        ServiceModel {
            models: models.iter().map(|m| m.to_string()).collect(),
            enabled: true,
            server_url: "https://api.example.com/v1".to_string(),
            ..Default::default()
        }
    }

    fn config(services: Vec<(&str, ServiceModel)>) -> GatewayConfig {
        let mut config = GatewayConfig {
            load_balancing: "round_robin".to_string(),
            ..Default::default()
        };
        for (name, service) in services {
            config
                .services
                .entry(name.to_string())
                .or_default()
                .push(service);
        }
        config
    }

    fn request(model: &str) -> RouteRequest<'_> {
        RouteRequest {
            model,
            api_key: None,
            multi_content: false,
            stream: false,
        }
    }

    #[test]
    fn test_redirect_then_mapping() {
        let mut service = offering(&["gpt-4-new"]);
        service
            .model_redirect
            .insert("gpt-4".to_string(), "gpt-4-new".to_string());
        service
            .model_map
            .insert("gpt-4-new".to_string(), "gpt-4-new-v2".to_string());
        let router = ModelRouter::new(&config(vec![("svc", service)]), CancelHandle::new());

        let route = router.resolve_route(&request("gpt-4")).unwrap();
        assert_eq!(route.client_model, "gpt-4");
        assert_eq!(route.final_model, "gpt-4-new-v2");
    }

    #[test]
    fn test_global_all_random_routes_everything() {
        let mut cfg = config(vec![("svc", offering(&["qwen-7b"]))]);
        cfg.model_redirect
            .insert("all".to_string(), "random".to_string());
        let router = ModelRouter::new(&cfg, CancelHandle::new());

        for model in ["gpt-4", "claude-3", "anything"] {
            let route = router.resolve_route(&request(model)).unwrap();
            assert_eq!(route.lookup_model, "qwen-7b");
            assert_eq!(route.client_model, model);
        }
    }

    #[test]
    fn test_random_with_empty_index() {
        let router = ModelRouter::new(&config(Vec::new()), CancelHandle::new());
        assert_matches!(
            router.resolve_route(&request("random")),
            Err(AppError::ModelNotFound(_))
        );
    }

    #[test]
    fn test_unknown_model() {
        let router = ModelRouter::new(&config(vec![("svc", offering(&["m"]))]), CancelHandle::new());
        assert_matches!(
            router.resolve_route(&request("nope")),
            Err(AppError::ModelNotFound(m)) if m == "nope"
        );
    }

    #[test]
    fn test_round_robin_across_backends() {
        let router = ModelRouter::new(
            &config(vec![("a", offering(&["m"])), ("b", offering(&["m"]))]),
            CancelHandle::new(),
        );
        let services: Vec<_> = (0..4)
            .map(|_| router.resolve_route(&request("m")).unwrap().backend.service_name.clone())
            .collect();
        assert_eq!(services, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_multi_content_policy() {
        let policy = MultiContentPolicy::new(&["my-vision*".to_string()]);
        assert!(policy.allows("gpt-4o"));
        assert!(policy.allows("gpt-4o-mini"));
        assert!(policy.allows("gemini-1.5-pro"));
        assert!(policy.allows("my-vision-7b"));
        assert!(!policy.allows("gpt-3.5-turbo"));
        assert!(!policy.allows("gemini"));
    }

    #[test]
    fn test_multi_content_checked_on_final_model() {
        let mut service = offering(&["vision"]);
        service
            .model_map
            .insert("vision".to_string(), "gpt-4o".to_string());
        let cfg = config(vec![("svc", service), ("txt", offering(&["text-only"]))]);
        let router = ModelRouter::new(&cfg, CancelHandle::new());

        let mut req = request("vision");
        req.multi_content = true;
        assert!(router.resolve_route(&req).is_ok());

        let mut req = request("text-only");
        req.multi_content = true;
        assert_matches!(
            router.resolve_route(&req),
            Err(AppError::UnsupportedMultiContent(m)) if m == "text-only"
        );
    }

    #[test]
    fn test_backend_limit_wins_over_credential_limit() {
        let mut service = offering(&["m"]);
        service.limit = LimitConfig {
            qpm: 60.0,
            ..Default::default()
        };
        service.credential_list = vec![json!({"api_key": "k", "limit": {"concurrency": 1}})
            .as_object()
            .cloned()
            .unwrap()];
        let router = ModelRouter::new(&config(vec![("svc", service)]), CancelHandle::new());

        let route = router.resolve_route(&request("m")).unwrap();
        let plan = route.admission.unwrap();
        assert_eq!(plan.spec.kind, LimitKind::Qpm);
        assert_eq!(plan.key, route.backend.service_id);
    }

    #[test]
    fn test_credential_limit_keyed_by_identity() {
        let mut service = offering(&["m"]);
        service.credential_list = vec![
            json!({"api_key": "a", "limit": {"rpm": 10}}).as_object().cloned().unwrap(),
            json!({"api_key": "b", "limit": {"rpm": 10}}).as_object().cloned().unwrap(),
        ];
        let router = ModelRouter::new(&config(vec![("svc", service)]), CancelHandle::new());

        let first = router.resolve_route(&request("m")).unwrap();
        let second = router.resolve_route(&request("m")).unwrap();
        let (p1, p2) = (first.admission.unwrap(), second.admission.unwrap());
        assert!(p1.key.ends_with("_credentials_0"));
        assert!(p2.key.ends_with("_credentials_1"));
        assert!(!Arc::ptr_eq(&p1.limiter, &p2.limiter));
        assert_eq!(router.limiters().len(), 2);
    }

    #[test]
    fn test_no_limit_means_no_admission() {
        let router = ModelRouter::new(&config(vec![("svc", offering(&["m"]))]), CancelHandle::new());
        let route = router.resolve_route(&request("m")).unwrap();
        assert!(route.admission.is_none());
        assert!(router.limiters().is_empty());
    }

    #[test]
    fn test_proxy_attached_per_policy() {
        let mut cfg = config(vec![("svc", offering(&["m"]))]);
        cfg.proxy = ProxyConfig {
            strategy: "all".to_string(),
            proxy_type: "http".to_string(),
            http_proxy: "http://127.0.0.1:3128".to_string(),
            timeout: 5,
            ..Default::default()
        };
        let router = ModelRouter::new(&cfg, CancelHandle::new());
        assert!(router.resolve_route(&request("m")).unwrap().transport.is_some());

        cfg.proxy.strategy = "default".to_string();
        router.reload(&cfg);
        assert!(router.resolve_route(&request("m")).unwrap().transport.is_none());
    }

    #[test]
    fn test_reload_swaps_index() {
        let router = ModelRouter::new(&config(vec![("svc", offering(&["old"]))]), CancelHandle::new());
        assert_eq!(router.listed_models(), vec!["old"]);

        router.reload(&config(vec![("svc", offering(&["new"]))]));
        assert_eq!(router.listed_models(), vec!["new"]);
        assert_matches!(
            router.resolve_route(&request("old")),
            Err(AppError::ModelNotFound(_))
        );
    }

    #[test]
    fn test_access_checked_on_client_model() {
        let mut cfg = config(vec![("svc", offering(&["gpt-4o"]))]);
        cfg.model_redirect
            .insert("gpt-4".to_string(), "gpt-4o".to_string());
        let mut supported_models = HashMap::new();
        supported_models.insert("svc".to_string(), vec!["gpt-4".to_string()]);
        cfg.api_keys = vec![crate::core::config::ApiKeyConfig {
            api_key: "sk-client".to_string(),
            supported_models,
        }];
        let router = ModelRouter::new(&cfg, CancelHandle::new());

        let mut req = request("gpt-4");
        req.api_key = Some("sk-client");
        assert!(router.resolve_route(&req).is_ok());

        let mut req = request("gpt-4o");
        req.api_key = Some("sk-client");
        assert_matches!(
            router.resolve_route(&req),
            Err(AppError::ForbiddenModelForKey(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_times_out_as_rate_limited() {
        let mut service = offering(&["m"]);
        service.limit = LimitConfig {
            concurrency: 1.0,
            timeout: 2,
            ..Default::default()
        };
        let router = ModelRouter::new(&config(vec![("svc", service)]), CancelHandle::new());

        let held = router.resolve(&request("m")).await.unwrap();
        assert!(held.holds_slot());

        assert_matches!(
            router.resolve(&request("m")).await,
            Err(AppError::RateLimited(_))
        );

        drop(held);
        assert!(router.resolve(&request("m")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_admission() {
        let mut service = offering(&["m"]);
        service.limit = LimitConfig {
            qpm: 1.0,
            timeout: 30,
            ..Default::default()
        };
        let cancel = CancelHandle::new();
        let router = Arc::new(ModelRouter::new(&config(vec![("svc", service)]), cancel.clone()));
        router.resolve(&request("m")).await.unwrap();

        let waiting = {
            let router = router.clone();
            tokio::spawn(async move { router.resolve(&request("m")).await.map(|_| ()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();

        let err = waiting.await.unwrap().unwrap_err();
        assert_matches!(err, AppError::RateLimited(ref msg) if msg.contains("canceled"));
    }
}
