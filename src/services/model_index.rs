//! Model-to-backend index built from the configuration.
//!
//! The index is immutable once built. Reconfiguration builds a new index and
//! swaps it in wholesale.

use crate::core::config::{Credentials, GatewayConfig, LimitConfig, ServiceModel};
use crate::core::error::AppError;
use crate::core::rate_limiter::LimitSpec;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Model name that routes to any indexed model.
pub const RANDOM_MODEL: &str = "random";

/// Global redirect key that captures every request.
pub const ALL_MODELS: &str = "all";

const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(300);

/// One enabled model offering of a service.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub service_name: String,
    /// Unique per model x service; stable for the lifetime of the index
    pub service_id: String,
    pub provider: Option<String>,
    pub models: Vec<String>,
    pub embedding_models: Vec<String>,
    pub model_map: HashMap<String, String>,
    pub model_redirect: HashMap<String, String>,
    pub credentials: Credentials,
    pub credential_list: Vec<Credentials>,
    pub limit: LimitConfig,
    pub use_proxy: Option<bool>,
    pub enabled: bool,
    pub server_url: String,
    pub timeout: Duration,
}

impl BackendDescriptor {
    /// Describe `service` as offered by `service_name`, with a fresh service ID.
    pub fn from_service(service_name: &str, service: &ServiceModel) -> Self {
        Self {
            service_name: service_name.to_string(),
            service_id: uuid::Uuid::new_v4().to_string(),
            provider: service.provider.clone(),
            models: service.models.clone(),
            embedding_models: service.embedding_models.clone(),
            model_map: service.model_map.clone(),
            model_redirect: service.model_redirect.clone(),
            credentials: service.credentials.clone(),
            credential_list: service.credential_list.clone(),
            limit: service.limit.clone(),
            use_proxy: service.use_proxy,
            enabled: service.enabled,
            server_url: service.server_url.clone(),
            timeout: if service.timeout == 0 {
                DEFAULT_BACKEND_TIMEOUT
            } else {
                Duration::from_secs(service.timeout)
            },
        }
    }

    /// Apply this backend's model redirect; unmatched names pass through.
    pub fn redirect_model<'a>(&'a self, model: &'a str) -> &'a str {
        match self.model_redirect.get(model) {
            Some(target) => {
                tracing::debug!(model = %model, redirect = %target, "Backend model redirect");
                target
            }
            None => model,
        }
    }

    /// Apply this backend's model map; unmatched names pass through.
    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        match self.model_map.get(model) {
            Some(mapped) => {
                tracing::debug!(model = %model, mapped = %mapped, "Backend model mapping");
                mapped
            }
            None => model,
        }
    }

    /// Backend-level admission limit, if one is usable.
    pub fn limit_spec(&self) -> Option<LimitSpec> {
        LimitSpec::from_config(&self.limit)
    }
}

/// Model name -> candidate backends, plus the listing and the global redirect table.
#[derive(Debug, Default)]
pub struct ModelIndex {
    model_to_backends: BTreeMap<String, Vec<Arc<BackendDescriptor>>>,
    support_models: BTreeSet<String>,
    hidden_models: BTreeSet<String>,
    global_redirect: HashMap<String, String>,
}

impl ModelIndex {
    /// Index every enabled service offering in the configuration.
    ///
    /// Each served model gets its own descriptor. A service-level redirect
    /// alias is registered once per offering, on the descriptor for its
    /// target model when the offering serves it.
    pub fn build(config: &GatewayConfig) -> Self {
        let mut index = Self {
            global_redirect: config.model_redirect.clone(),
            ..Default::default()
        };

        for (service_name, offerings) in &config.services {
            for service in offerings.iter().filter(|s| s.enabled) {
                tracing::info!(
                    service = %service_name,
                    models = ?service.models,
                    embedding_models = ?service.embedding_models,
                    timeout = service.timeout,
                    limit = ?service.limit,
                    embedding_limit = ?service.embedding_limit,
                    "Indexing service"
                );

                let mut created: Vec<(String, Arc<BackendDescriptor>)> = Vec::new();
                for model in &service.models {
                    let descriptor = Arc::new(BackendDescriptor::from_service(service_name, service));
                    index.register(model, descriptor.clone());
                    index.support_models.insert(model.clone());
                    created.push((model.clone(), descriptor));
                }
                for model in &service.embedding_models {
                    let descriptor = Arc::new(BackendDescriptor::from_service(service_name, service));
                    index.register(model, descriptor.clone());
                    created.push((model.clone(), descriptor));
                }

                for (alias, target) in &service.model_redirect {
                    if created.iter().any(|(model, _)| model == alias) {
                        continue;
                    }
                    let descriptor = created
                        .iter()
                        .find(|(model, _)| model == target)
                        .or_else(|| created.first())
                        .map(|(_, d)| d.clone())
                        .unwrap_or_else(|| {
                            Arc::new(BackendDescriptor::from_service(service_name, service))
                        });
                    index.register(alias, descriptor);
                    index.register_listing_alias(alias, target);
                }
            }
        }

        tracing::info!(
            models = index.model_to_backends.len(),
            listed = index.support_models.len(),
            "Model index built"
        );
        index
    }

    /// Index prepared descriptors as-is, disabled ones included.
    ///
    /// Each descriptor is registered under its models, embedding models and
    /// redirect aliases.
    pub fn from_backends(
        backends: impl IntoIterator<Item = BackendDescriptor>,
        global_redirect: HashMap<String, String>,
    ) -> Self {
        let mut index = Self {
            global_redirect,
            ..Default::default()
        };

        for backend in backends {
            let backend = Arc::new(backend);
            for model in &backend.models {
                index.register(model, backend.clone());
                index.support_models.insert(model.clone());
            }
            for model in &backend.embedding_models {
                index.register(model, backend.clone());
            }
            for (alias, target) in &backend.model_redirect {
                if !backend.models.contains(alias) {
                    index.register(alias, backend.clone());
                }
                index.register_listing_alias(alias, target);
            }
        }
        index
    }

    fn register(&mut self, model: &str, backend: Arc<BackendDescriptor>) {
        self.model_to_backends
            .entry(model.to_string())
            .or_default()
            .push(backend);
    }

    fn register_listing_alias(&mut self, alias: &str, target: &str) {
        self.support_models.insert(alias.to_string());
        if alias != target {
            self.hidden_models.insert(target.to_string());
        }
    }

    /// All backends indexed under `model`, enabled or not.
    pub fn candidates(&self, model: &str) -> Option<&[Arc<BackendDescriptor>]> {
        self.model_to_backends.get(model).map(Vec::as_slice)
    }

    /// Enabled backends for `model`, in index order.
    pub fn enabled_candidates(&self, model: &str) -> Result<Vec<Arc<BackendDescriptor>>, AppError> {
        let candidates = self
            .candidates(model)
            .ok_or_else(|| AppError::ModelNotFound(model.to_string()))?;

        let enabled: Vec<_> = candidates.iter().filter(|b| b.enabled).cloned().collect();
        if enabled.is_empty() {
            return Err(AppError::NoEnabledBackend(model.to_string()));
        }
        Ok(enabled)
    }

    /// Indexed model name at `position` in sorted order.
    pub fn model_at(&self, position: usize) -> Option<&str> {
        self.model_to_backends
            .keys()
            .nth(position)
            .map(String::as_str)
    }

    /// Number of distinct indexed model names.
    pub fn len(&self) -> usize {
        self.model_to_backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.model_to_backends.is_empty()
    }

    /// Model names to advertise, sorted. Redirect targets are hidden behind
    /// their aliases.
    pub fn listed_models(&self) -> Vec<String> {
        self.support_models
            .iter()
            .filter(|m| !self.hidden_models.contains(*m))
            .cloned()
            .collect()
    }

    /// Apply the global redirect table.
    ///
    /// An `all` entry captures every model; an `all` target means any model.
    pub fn global_redirect(&self, model: &str) -> String {
        if let Some(target) = self.global_redirect.get(ALL_MODELS) {
            let target = if target == ALL_MODELS {
                RANDOM_MODEL
            } else {
                target.as_str()
            };
            tracing::debug!(model = %model, redirect = %target, "Global redirect (all)");
            return target.to_string();
        }

        match self.global_redirect.get(model) {
            Some(target) => {
                tracing::debug!(model = %model, redirect = %target, "Global redirect");
                target.clone()
            }
            None => model.to_string(),
        }
    }
}
