//! Client API key checks.
//!
//! Keys are held as SHA-256 digests, never in plain text.

use crate::api::auth::hash_key;
use crate::core::config::{ApiKeyConfig, GatewayConfig};
use crate::core::error::AppError;
use std::collections::{HashMap, HashSet};

/// Models a client key may request.
#[derive(Debug, Clone, Default)]
struct KeyGrant {
    all_models: bool,
    models: HashSet<String>,
}

impl KeyGrant {
    fn allows(&self, model: &str) -> bool {
        self.all_models || self.models.contains(model)
    }
}

/// Master key and per-key model allow-lists.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    master_key_hash: Option<String>,
    grants: HashMap<String, KeyGrant>,
}

impl AccessControl {
    pub fn new(master_key: Option<&str>, api_keys: &[ApiKeyConfig]) -> Self {
        let master_key_hash = master_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(hash_key);

        let mut grants: HashMap<String, KeyGrant> = HashMap::new();
        for key_config in api_keys {
            let grant = grants.entry(hash_key(&key_config.api_key)).or_default();
            // Service grouping only documents the grant; any listed model is allowed
            for models in key_config.supported_models.values() {
                for model in models {
                    if model == "*" {
                        grant.all_models = true;
                    } else {
                        grant.models.insert(model.clone());
                    }
                }
            }
        }

        Self {
            master_key_hash,
            grants,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.api_key.as_deref(), &config.api_keys)
    }

    /// True when neither a master key nor a key table is configured.
    pub fn is_open(&self) -> bool {
        self.master_key_hash.is_none() && self.grants.is_empty()
    }

    /// Check the presented key against the master key and the key table.
    pub fn check(&self, presented: Option<&str>, model: &str) -> Result<(), AppError> {
        if self.is_open() {
            return Ok(());
        }
        let presented_hash = presented.map(hash_key);

        if let Some(master) = &self.master_key_hash {
            if presented_hash.as_ref() != Some(master) {
                tracing::warn!("Request rejected: master key mismatch");
                return Err(AppError::Unauthorized);
            }
        }

        if self.grants.is_empty() {
            return Ok(());
        }

        let grant = presented_hash
            .as_ref()
            .and_then(|hash| self.grants.get(hash))
            .ok_or_else(|| {
                tracing::warn!("Request rejected: unknown API key");
                AppError::UnauthorizedApiKey
            })?;

        if !grant.allows(model) {
            tracing::warn!(model = %model, "Request rejected: model not allowed for key");
            return Err(AppError::ForbiddenModelForKey(model.to_string()));
        }
        Ok(())
    }
}
