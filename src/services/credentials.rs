//! Credential rotation across a backend's credential list.

use crate::core::config::Credentials;
use crate::core::rate_limiter::LimitSpec;
use crate::services::load_balancer::{Selector, Strategy};
use crate::services::model_index::BackendDescriptor;

/// The credential set picked for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialChoice {
    pub credentials: Credentials,
    /// `{service_id}_credentials_{index}` when drawn from a list; `None` for
    /// the single credential set, whose limiter is keyed by the service ID.
    pub identity: Option<String>,
}

impl CredentialChoice {
    /// Key for the admission limiter governing this choice.
    pub fn limiter_key<'a>(&'a self, backend: &'a BackendDescriptor) -> &'a str {
        self.identity.as_deref().unwrap_or(&backend.service_id)
    }

    /// Limit embedded in the credential set, if any.
    pub fn limit_spec(&self) -> Option<LimitSpec> {
        LimitSpec::from_credentials(&self.credentials)
    }

    /// The `api_key` entry, if present and a string.
    pub fn api_key(&self) -> Option<&str> {
        self.credentials.get("api_key").and_then(|v| v.as_str())
    }
}

/// Pick a credential set for `backend`.
///
/// A non-empty `credential_list` is rotated with `strategy`, keyed per
/// backend; otherwise the single `credentials` map is used.
pub fn choose_credentials(
    selector: &Selector,
    strategy: Strategy,
    backend: &BackendDescriptor,
) -> CredentialChoice {
    if backend.credential_list.is_empty() {
        return CredentialChoice {
            credentials: backend.credentials.clone(),
            identity: None,
        };
    }

    let key = format!("{}credentials", backend.service_id);
    let index = selector.select(strategy, &key, backend.credential_list.len());
    tracing::debug!(
        service = %backend.service_name,
        credential_index = index,
        "Selected credentials"
    );

    CredentialChoice {
        credentials: backend.credential_list[index].clone(),
        identity: Some(format!("{}_credentials_{}", backend.service_id, index)),
    }
}
