//! Routing engine for the gateway.
//!
//! This module contains the service layer: backend indexing, load balancing,
//! credential rotation, proxy policy, access control and the resolution
//! pipeline that ties them together.

pub mod access;
pub mod credentials;
pub mod load_balancer;
pub mod model_index;
pub mod proxy_policy;
pub mod router;

// Re-export commonly used types
pub use access::AccessControl;
pub use credentials::{choose_credentials, CredentialChoice};
pub use load_balancer::{Selector, Strategy};
pub use model_index::{BackendDescriptor, ModelIndex, ALL_MODELS, RANDOM_MODEL};
pub use proxy_policy::{ProxyKind, ProxyResolver, ProxyStrategy, ProxyTransport};
pub use router::{
    ModelRouter, MultiContentPolicy, ResolvedRequest, ResolvedRoute, RouteRequest, RoutingTable,
};
