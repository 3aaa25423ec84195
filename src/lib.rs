#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # mulegate
//!
//! A dynamic API gateway: one ingress process that routes requests to backend
//! services by URL prefix, guards every service with a circuit breaker, limits
//! each client with a token bucket and checks path-based permissions, while
//! reloading its routing, breaker and policy configuration from a KV store.
//!
//! ## Request pipeline
//!
//! 1. [`auth::AuthLayer`] verifies credentials and records an [`auth::Authentication`].
//! 2. [`routing::RouteTable::resolve`] picks the most specific route.
//! 3. Routes requiring auth check roles and ask the [`authz::AuthorizationResolver`].
//! 4. [`rate_limit::RateLimiter::admit`] takes a token for the client.
//! 5. [`circuit_breaker_registry::CircuitBreakerRegistry`] wraps discovery plus
//!    the streaming [`proxy::UpstreamProxy`] call; failures resolve through a
//!    503 fallback.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mulegate::{
//!     AuthRegistry, AuthorizationResolver, CircuitBreakerRegistry, Dispatcher, JwtAuth,
//!     MemoryPolicyEngine, RateLimitConfig, RateLimiter, RouteEntry, RouteTable, Routes,
//!     StaticDiscovery, UpstreamProxy,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let routes = Routes::new(RouteTable::new([RouteEntry::new("/basic", "basic")]));
//! let dispatcher = Dispatcher::new(
//!     routes,
//!     Arc::new(CircuitBreakerRegistry::default()),
//!     RateLimiter::new(RateLimitConfig::per_second(100)),
//!     AuthorizationResolver::new(Arc::new(MemoryPolicyEngine::new())),
//!     Arc::new(StaticDiscovery::new().with_instance("basic", "http://127.0.0.1:8001")),
//!     UpstreamProxy::new(Duration::from_secs(30))?,
//! );
//! let auth = AuthRegistry::new().with(JwtAuth::new(b"secret", "mule-cloud"));
//! let app = mulegate::server::router(Arc::new(dispatcher), auth, None);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! mulegate::server::serve(listener, app, Default::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod adaptive;
pub mod admin;
pub mod auth;
pub mod authz;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod config_store;
pub mod consul;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod proxy;
pub mod rate_limit;
pub mod reload;
pub mod response;
pub mod routing;
pub mod server;
pub mod timeout;

// Re-exports
pub use adaptive::DynamicConfig;
pub use admin::AdminState;
pub use auth::{
    AuthError, AuthLayer, AuthProvider, AuthRegistry, Authentication, ForwardedHeadersAuth,
    Identity, JwtAuth,
};
pub use authz::{
    AuthorizationResolver, Decision, MemoryPolicyEngine, PolicyEngine, PolicyError, PolicySet,
    ResourceAction,
};
pub use circuit_breaker::{
    BreakerConfig, BreakerConfigError, BreakerMetrics, CircuitBreaker, CircuitState,
};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::GatewayConfig;
pub use config_store::{ConfigStore, ConfigStoreError, InMemoryConfigStore, KvPair};
pub use consul::ConsulClient;
pub use discovery::{DiscoveryError, ServiceDiscovery, StaticDiscovery};
pub use dispatcher::Dispatcher;
pub use error::{CallError, GatewayError};
pub use proxy::{ProxyError, UpstreamProxy};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use reload::{ConfigReloader, ReloadReport};
pub use response::Envelope;
pub use routing::{RouteEntry, RouteTable, Routes};
