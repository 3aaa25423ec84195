//! Per-request pipeline: route, authenticate, authorize, admit, then proxy
//! under the service's circuit breaker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use http::Method;
use tracing::{debug, warn};

use crate::auth::Authentication;
use crate::authz::{AuthorizationResolver, Decision};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::discovery::{DiscoveryError, ServiceDiscovery};
use crate::error::{CallError, GatewayError};
use crate::proxy::{ForwardContext, ProxyError, UpstreamProxy, X_REQUEST_ID};
use crate::rate_limit::{client_identity, RateLimiter};
use crate::response::current_request_id;
use crate::routing::{RouteEntry, Routes};

/// Why the guarded upstream call failed.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("upstream request failed: {0}")]
    Transport(#[from] ProxyError),
}

/// Request orchestrator. All state is injected and shared with the reloader
/// and admin API.
#[derive(Debug)]
pub struct Dispatcher {
    routes: Routes,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: RateLimiter,
    authz: AuthorizationResolver,
    discovery: Arc<dyn ServiceDiscovery>,
    proxy: UpstreamProxy,
    rate_limit_wait: Duration,
}

impl Dispatcher {
    pub fn new(
        routes: Routes,
        breakers: Arc<CircuitBreakerRegistry>,
        limiter: RateLimiter,
        authz: AuthorizationResolver,
        discovery: Arc<dyn ServiceDiscovery>,
        proxy: UpstreamProxy,
    ) -> Self {
        Self {
            routes,
            breakers,
            limiter,
            authz,
            discovery,
            proxy,
            rate_limit_wait: Duration::from_secs(1),
        }
    }

    /// How long a request may wait for a rate-limit token.
    pub fn with_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn discovery(&self) -> &Arc<dyn ServiceDiscovery> {
        &self.discovery
    }

    /// Run the full pipeline for one request.
    ///
    /// Errors before the breaker stage are returned as [`GatewayError`]; breaker
    /// fallbacks are already rendered into the response.
    pub async fn dispatch(&self, req: Request) -> Result<Response, GatewayError> {
        let path = req.uri().path().to_string();
        let route: RouteEntry = match self.routes.snapshot().resolve(&path) {
            Some(route) => route.clone(),
            None => {
                debug!(target: "mulegate::dispatcher", path = %path, "no route");
                return Err(GatewayError::Unrouted { path });
            }
        };

        let authentication = req
            .extensions()
            .get::<Authentication>()
            .cloned()
            .unwrap_or(Authentication::Anonymous);

        if route.require_auth && req.method() != Method::OPTIONS {
            self.authorize(&route, &authentication, req.method(), &path).await?;
        }

        let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
        let client = client_identity(req.headers(), peer);
        if !self.limiter.admit(&client, self.rate_limit_wait).await {
            return Err(GatewayError::RateLimited { retry_after: self.limiter.retry_after() });
        }

        let mut target = route.forward_path(&path);
        if let Some(query) = req.uri().query() {
            target.push('?');
            target.push_str(query);
        }
        let request_id = current_request_id().or_else(|| {
            req.headers().get(X_REQUEST_ID).and_then(|v| v.to_str().ok()).map(str::to_string)
        });
        let ctx = ForwardContext {
            client_ip: peer.map(|p| p.ip().to_string()).unwrap_or_default(),
            request_id,
            identity: authentication.identity().cloned(),
        };

        Ok(self.forward(&route.service_name, &target, req, &ctx).await)
    }

    async fn authorize(
        &self,
        route: &RouteEntry,
        authentication: &Authentication,
        method: &Method,
        path: &str,
    ) -> Result<(), GatewayError> {
        let identity = authentication
            .require()
            .map_err(|e| GatewayError::Unauthenticated(e.to_string()))?;
        if !route.permits_roles(identity.roles.iter().map(String::as_str)) {
            return Err(GatewayError::Unauthorized(format!(
                "route {} requires one of the roles {:?}",
                route.match_prefix(),
                route.require_role
            )));
        }
        match self.authz.check(Some(identity), method, path).await {
            Decision::Allowed => Ok(()),
            Decision::Unauthenticated => {
                Err(GatewayError::Unauthenticated("missing credentials".to_string()))
            }
            Decision::Denied { resource, action } => Err(GatewayError::Unauthorized(format!(
                "no permission for {action} on {resource}"
            ))),
            Decision::EngineUnavailable(reason) => {
                Err(GatewayError::PolicyEngineUnavailable(reason))
            }
        }
    }

    /// Discovery plus proxying under the breaker for `service`. A 5xx answer
    /// is returned as-is but counted as a failure.
    async fn forward(
        &self,
        service: &str,
        target: &str,
        req: Request<Body>,
        ctx: &ForwardContext,
    ) -> Response {
        let breaker = self.breakers.breaker(service);
        breaker
            .execute_classified(
                || async move {
                    let base = self.discovery.resolve(service).await?;
                    let resp = self.proxy.forward(&base, target, req, ctx).await?;
                    Ok::<_, UpstreamError>(resp)
                },
                |resp: &Response| resp.status().is_server_error(),
                |err| fallback(service, err).into_response(),
            )
            .await
    }
}

fn fallback(service: &str, err: CallError<UpstreamError>) -> GatewayError {
    warn!(target: "mulegate::dispatcher", service = %service, error = %err, "upstream call failed; serving fallback");
    match err {
        CallError::Inner(UpstreamError::Discovery(e)) => GatewayError::DiscoveryFailure {
            service: service.to_string(),
            reason: e.to_string(),
        },
        other => GatewayError::CircuitOpen { service: service.to_string(), cause: other.to_string() },
    }
}

/// Axum fallback handler wrapping [`Dispatcher::dispatch`].
pub async fn handle(State(dispatcher): State<Arc<Dispatcher>>, req: Request) -> Response {
    match dispatcher.dispatch(req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::authz::{MemoryPolicyEngine, PolicySet};
    use crate::circuit_breaker::CircuitState;
    use crate::discovery::StaticDiscovery;
    use crate::rate_limit::RateLimitConfig;
    use crate::routing::RouteTable;
    use http::StatusCode;

    fn identity(roles: &[&str]) -> Identity {
        Identity {
            user_id: "7".into(),
            username: "alice".into(),
            tenant_id: "t1".into(),
            tenant_code: "acme".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn dispatcher(rps: u32) -> Dispatcher {
        let routes = Routes::new(RouteTable::new([
            RouteEntry::new("/basic", "basic").with_gateway_prefix("/admin").with_auth(["user"]),
            RouteEntry::new("/public", "public"),
        ]));
        let policies =
            PolicySet::parse("test", "p, tenant:t1:user:7, /basic/colors, read").unwrap();
        let authz =
            AuthorizationResolver::new(Arc::new(MemoryPolicyEngine::with_policies(policies)));
        Dispatcher::new(
            routes,
            Arc::new(CircuitBreakerRegistry::default()),
            RateLimiter::new(RateLimitConfig::per_second(rps)),
            authz,
            Arc::new(StaticDiscovery::new()),
            UpstreamProxy::new(Duration::from_secs(1)).unwrap(),
        )
        .with_rate_limit_wait(Duration::ZERO)
    }

    fn request(method: Method, uri: &str, auth: Option<Identity>) -> Request {
        let mut req = http::Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        if let Some(id) = auth {
            req.extensions_mut().insert(Authentication::Authenticated(id));
        }
        req
    }

    fn status(result: Result<Response, GatewayError>) -> StatusCode {
        match result {
            Ok(resp) => resp.status(),
            Err(e) => e.status(),
        }
    }

    #[tokio::test]
    async fn unrouted_paths_are_404() {
        let d = dispatcher(100);
        let res = d.dispatch(request(Method::GET, "/nowhere", None)).await;
        assert!(matches!(res, Err(GatewayError::Unrouted { .. })));
    }

    #[tokio::test]
    async fn protected_route_needs_identity_role_and_permission() {
        let d = dispatcher(100);
        let anonymous = d.dispatch(request(Method::GET, "/admin/basic/colors", None)).await;
        assert_eq!(status(anonymous), StatusCode::UNAUTHORIZED);

        let wrong_role = d
            .dispatch(request(Method::GET, "/admin/basic/colors", Some(identity(&["guest"]))))
            .await;
        assert_eq!(status(wrong_role), StatusCode::FORBIDDEN);

        let denied = d
            .dispatch(request(Method::DELETE, "/admin/basic/colors", Some(identity(&["user"]))))
            .await;
        assert_eq!(status(denied), StatusCode::FORBIDDEN);

        // Permitted, but the service has no instance: discovery fallback.
        let permitted = d
            .dispatch(request(Method::GET, "/admin/basic/colors", Some(identity(&["user"]))))
            .await;
        assert_eq!(status(permitted), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn discovery_failures_count_against_the_breaker() {
        let d = dispatcher(1_000);
        for _ in 0..20 {
            let resp = d.dispatch(request(Method::GET, "/public/x", None)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        assert_eq!(d.breakers().status("public"), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn rate_limit_applies_per_client() {
        let d = dispatcher(1);
        let first = d.dispatch(request(Method::GET, "/public/x", None)).await;
        assert_ne!(status(first), StatusCode::TOO_MANY_REQUESTS);
        let second = d.dispatch(request(Method::GET, "/public/x", None)).await;
        assert_eq!(status(second), StatusCode::TOO_MANY_REQUESTS);
    }
}
