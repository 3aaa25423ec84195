use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower::ServiceExt;

use mulegate::{
    AdminState, AuthRegistry, AuthorizationResolver, CircuitBreakerRegistry, ConfigReloader,
    Dispatcher, Identity, InMemoryConfigStore, JwtAuth, MemoryPolicyEngine, PolicySet,
    RateLimitConfig, RateLimiter, RouteTable, Routes, StaticDiscovery, UpstreamProxy,
};

pub const JWT_SECRET: &[u8] = b"integration-secret";
pub const JWT_ISSUER: &str = "mule-cloud";

/// Backend that echoes what it received as JSON. Paths ending in `/fail`
/// answer 500. Every request bumps the hit counter.
pub async fn spawn_backend() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new().fallback(echo).with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

async fn echo(State(hits): State<Arc<AtomicUsize>>, req: Request) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();
    if parts.uri.path().ends_with("/fail") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "backend exploded").into_response();
    }
    let headers: BTreeMap<String, String> = parts
        .headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    Json(json!({
        "method": parts.method.as_str(),
        "path": parts.uri.path(),
        "query": parts.uri.query(),
        "headers": headers,
        "body_len": bytes.len(),
    }))
    .into_response()
}

pub fn identity(user: &str, tenant: &str, roles: &[&str]) -> Identity {
    Identity {
        user_id: user.to_string(),
        username: format!("user-{user}"),
        tenant_id: tenant.to_string(),
        tenant_code: if tenant.is_empty() { String::new() } else { format!("code-{tenant}") },
        roles: roles.iter().map(|r| r.to_string()).collect(),
    }
}

/// Fully wired gateway over in-memory collaborators.
pub struct TestGateway {
    pub app: Router,
    pub routes: Routes,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub store: InMemoryConfigStore,
    pub reloader: Arc<ConfigReloader>,
    pub policies: MemoryPolicyEngine,
    pub jwt: JwtAuth,
}

pub struct GatewayOptions {
    pub routes: RouteTable,
    pub services: Vec<(&'static str, String)>,
    pub rate: RateLimitConfig,
    pub policies: &'static str,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            routes: RouteTable::default(),
            services: Vec::new(),
            rate: RateLimitConfig::per_second(1_000),
            policies: "",
        }
    }
}

pub fn gateway(options: GatewayOptions) -> TestGateway {
    let store = InMemoryConfigStore::new();
    let routes = Routes::new(options.routes);
    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let policies = MemoryPolicyEngine::with_policies(
        PolicySet::parse("test", options.policies).expect("test policies parse"),
    );
    let reloader = Arc::new(
        ConfigReloader::new(Arc::new(store.clone()), routes.clone(), breakers.clone())
            .with_policies(policies.clone(), Some(options.policies.to_string())),
    );

    let discovery = options
        .services
        .into_iter()
        .fold(StaticDiscovery::new(), |d, (name, url)| d.with_instance(name, url));
    let dispatcher = Dispatcher::new(
        routes.clone(),
        breakers.clone(),
        RateLimiter::new(options.rate),
        AuthorizationResolver::new(Arc::new(policies.clone())),
        Arc::new(discovery),
        UpstreamProxy::new(Duration::from_secs(5)).unwrap(),
    )
    .with_rate_limit_wait(Duration::ZERO);

    let jwt = JwtAuth::new(JWT_SECRET, JWT_ISSUER);
    let auth = AuthRegistry::new().with(jwt.clone());
    let admin = AdminState {
        store: Arc::new(store.clone()),
        routes: routes.clone(),
        breakers: breakers.clone(),
        reloader: reloader.clone(),
    };
    let app = mulegate::server::router(Arc::new(dispatcher), auth, Some(admin));

    TestGateway { app, routes, breakers, store, reloader, policies, jwt }
}

impl TestGateway {
    pub fn bearer(&self, identity: &Identity) -> String {
        format!("Bearer {}", self.jwt.issue(identity, Duration::from_secs(600)).unwrap())
    }

    pub async fn send(&self, req: http::Request<Body>) -> Response {
        self.app.clone().oneshot(req).await.unwrap()
    }

    pub async fn get(&self, uri: &str, identity: Option<&Identity>) -> Response {
        let mut builder = http::Request::get(uri);
        if let Some(id) = identity {
            builder = builder.header("authorization", self.bearer(id));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }
}

pub async fn json_body(resp: Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}
