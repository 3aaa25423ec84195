//! HTTP surface: health, breaker metrics, admin API and the dispatcher
//! fallback, wrapped in the shared middleware stack.

use std::any::Any;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::admin::{self, AdminState};
use crate::auth::{AuthLayer, AuthRegistry};
use crate::dispatcher::{self, Dispatcher};
use crate::error::GatewayError;
use crate::proxy::X_REQUEST_ID;
use crate::response::{ok, REQUEST_ID};

/// Assemble the gateway router. Admin endpoints are mounted when `admin` is set.
pub fn router(dispatcher: Arc<Dispatcher>, auth: AuthRegistry, admin: Option<AdminState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/gateway/hystrix/metrics", get(all_metrics))
        .route("/gateway/hystrix/metrics/{service}", get(service_metrics))
        .fallback(dispatcher::handle)
        .with_state(dispatcher);
    if let Some(admin) = admin {
        app = app.merge(admin::router(admin));
    }
    app.layer(AuthLayer::new(auth))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve `app` on `listener` until `shutdown` fires, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Liveness plus the discovery status of every routed service.
async fn health(State(dispatcher): State<Arc<Dispatcher>>) -> Response {
    let services = dispatcher.routes().snapshot().services();
    let checks = services.into_iter().map(|service| {
        let discovery = dispatcher.discovery().clone();
        async move {
            let status = match discovery.resolve(&service).await {
                Ok(_) => "up",
                Err(_) => "down",
            };
            (service, status)
        }
    });
    let statuses: BTreeMap<String, &str> = futures::future::join_all(checks).await.into_iter().collect();
    Json(json!({
        "status": "ok",
        "service": "api-gateway",
        "timestamp": chrono::Utc::now().timestamp(),
        "services": statuses,
    }))
    .into_response()
}

async fn all_metrics(State(dispatcher): State<Arc<Dispatcher>>) -> Response {
    ok(dispatcher.breakers().snapshot())
}

async fn service_metrics(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(service): Path<String>,
) -> Result<Response, GatewayError> {
    dispatcher
        .breakers()
        .metrics(&service)
        .map(ok)
        .ok_or_else(|| GatewayError::NotFound(format!("circuit breaker {service}")))
}

/// Keep or assign `X-Request-ID`, scope it for the envelope, and echo it back.
async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let header = HeaderValue::from_str(&id).ok();
    if let Some(value) = &header {
        req.headers_mut().insert(X_REQUEST_ID, value.clone());
    }
    let mut resp = REQUEST_ID.scope(id, next.run(req)).await;
    if let Some(value) = header {
        resp.headers_mut().insert(X_REQUEST_ID, value);
    }
    resp
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(target: "mulegate::server", panic = %detail, "request handler panicked");
    GatewayError::Internal("internal server error".to_string()).into_response()
}
