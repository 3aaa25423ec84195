//! Runtime administration of routes and breaker parameters.
//!
//! Every write goes to the config store first and is applied to the live state
//! only when the store accepted it, so the next reload agrees with what the
//! admin call reported.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::auth::{Authentication, Identity};
use crate::authz::ROLE_SUPER;
use crate::circuit_breaker::BreakerConfig;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::config_store::{breaker_key, route_key, ConfigStore};
use crate::error::GatewayError;
use crate::reload::ConfigReloader;
use crate::response::ok;
use crate::routing::{RouteEntry, Routes};

/// Shared handles the admin endpoints operate on.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub store: Arc<dyn ConfigStore>,
    pub routes: Routes,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub reloader: Arc<ConfigReloader>,
}

/// Extractor admitting only a system super administrator (no tenant).
#[derive(Debug, Clone)]
pub struct SuperAdmin(pub Identity);

impl<S: Send + Sync> FromRequestParts<S> for SuperAdmin {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let authentication =
            parts.extensions.get::<Authentication>().cloned().unwrap_or(Authentication::Anonymous);
        let identity = authentication
            .require()
            .map_err(|e| GatewayError::Unauthenticated(e.to_string()))?;
        if !identity.tenant_id.is_empty() || !identity.has_role(ROLE_SUPER) {
            return Err(GatewayError::Unauthorized(
                "system super administrator required".to_string(),
            ));
        }
        Ok(Self(identity.clone()))
    }
}

/// Breaker parameters together with the service they apply to.
#[derive(Debug, Deserialize)]
struct NamedBreakerConfig {
    service: String,
    #[serde(flatten)]
    config: BreakerConfig,
}

/// Admin endpoints under `/gateway/admin`.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/gateway/admin/routes", get(list_routes).post(create_route))
        .route(
            "/gateway/admin/routes/{*prefix}",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route("/gateway/admin/hystrix", get(list_breakers).post(create_breaker))
        .route(
            "/gateway/admin/hystrix/{service}",
            get(get_breaker).put(update_breaker).delete(delete_breaker),
        )
        .route("/gateway/admin/reload", post(reload))
        .with_state(state)
}

fn bad_json(rejection: JsonRejection) -> GatewayError {
    GatewayError::BadRequest(rejection.body_text())
}

fn canonical_prefix(prefix: &str) -> Result<String, GatewayError> {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(GatewayError::BadRequest("route prefix must not be empty".to_string()));
    }
    Ok(format!("/{trimmed}"))
}

impl AdminState {
    async fn save_route(&self, mut entry: RouteEntry) -> Result<RouteEntry, GatewayError> {
        entry.prefix = canonical_prefix(&entry.prefix)?;
        if entry.service_name.trim().is_empty() {
            return Err(GatewayError::BadRequest("service_name must not be empty".to_string()));
        }
        let value =
            serde_json::to_vec(&entry).map_err(|e| GatewayError::Internal(e.to_string()))?;
        self.store.put(&route_key(&entry.prefix), value).await?;
        self.routes.upsert(entry.clone());
        info!(target: "mulegate::admin", prefix = %entry.prefix, service = %entry.service_name, "route saved");
        Ok(self.routes.snapshot().get(&entry.prefix).cloned().unwrap_or(entry))
    }

    async fn save_breaker(
        &self,
        service: &str,
        config: BreakerConfig,
    ) -> Result<BreakerConfig, GatewayError> {
        if service.trim().is_empty() {
            return Err(GatewayError::BadRequest("service must not be empty".to_string()));
        }
        config.validate().map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        let value =
            serde_json::to_vec(&config).map_err(|e| GatewayError::Internal(e.to_string()))?;
        self.store.put(&breaker_key(service), value).await?;
        self.breakers
            .configure(service, config)
            .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        info!(target: "mulegate::admin", service = %service, "breaker config saved");
        Ok(config)
    }
}

async fn list_routes(_: SuperAdmin, State(state): State<AdminState>) -> Response {
    ok(state.routes.snapshot().entries().cloned().collect::<Vec<_>>())
}

async fn get_route(
    _: SuperAdmin,
    State(state): State<AdminState>,
    Path(prefix): Path<String>,
) -> Result<Response, GatewayError> {
    let prefix = canonical_prefix(&prefix)?;
    match state.routes.snapshot().get(&prefix) {
        Some(entry) => Ok(ok(entry)),
        None => Err(GatewayError::NotFound(format!("route {prefix}"))),
    }
}

async fn create_route(
    _: SuperAdmin,
    State(state): State<AdminState>,
    body: Result<Json<RouteEntry>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(entry) = body.map_err(bad_json)?;
    Ok(ok(state.save_route(entry).await?))
}

async fn update_route(
    _: SuperAdmin,
    State(state): State<AdminState>,
    Path(prefix): Path<String>,
    body: Result<Json<RouteEntry>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(mut entry) = body.map_err(bad_json)?;
    let prefix = canonical_prefix(&prefix)?;
    if state.routes.snapshot().get(&prefix).is_none() {
        return Err(GatewayError::NotFound(format!("route {prefix}")));
    }
    entry.prefix = prefix;
    Ok(ok(state.save_route(entry).await?))
}

async fn delete_route(
    _: SuperAdmin,
    State(state): State<AdminState>,
    Path(prefix): Path<String>,
) -> Result<Response, GatewayError> {
    let prefix = canonical_prefix(&prefix)?;
    if state.routes.snapshot().get(&prefix).is_none() {
        return Err(GatewayError::NotFound(format!("route {prefix}")));
    }
    state.store.delete(&route_key(&prefix)).await?;
    state.routes.remove(&prefix);
    info!(target: "mulegate::admin", prefix = %prefix, "route deleted");
    Ok(ok(prefix))
}

async fn list_breakers(_: SuperAdmin, State(state): State<AdminState>) -> Response {
    ok(state.breakers.configured())
}

async fn get_breaker(
    _: SuperAdmin,
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Result<Response, GatewayError> {
    match state.breakers.configured().get(&service) {
        Some(config) => Ok(ok(config)),
        None => Err(GatewayError::NotFound(format!("breaker config for {service}"))),
    }
}

async fn create_breaker(
    _: SuperAdmin,
    State(state): State<AdminState>,
    body: Result<Json<NamedBreakerConfig>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(named) = body.map_err(bad_json)?;
    let config = state.save_breaker(&named.service, named.config).await?;
    Ok(ok(config))
}

async fn update_breaker(
    _: SuperAdmin,
    State(state): State<AdminState>,
    Path(service): Path<String>,
    body: Result<Json<BreakerConfig>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(config) = body.map_err(bad_json)?;
    Ok(ok(state.save_breaker(&service, config).await?))
}

async fn delete_breaker(
    _: SuperAdmin,
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Result<Response, GatewayError> {
    if !state.breakers.configured().contains_key(&service) {
        return Err(GatewayError::NotFound(format!("breaker config for {service}")));
    }
    state.store.delete(&breaker_key(&service)).await?;
    state.breakers.unconfigure(&service);
    info!(target: "mulegate::admin", service = %service, "breaker config deleted");
    Ok(ok(service))
}

async fn reload(_: SuperAdmin, State(state): State<AdminState>) -> Result<Response, GatewayError> {
    let report = state.reloader.reload().await?;
    Ok(ok(report))
}
