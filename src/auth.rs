//! Authentication: turning request credentials into an [`Identity`].
//!
//! Providers are tried in registration order by an [`AuthRegistry`]. The
//! [`AuthLayer`] runs the registry once per request and stores the resulting
//! [`Authentication`] in the request extensions; whether a route actually
//! requires an identity is decided later by the dispatcher.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::{header, HeaderMap, Request};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

/// Forwarded identity headers, set by the gateway on proxied requests.
pub const X_USER_ID: &str = "x-user-id";
pub const X_USERNAME: &str = "x-username";
pub const X_TENANT_ID: &str = "x-tenant-id";
pub const X_TENANT_CODE: &str = "x-tenant-code";
pub const X_ROLES: &str = "x-roles";

/// A verified caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    /// Empty for system-level identities.
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub tenant_code: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Policy subject: `tenant:<tid>:user:<uid>` or `user:<uid>` for system users.
    pub fn subject(&self) -> String {
        if self.tenant_id.is_empty() {
            format!("user:{}", self.user_id)
        } else {
            format!("tenant:{}:user:{}", self.tenant_id, self.user_id)
        }
    }
}

/// Why credentials were refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("malformed authorization header, expected 'Bearer <token>'")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Result of running the providers for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    /// No provider found credentials.
    Anonymous,
    Authenticated(Identity),
    /// Credentials were present but rejected.
    Rejected(AuthError),
}

impl Authentication {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated(id) => Some(id),
            _ => None,
        }
    }

    /// Identity, or the reason there is none.
    pub fn require(&self) -> Result<&Identity, AuthError> {
        match self {
            Self::Authenticated(id) => Ok(id),
            Self::Anonymous => Err(AuthError::Missing),
            Self::Rejected(e) => Err(e.clone()),
        }
    }
}

/// Pluggable credential verifier.
pub trait AuthProvider: Send + Sync + fmt::Debug {
    /// Unique name of this provider.
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the request carries no credentials this provider understands.
    fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Identity>, AuthError>;
}

/// Registry that tries providers in order; the first identity wins.
#[derive(Debug, Clone, Default)]
pub struct AuthRegistry {
    providers: Vec<Arc<dyn AuthProvider>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an auth provider.
    pub fn register(&mut self, provider: Arc<dyn AuthProvider>) {
        self.providers.push(provider);
    }

    pub fn with(mut self, provider: impl AuthProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    /// Run providers until one yields an identity. A rejection is reported only
    /// when no later provider authenticates the request.
    pub fn authenticate(&self, headers: &HeaderMap) -> Authentication {
        let mut last_err = None;
        for p in &self.providers {
            match p.authenticate(headers) {
                Ok(Some(identity)) => {
                    debug!(target: "mulegate::auth", provider = p.name(), user = %identity.user_id, "authenticated");
                    return Authentication::Authenticated(identity);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(target: "mulegate::auth", provider = p.name(), error = %e, "credentials rejected");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Authentication::Rejected(e),
            None => Authentication::Anonymous,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    user_id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    tenant_id: String,
    #[serde(default)]
    tenant_code: String,
    #[serde(default)]
    roles: Vec<String>,
    exp: u64,
    #[serde(default)]
    iat: u64,
    #[serde(default)]
    iss: String,
}

/// HS256 bearer tokens carrying `user_id`, `username`, `tenant_id`,
/// `tenant_code` and `roles` claims.
#[derive(Clone)]
pub struct JwtAuth {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
    issuer: String,
}

impl fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuth").field("issuer", &self.issuer).finish_non_exhaustive()
    }
}

impl JwtAuth {
    pub fn new(secret: &[u8], issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer.as_str()]);
        validation.leeway = 0;
        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation,
            issuer,
        }
    }

    /// Verify a raw token.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;
        let c = data.claims;
        Ok(Identity {
            user_id: c.user_id,
            username: c.username,
            tenant_id: c.tenant_id,
            tenant_code: c.tenant_code,
            roles: c.roles,
        })
    }

    /// Sign a token for `identity` valid for `ttl`.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String, AuthError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let claims = Claims {
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            tenant_id: identity.tenant_id.clone(),
            tenant_code: identity.tenant_code.clone(),
            roles: identity.roles.clone(),
            exp: now + ttl.as_secs(),
            iat: now,
            iss: self.issuer.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Invalid(e.to_string()))
    }
}

impl AuthProvider for JwtAuth {
    fn name(&self) -> &'static str {
        "jwt"
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Identity>, AuthError> {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return Ok(None);
        };
        let value = value.to_str().map_err(|_| AuthError::Malformed)?;
        match value.split_once(' ') {
            Some(("Bearer", token)) if !token.is_empty() => self.verify(token).map(Some),
            _ => Err(AuthError::Malformed),
        }
    }
}

/// Trusts `X-User-ID`/`X-Username` (plus tenant and role headers) set by an
/// upstream gateway hop. Only register this behind a trusted proxy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedHeadersAuth;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

impl AuthProvider for ForwardedHeadersAuth {
    fn name(&self) -> &'static str {
        "forwarded-headers"
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Identity>, AuthError> {
        let user_id = header_str(headers, X_USER_ID);
        let username = header_str(headers, X_USERNAME);
        if user_id.is_empty() && username.is_empty() {
            return Ok(None);
        }
        let roles = header_str(headers, X_ROLES)
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Some(Identity {
            user_id: user_id.to_string(),
            username: username.to_string(),
            tenant_id: header_str(headers, X_TENANT_ID).to_string(),
            tenant_code: header_str(headers, X_TENANT_CODE).to_string(),
            roles,
        }))
    }
}

/// Layer that authenticates every request and records the outcome in its extensions.
#[derive(Clone, Debug)]
pub struct AuthLayer {
    registry: Arc<AuthRegistry>,
}

impl AuthLayer {
    pub fn new(registry: AuthRegistry) -> Self {
        Self { registry: Arc::new(registry) }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AuthService { inner: service, registry: self.registry.clone() }
    }
}

/// Middleware service produced by [`AuthLayer`].
#[derive(Clone, Debug)]
pub struct AuthService<S> {
    inner: S,
    registry: Arc<AuthRegistry>,
}

impl<S, B> Service<Request<B>> for AuthService<S>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let outcome = self.registry.authenticate(req.headers());
        req.extensions_mut().insert(outcome);
        // Drive the clone that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(inner.call(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::convert::Infallible;
    use tower::ServiceExt;

    const SECRET: &[u8] = b"test-secret";

    fn alice() -> Identity {
        Identity {
            user_id: "u1".into(),
            username: "alice".into(),
            tenant_id: "t1".into(),
            tenant_code: "acme".into(),
            roles: vec!["user".into(), "finance".into()],
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        h
    }

    #[test]
    fn jwt_round_trip_and_subject() {
        let jwt = JwtAuth::new(SECRET, "mule-cloud");
        let token = jwt.issue(&alice(), Duration::from_secs(60)).unwrap();
        let id = jwt.authenticate(&bearer(&token)).unwrap().unwrap();
        assert_eq!(id, alice());
        assert_eq!(id.subject(), "tenant:t1:user:u1");
        assert_eq!(Identity { tenant_id: String::new(), ..alice() }.subject(), "user:u1");
    }

    #[test]
    fn jwt_rejects_wrong_secret_issuer_and_format() {
        let token = JwtAuth::new(b"other", "mule-cloud").issue(&alice(), Duration::from_secs(60)).unwrap();
        let jwt = JwtAuth::new(SECRET, "mule-cloud");
        assert!(matches!(jwt.authenticate(&bearer(&token)), Err(AuthError::Invalid(_))));

        let foreign = JwtAuth::new(SECRET, "someone-else").issue(&alice(), Duration::from_secs(60)).unwrap();
        assert!(matches!(jwt.authenticate(&bearer(&foreign)), Err(AuthError::Invalid(_))));

        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Token abc"));
        assert_eq!(jwt.authenticate(&h), Err(AuthError::Malformed));
        assert_eq!(jwt.authenticate(&HeaderMap::new()), Ok(None));
    }

    #[test]
    fn jwt_reports_expiry() {
        let jwt = JwtAuth::new(SECRET, "mule-cloud");
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let claims = Claims {
            user_id: "u1".into(),
            username: String::new(),
            tenant_id: String::new(),
            tenant_code: String::new(),
            roles: vec![],
            exp: now - 120,
            iat: now - 240,
            iss: "mule-cloud".into(),
        };
        let token = jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap();
        assert_eq!(jwt.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn forwarded_headers_are_trusted_when_registered() {
        let mut h = HeaderMap::new();
        h.insert(X_USER_ID, HeaderValue::from_static("42"));
        h.insert(X_TENANT_ID, HeaderValue::from_static("t9"));
        h.insert(X_ROLES, HeaderValue::from_static("user, tenant_admin"));
        let id = ForwardedHeadersAuth.authenticate(&h).unwrap().unwrap();
        assert_eq!(id.user_id, "42");
        assert_eq!(id.roles, vec!["user", "tenant_admin"]);
        assert!(ForwardedHeadersAuth.authenticate(&HeaderMap::new()).unwrap().is_none());
    }

    #[test]
    fn registry_prefers_first_identity_and_reports_rejection() {
        let registry = AuthRegistry::new()
            .with(ForwardedHeadersAuth)
            .with(JwtAuth::new(SECRET, "mule-cloud"));

        let mut h = bearer("garbage");
        assert!(matches!(registry.authenticate(&h), Authentication::Rejected(AuthError::Invalid(_))));

        h.insert(X_USER_ID, HeaderValue::from_static("7"));
        let outcome = registry.authenticate(&h);
        assert_eq!(outcome.identity().map(|i| i.user_id.as_str()), Some("7"));

        assert_eq!(registry.authenticate(&HeaderMap::new()), Authentication::Anonymous);
        assert_eq!(Authentication::Anonymous.require(), Err(AuthError::Missing));
    }

    #[tokio::test]
    async fn layer_stores_outcome_in_extensions() {
        let jwt = JwtAuth::new(SECRET, "mule-cloud");
        let token = jwt.issue(&alice(), Duration::from_secs(60)).unwrap();
        let svc = AuthLayer::new(AuthRegistry::new().with(jwt)).layer(tower::service_fn(
            |req: Request<()>| async move {
                Ok::<_, Infallible>(req.extensions().get::<Authentication>().cloned())
            },
        ));

        let req = Request::builder()
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(())
            .unwrap();
        let outcome = svc.clone().oneshot(req).await.unwrap();
        assert_eq!(outcome, Some(Authentication::Authenticated(alice())));

        let anon = svc.oneshot(Request::new(())).await.unwrap();
        assert_eq!(anon, Some(Authentication::Anonymous));
    }
}
