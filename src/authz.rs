//! Path-based authorization.
//!
//! An inbound `(method, path)` is turned into a `(resource, action)` pair and
//! checked against a [`PolicyEngine`] for the caller's subject.
//!
//! Resource and action derivation:
//! - the `/admin` gateway segment is removed first;
//! - when the last segment is a business verb (`approve`, `export`, ...), the
//!   action is that verb and the resource is the remaining segments with
//!   identifier-looking segments dropped, so `/finance/123/pending` and
//!   `/finance/pending` both yield `(/finance, pending)`;
//! - otherwise the resource is the whole path (identifiers kept) and the
//!   action comes from the method: `GET`/`HEAD` read, `POST` create,
//!   `PUT`/`PATCH` update, `DELETE` delete, `OPTIONS` `*`.

pub mod policy;

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use http::Method;
use regex::Regex;
use tracing::{debug, info, warn};

pub use policy::{MemoryPolicyEngine, PolicyEngine, PolicyError, PolicySet};

use crate::auth::Identity;

/// Segment removed from every path before parsing.
pub const ADMIN_SEGMENT: &str = "/admin";

/// Trailing segments treated as actions rather than resources.
///
/// Existing policies are written against these names; extend through
/// configuration rather than editing the list.
pub const BUSINESS_VERBS: &[&str] = &[
    // finance
    "pending", "verify", "settle", "reconcile", "refund",
    // approval
    "approve", "reject", "audit", "submit", "withdraw",
    // data
    "export", "import", "sync", "refresh", "calculate", "generate",
    // lifecycle
    "publish", "cancel", "close", "reopen", "archive", "restore",
    // access
    "assign", "transfer", "lock", "unlock", "enable", "disable",
    // misc
    "copy", "move", "merge", "split", "convert", "validate", "notify", "remind", "share",
    "favorite", "star", "pin", "unpin", "reset", "retry", "rollback", "upgrade", "downgrade",
];

/// Role that bypasses policy when held without a tenant.
pub const ROLE_SUPER: &str = "super";
/// Role that bypasses policy inside its own tenant.
pub const ROLE_TENANT_ADMIN: &str = "tenant_admin";

fn id_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^[\da-fA-F]{24}$",
            r"^[0-9]+$",
            r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Object id, number or UUID.
pub fn is_identifier(segment: &str) -> bool {
    id_patterns().iter().any(|re| re.is_match(segment))
}

/// CRUD action for a method.
pub fn action_for_method(method: &Method) -> &'static str {
    match *method {
        Method::GET | Method::HEAD => "read",
        Method::POST => "create",
        Method::PUT | Method::PATCH => "update",
        Method::DELETE => "delete",
        Method::OPTIONS => "*",
        _ => "read",
    }
}

/// Result of parsing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAction {
    pub resource: String,
    pub action: String,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Request may proceed.
    Allowed,
    /// No identity to evaluate.
    Unauthenticated,
    /// Identity evaluated and refused.
    Denied { resource: String, action: String },
    /// The engine failed; treated as a refusal.
    EngineUnavailable(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Maps requests to `(resource, action)` and checks them against a policy engine.
#[derive(Debug, Clone)]
pub struct AuthorizationResolver {
    engine: Arc<dyn PolicyEngine>,
    verbs: BTreeSet<String>,
}

impl AuthorizationResolver {
    pub fn new(engine: Arc<dyn PolicyEngine>) -> Self {
        Self { engine, verbs: BUSINESS_VERBS.iter().map(|v| v.to_string()).collect() }
    }

    /// Recognize additional business verbs.
    pub fn with_extra_verbs(mut self, verbs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for verb in verbs {
            let verb: String = verb.into();
            if !verb.is_empty() {
                self.verbs.insert(verb);
            }
        }
        self
    }

    pub fn is_business_verb(&self, segment: &str) -> bool {
        self.verbs.contains(segment)
    }

    /// Derive the `(resource, action)` pair for a request.
    pub fn resolve(&self, method: &Method, path: &str) -> ResourceAction {
        let path = strip_admin(path);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        if let Some((last, rest)) = segments.split_last() {
            if self.is_business_verb(last) {
                let kept: Vec<&str> =
                    rest.iter().copied().filter(|s| !is_identifier(s)).collect();
                let resource = format!("/{}", kept.join("/"));
                debug!(target: "mulegate::authz", %method, path, resource = %resource, action = %last, "business action");
                return ResourceAction { resource, action: (*last).to_string() };
            }
        }

        let resource = if path.is_empty() { "/".to_string() } else { path.to_string() };
        ResourceAction { resource, action: action_for_method(method).to_string() }
    }

    /// Decide whether `identity` may perform `method path`.
    ///
    /// Preflight `OPTIONS` always passes. Engine errors produce
    /// [`Decision::EngineUnavailable`], never an allow.
    pub async fn check(&self, identity: Option<&Identity>, method: &Method, path: &str) -> Decision {
        if *method == Method::OPTIONS {
            return Decision::Allowed;
        }
        let Some(identity) = identity else {
            return Decision::Unauthenticated;
        };

        if identity.tenant_id.is_empty() && identity.has_role(ROLE_SUPER) {
            info!(target: "mulegate::audit", user = %identity.user_id, %method, path, "system super access");
            return Decision::Allowed;
        }
        if !identity.tenant_id.is_empty() && identity.has_role(ROLE_TENANT_ADMIN) {
            info!(target: "mulegate::audit", tenant = %identity.tenant_id, user = %identity.user_id, %method, path, "tenant admin access");
            return Decision::Allowed;
        }

        let ResourceAction { resource, action } = self.resolve(method, path);
        let subject = identity.subject();
        match self.engine.enforce(&subject, &resource, &action).await {
            Ok(true) => {
                info!(target: "mulegate::audit", subject = %subject, resource = %resource, action = %action, "permission granted");
                Decision::Allowed
            }
            Ok(false) => {
                info!(target: "mulegate::audit", subject = %subject, resource = %resource, action = %action, "permission denied");
                Decision::Denied { resource, action }
            }
            Err(e) => {
                warn!(target: "mulegate::audit", subject = %subject, resource = %resource, action = %action, error = %e, "permission check failed");
                Decision::EngineUnavailable(e.to_string())
            }
        }
    }
}

/// Drop a leading `/admin` segment.
fn strip_admin(path: &str) -> &str {
    match path.strip_prefix(ADMIN_SEGMENT) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => path,
    }
}
