//! Route table: ingress prefix → backend service and access requirements.
//!
//! The table is immutable once built. Reloads and admin writes build a new
//! table and swap it into [`Routes`] in one step, so a request resolved against
//! a snapshot sees one consistent generation of every entry.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adaptive::DynamicConfig;
use crate::config_store::{KvPair, ROUTES_PREFIX};

/// One ingress prefix and where it goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Route key such as `/basic`. Loaded entries take it from the store key.
    #[serde(default)]
    pub prefix: String,
    /// Logical backend used for discovery and breaker naming.
    pub service_name: String,
    /// Extra leading segment clients use (e.g. `/admin`); removed before forwarding.
    #[serde(default)]
    pub gateway_prefix: String,
    #[serde(default)]
    pub require_auth: bool,
    /// Empty means any authenticated identity; otherwise one of these roles is needed.
    #[serde(default)]
    pub require_role: BTreeSet<String>,
}

impl RouteEntry {
    pub fn new(prefix: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            prefix: normalize(&prefix.into()),
            service_name: service_name.into(),
            gateway_prefix: String::new(),
            require_auth: false,
            require_role: BTreeSet::new(),
        }
    }

    pub fn with_gateway_prefix(mut self, gateway_prefix: impl Into<String>) -> Self {
        self.gateway_prefix = normalize_gateway(&gateway_prefix.into());
        self
    }

    pub fn with_auth(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.require_auth = true;
        self.require_role = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Prefix clients actually request: `gateway_prefix + prefix`.
    pub fn match_prefix(&self) -> String {
        if self.prefix == "/" && !self.gateway_prefix.is_empty() {
            return self.gateway_prefix.clone();
        }
        format!("{}{}", self.gateway_prefix, self.prefix)
    }

    /// Path the backend receives for an inbound `path` (query excluded).
    pub fn forward_path(&self, path: &str) -> String {
        if self.gateway_prefix.is_empty() || !has_segment_prefix(path, &self.gateway_prefix) {
            return path.to_string();
        }
        let rest = &path[self.gateway_prefix.len()..];
        if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        }
    }

    /// Whether `roles` satisfies `require_role`.
    pub fn permits_roles<'a>(&self, mut roles: impl Iterator<Item = &'a str>) -> bool {
        self.require_role.is_empty() || roles.any(|r| self.require_role.contains(r))
    }

    fn normalized(mut self) -> Self {
        self.prefix = normalize(&self.prefix);
        self.gateway_prefix = normalize_gateway(&self.gateway_prefix);
        self
    }
}

fn normalize(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    format!("/{trimmed}")
}

fn normalize_gateway(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// `path` equals `prefix` or continues it at a `/` boundary.
fn has_segment_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Immutable set of routes, kept sorted so the most specific match is found first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    entries: Vec<(String, RouteEntry)>,
}

impl RouteTable {
    pub fn new(entries: impl IntoIterator<Item = RouteEntry>) -> Self {
        let mut by_prefix: BTreeMap<String, RouteEntry> = BTreeMap::new();
        for entry in entries {
            let entry = entry.normalized();
            by_prefix.insert(entry.prefix.clone(), entry);
        }
        let mut entries: Vec<(String, RouteEntry)> =
            by_prefix.into_values().map(|e| (e.match_prefix(), e)).collect();
        entries.sort_by(|(a, ea), (b, eb)| {
            b.len().cmp(&a.len()).then_with(|| a.cmp(b)).then_with(|| ea.prefix.cmp(&eb.prefix))
        });
        Self { entries }
    }

    /// Build from pairs under [`ROUTES_PREFIX`]. Values that fail to parse are
    /// skipped with a warning.
    pub fn from_pairs(pairs: &[KvPair]) -> Self {
        let entries = pairs.iter().filter_map(|pair| {
            let prefix = pair.key.strip_prefix(ROUTES_PREFIX).unwrap_or(&pair.key);
            if prefix.is_empty() {
                return None;
            }
            match serde_json::from_slice::<RouteEntry>(&pair.value) {
                Ok(mut entry) => {
                    entry.prefix = prefix.to_string();
                    Some(entry)
                }
                Err(e) => {
                    warn!(target: "mulegate::routing", key = %pair.key, error = %e, "unparsable route entry skipped");
                    None
                }
            }
        });
        Self::new(entries)
    }

    /// Parse a bootstrap document: a JSON object keyed by prefix.
    pub fn from_json(doc: &str) -> Result<Self, serde_json::Error> {
        let map: BTreeMap<String, RouteEntry> = serde_json::from_str(doc)?;
        Ok(Self::new(map.into_iter().map(|(prefix, mut entry)| {
            entry.prefix = prefix;
            entry
        })))
    }

    /// Most specific entry whose match prefix covers `path`.
    pub fn resolve(&self, path: &str) -> Option<&RouteEntry> {
        self.entries
            .iter()
            .find(|(prefix, _)| has_segment_prefix(path, prefix))
            .map(|(_, entry)| entry)
    }

    /// Entry stored under `prefix`.
    pub fn get(&self, prefix: &str) -> Option<&RouteEntry> {
        let prefix = normalize(prefix);
        self.entries.iter().map(|(_, e)| e).find(|e| e.prefix == prefix)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter().map(|(_, e)| e)
    }

    /// Distinct backend services referenced by the table.
    pub fn services(&self) -> BTreeSet<String> {
        self.entries().map(|e| e.service_name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn with(&self, entry: RouteEntry) -> Self {
        let entry = entry.normalized();
        Self::new(
            self.entries()
                .filter(|e| e.prefix != entry.prefix)
                .cloned()
                .chain(std::iter::once(entry.clone())),
        )
    }

    fn without(&self, prefix: &str) -> Self {
        let prefix = normalize(prefix);
        Self::new(self.entries().filter(|e| e.prefix != prefix).cloned())
    }
}

/// Live route table shared by the dispatcher, reloader and admin API.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    table: DynamicConfig<RouteTable>,
}

impl Routes {
    pub fn new(table: RouteTable) -> Self {
        Self { table: DynamicConfig::new(table) }
    }

    /// Current table. Hold the snapshot for the whole request.
    pub fn snapshot(&self) -> std::sync::Arc<RouteTable> {
        self.table.get()
    }

    /// Replace the whole table.
    pub fn replace(&self, table: RouteTable) {
        self.table.set(table);
    }

    /// Insert or overwrite one entry.
    pub fn upsert(&self, entry: RouteEntry) {
        self.table.update(|t| t.with(entry.clone()));
    }

    /// Remove one entry; returns whether it existed.
    pub fn remove(&self, prefix: &str) -> bool {
        let existed = self.table.get().get(prefix).is_some();
        self.table.update(|t| t.without(prefix));
        existed
    }
}
