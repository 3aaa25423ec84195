//! Rule-based policy engine.
//!
//! Rules use the Casbin CSV policy format:
//!
//! ```text
//! p, tenant:t1:role:finance, /finance/*, (read)|(pending)
//! p, user:42, /basic/colors/:id, *
//! g, tenant:t1:user:7, tenant:t1:role:finance
//! ```
//!
//! A request `(subject, resource, action)` is allowed when some `p` rule
//! matches and no `deny` rule does. The subject matches when it equals the
//! rule subject or inherits it through `g` lines (transitively). The resource
//! matches with `keyMatch2` semantics: `*` spans anything and `:name` spans one
//! segment. The action matches when the rule action is `*` or an anchored
//! regex over the request action.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use crate::adaptive::DynamicConfig;

/// Errors surfaced by policy engines.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The engine cannot answer (not loaded, backend down).
    #[error("policy engine unavailable: {0}")]
    Unavailable(String),
    /// A rule line could not be parsed.
    #[error("invalid policy rule at {source_name}:{line}: {reason}")]
    Parse { source_name: String, line: usize, reason: String },
}

/// Permission oracle consulted by the authorization resolver.
#[async_trait]
pub trait PolicyEngine: Send + Sync + std::fmt::Debug {
    async fn enforce(&self, subject: &str, resource: &str, action: &str) -> Result<bool, PolicyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
struct Rule {
    subject: String,
    resource: Regex,
    action: Option<Regex>,
    effect: Effect,
}

impl Rule {
    fn matches_action(&self, action: &str) -> bool {
        match &self.action {
            None => true,
            Some(re) => re.is_match(action),
        }
    }
}

/// A parsed, immutable rule set.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    rules: Vec<Rule>,
    /// member → roles it directly inherits.
    groups: HashMap<String, Vec<String>>,
}

/// Compile a `keyMatch2` resource pattern into an anchored regex.
fn compile_resource(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            ':' if chars.peek().is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_') => {
                while chars.peek().is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_') {
                    chars.next();
                }
                out.push_str("[^/]+");
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    Regex::new(&out)
}

fn compile_action(pattern: &str) -> Result<Option<Regex>, regex::Error> {
    if pattern == "*" {
        return Ok(None);
    }
    Regex::new(&format!("^(?:{pattern})$")).map(Some)
}

impl PolicySet {
    /// Parse rules, failing on the first bad line.
    pub fn parse(source_name: &str, text: &str) -> Result<Self, PolicyError> {
        let mut set = Self::default();
        set.extend(source_name, text)?;
        Ok(set)
    }

    /// Merge several sources, skipping (and logging) sources that fail to parse.
    pub fn from_sources<'a>(sources: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut set = Self::default();
        for (name, text) in sources {
            let mut candidate = set.clone();
            match candidate.extend(name, text) {
                Ok(()) => set = candidate,
                Err(e) => warn!(target: "mulegate::authz", source = %name, error = %e, "policy source skipped"),
            }
        }
        set
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn extend(&mut self, source_name: &str, text: &str) -> Result<(), PolicyError> {
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fail = |reason: String| PolicyError::Parse {
                source_name: source_name.to_string(),
                line: idx + 1,
                reason,
            };
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                ["p", sub, obj, act] | ["p", sub, obj, act, "allow"] => {
                    self.rules.push(Self::rule(sub, obj, act, Effect::Allow).map_err(fail)?)
                }
                ["p", sub, obj, act, "deny"] => {
                    self.rules.push(Self::rule(sub, obj, act, Effect::Deny).map_err(fail)?)
                }
                ["g", member, role] => {
                    self.groups.entry(member.to_string()).or_default().push(role.to_string())
                }
                _ => return Err(fail(format!("unrecognized rule '{line}'"))),
            }
        }
        Ok(())
    }

    fn rule(sub: &str, obj: &str, act: &str, effect: Effect) -> Result<Rule, String> {
        Ok(Rule {
            subject: sub.to_string(),
            resource: compile_resource(obj).map_err(|e| format!("resource '{obj}': {e}"))?,
            action: compile_action(act).map_err(|e| format!("action '{act}': {e}"))?,
            effect,
        })
    }

    /// `subject` itself plus every role reachable through `g` lines.
    fn closure(&self, subject: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([subject.to_string()]);
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(roles) = self.groups.get(&next) {
                queue.extend(roles.iter().cloned());
            }
        }
        seen
    }

    /// Evaluate one request against the set.
    pub fn allows(&self, subject: &str, resource: &str, action: &str) -> bool {
        let subjects = self.closure(subject);
        let mut allowed = false;
        for rule in &self.rules {
            if !subjects.contains(&rule.subject)
                || !rule.resource.is_match(resource)
                || !rule.matches_action(action)
            {
                continue;
            }
            match rule.effect {
                Effect::Deny => return false,
                Effect::Allow => allowed = true,
            }
        }
        allowed
    }
}

/// In-process engine over a swappable [`PolicySet`].
///
/// Starts unloaded; every check fails with [`PolicyError::Unavailable`] until a
/// rule set is installed.
#[derive(Debug, Clone, Default)]
pub struct MemoryPolicyEngine {
    set: DynamicConfig<Option<PolicySet>>,
}

impl MemoryPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(set: PolicySet) -> Self {
        let engine = Self::new();
        engine.replace(set);
        engine
    }

    /// Install a new rule set atomically.
    pub fn replace(&self, set: PolicySet) {
        self.set.set(Some(set));
    }

    pub fn is_loaded(&self) -> bool {
        self.set.get().is_some()
    }
}

#[async_trait]
impl PolicyEngine for MemoryPolicyEngine {
    async fn enforce(&self, subject: &str, resource: &str, action: &str) -> Result<bool, PolicyError> {
        let current = self.set.get();
        match &*current {
            Some(set) => Ok(set.allows(subject, resource, action)),
            None => Err(PolicyError::Unavailable("no policies loaded".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = "
        # finance team
        p, tenant:t1:role:finance, /finance, (pending)|(settle)
        p, tenant:t1:role:finance, /finance/*, read
        p, user:9, /basic/colors/:id, *
        p, tenant:t1:role:finance, /finance/secret, read, deny
        g, tenant:t1:user:7, tenant:t1:role:finance
        g, tenant:t1:role:finance, tenant:t1:role:staff
        p, tenant:t1:role:staff, /notices, read
    ";

    #[test]
    fn role_inheritance_is_transitive() {
        let set = PolicySet::parse("test", RULES).unwrap();
        assert!(set.allows("tenant:t1:user:7", "/finance", "pending"));
        assert!(set.allows("tenant:t1:user:7", "/notices", "read"));
        assert!(!set.allows("tenant:t1:user:8", "/finance", "pending"));
    }

    #[test]
    fn resource_patterns_follow_key_match() {
        let set = PolicySet::parse("test", RULES).unwrap();
        assert!(set.allows("tenant:t1:user:7", "/finance/2024/report", "read"));
        assert!(set.allows("user:9", "/basic/colors/42", "delete"));
        assert!(!set.allows("user:9", "/basic/colors/42/extra", "read"));
        assert!(!set.allows("user:9", "/basic/colorsX/42", "read"));
    }

    #[test]
    fn action_regex_is_anchored() {
        let set = PolicySet::parse("test", RULES).unwrap();
        assert!(set.allows("tenant:t1:user:7", "/finance", "settle"));
        assert!(!set.allows("tenant:t1:user:7", "/finance", "unsettle"));
        assert!(!set.allows("tenant:t1:user:7", "/finance", "create"));
    }

    #[test]
    fn deny_overrides_allow() {
        let set = PolicySet::parse("test", RULES).unwrap();
        assert!(!set.allows("tenant:t1:user:7", "/finance/secret", "read"));
    }

    #[test]
    fn bad_lines_are_reported_with_position() {
        let err = PolicySet::parse("file", "p, a, /x, read\nq, nope").unwrap_err();
        assert_eq!(
            err,
            PolicyError::Parse {
                source_name: "file".into(),
                line: 2,
                reason: "unrecognized rule 'q, nope'".into()
            }
        );
        assert!(PolicySet::parse("file", "p, a, /x, (read").is_err());
    }

    #[test]
    fn from_sources_skips_broken_sources() {
        let set = PolicySet::from_sources([("a", "p, user:1, /a, read"), ("b", "p, broken")]);
        assert_eq!(set.rule_count(), 1);
        assert!(set.allows("user:1", "/a", "read"));
    }

    #[tokio::test]
    async fn unloaded_engine_fails_closed() {
        let engine = MemoryPolicyEngine::new();
        assert!(matches!(
            engine.enforce("user:1", "/a", "read").await,
            Err(PolicyError::Unavailable(_))
        ));
        engine.replace(PolicySet::parse("t", "p, user:1, /a, read").unwrap());
        assert!(engine.enforce("user:1", "/a", "read").await.unwrap());
        assert!(!engine.enforce("user:1", "/a", "delete").await.unwrap());
    }
}
