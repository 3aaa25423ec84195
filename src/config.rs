//! Process configuration from command-line flags and environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::rate_limit::RateLimitConfig;

/// Dynamic API gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "mulegate", version, about, long_about = None)]
pub struct GatewayConfig {
    /// Address to listen on.
    #[arg(long, env = "GATEWAY_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Consul agent used for discovery and, with dynamic routes, configuration.
    #[arg(long, env = "CONSUL_ADDR", default_value = "http://127.0.0.1:8500")]
    pub consul_addr: String,

    /// Load routes, breaker configs and policies from Consul KV and keep them fresh.
    #[arg(
        long,
        env = "GATEWAY_DYNAMIC_ROUTES",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub dynamic_routes: bool,

    #[arg(long, env = "GATEWAY_RELOAD_INTERVAL_SECS", default_value_t = 10)]
    pub reload_interval_secs: u64,

    /// HS256 secret for bearer tokens.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    #[arg(long, env = "JWT_ISSUER", default_value = "mule-cloud")]
    pub jwt_issuer: String,

    /// Accept X-User-ID style headers from an upstream gateway hop.
    #[arg(long, env = "GATEWAY_TRUST_FORWARDED", default_value_t = false)]
    pub trust_forwarded_identity: bool,

    /// Requests per second per client; 0 disables limiting.
    #[arg(long, env = "GATEWAY_RATE_LIMIT_RPS", default_value_t = 100)]
    pub rate_limit_rps: u32,

    /// Bucket size; defaults to the per-second rate.
    #[arg(long, env = "GATEWAY_RATE_LIMIT_BURST")]
    pub rate_limit_burst: Option<u32>,

    /// How long a request may wait for a token.
    #[arg(long, env = "GATEWAY_RATE_LIMIT_WAIT_MS", default_value_t = 1000)]
    pub rate_limit_wait_ms: u64,

    #[arg(long, env = "GATEWAY_MAX_VISITORS", default_value_t = 100_000)]
    pub max_visitors: usize,

    /// JSON file of routes keyed by prefix, served while the store has none.
    #[arg(long, env = "GATEWAY_STATIC_ROUTES")]
    pub static_routes: Option<PathBuf>,

    /// Fixed instances as `name=url,...`; replaces Consul discovery when set.
    #[arg(long, env = "GATEWAY_STATIC_SERVICES")]
    pub static_services: Option<String>,

    /// Casbin-style CSV policy file.
    #[arg(long, env = "GATEWAY_POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// Business verbs recognised in addition to the built-in list.
    #[arg(long, env = "GATEWAY_EXTRA_VERBS", value_delimiter = ',')]
    pub extra_business_verbs: Vec<String>,

    /// Deadline for connecting to a backend and receiving its response headers.
    #[arg(long, env = "GATEWAY_UPSTREAM_TIMEOUT_SECS", default_value_t = 30)]
    pub upstream_timeout_secs: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "GATEWAY_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl GatewayConfig {
    pub fn rate_limit(&self) -> RateLimitConfig {
        let base = RateLimitConfig::per_second(self.rate_limit_rps);
        RateLimitConfig {
            max_visitors: self.max_visitors,
            ..base.with_burst(self.rate_limit_burst.unwrap_or(self.rate_limit_rps))
        }
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.rate_limit_wait_ms)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs.max(1))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs.max(1))
    }

    /// Extra verbs with blanks removed.
    pub fn extra_verbs(&self) -> Vec<String> {
        self.extra_business_verbs
            .iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }
}
