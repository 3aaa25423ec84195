//! mulegate binary: wires configuration, the Consul adapter and the HTTP server.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mulegate::{
    server, AdminState, AuthRegistry, AuthorizationResolver, CircuitBreakerRegistry,
    ConfigReloader, ConfigStore, ConsulClient, Dispatcher, ForwardedHeadersAuth, GatewayConfig,
    JwtAuth, MemoryPolicyEngine, PolicySet, RateLimiter, RouteTable, Routes, ServiceDiscovery,
    StaticDiscovery, UpstreamProxy,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::parse();
    init_tracing(config.log_json);

    let shutdown = CancellationToken::new();

    let consul = Arc::new(ConsulClient::new(&config.consul_addr).context("building consul client")?);
    let store: Arc<dyn ConfigStore> = consul.clone();
    let discovery: Arc<dyn ServiceDiscovery> = match &config.static_services {
        Some(spec) => {
            let fixed = StaticDiscovery::parse(spec)
                .map_err(anyhow::Error::msg)
                .context("parsing --static-services")?;
            Arc::new(fixed)
        }
        None => consul.clone(),
    };

    let bootstrap = match &config.static_routes {
        Some(path) => {
            let doc = std::fs::read_to_string(path)
                .with_context(|| format!("reading static routes from {}", path.display()))?;
            Some(RouteTable::from_json(&doc).context("parsing static routes")?)
        }
        None => None,
    };
    let local_policies = match &config.policy_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading policy file {}", path.display()))?,
        ),
        None => None,
    };

    let routes = Routes::new(bootstrap.clone().unwrap_or_default());
    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let policies = MemoryPolicyEngine::new();
    policies.replace(PolicySet::from_sources(
        local_policies.iter().map(|text| ("policy-file", text.as_str())),
    ));

    let mut reloader = ConfigReloader::new(store.clone(), routes.clone(), breakers.clone())
        .with_policies(policies.clone(), local_policies);
    if let Some(table) = bootstrap {
        reloader = reloader.with_bootstrap_routes(table);
    }
    let reloader = Arc::new(reloader);

    if config.dynamic_routes {
        let report = reloader
            .reload()
            .await
            .with_context(|| format!("initial configuration load from {}", config.consul_addr))?;
        info!(
            routes = report.routes,
            breakers = report.breakers,
            policy_rules = report.policy_rules.unwrap_or_default(),
            "configuration loaded"
        );
        reloader.clone().spawn(config.reload_interval(), shutdown.child_token());
    } else if routes.snapshot().is_empty() {
        warn!("dynamic routes disabled and no static routes given; every request will be unrouted");
    }

    let mut auth = AuthRegistry::new()
        .with(JwtAuth::new(config.jwt_secret.as_bytes(), config.jwt_issuer.clone()));
    if config.trust_forwarded_identity {
        auth = auth.with(ForwardedHeadersAuth);
    }

    let limiter = RateLimiter::with_cancel(config.rate_limit(), shutdown.clone());
    limiter.spawn_sweeper();

    let authz = AuthorizationResolver::new(Arc::new(policies)).with_extra_verbs(config.extra_verbs());
    let proxy = UpstreamProxy::new(config.upstream_timeout()).context("building upstream client")?;
    let dispatcher = Dispatcher::new(routes.clone(), breakers.clone(), limiter, authz, discovery, proxy)
        .with_rate_limit_wait(config.rate_limit_wait());

    let admin = AdminState { store, routes, breakers, reloader };
    let app = server::router(Arc::new(dispatcher), auth, Some(admin));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(addr = %config.listen, "gateway listening");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    server::serve(listener, app, shutdown.clone()).await.context("serving http")?;
    shutdown.cancel();
    info!("gateway stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
