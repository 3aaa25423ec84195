//! Streaming reverse proxy to backend instances.
//!
//! Request and response bodies are streamed; neither side is buffered in full.

use std::time::Duration;

use axum::body::Body;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response};

use crate::auth::{Identity, X_ROLES, X_TENANT_CODE, X_TENANT_ID, X_USERNAME, X_USER_ID};

/// Marker header added to every proxied request.
pub const X_GATEWAY: &str = "x-gateway";
pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_REAL_IP: &str = "x-real-ip";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const IDENTITY_HEADERS: &[&str] = &[X_USER_ID, X_USERNAME, X_TENANT_ID, X_TENANT_CODE, X_ROLES];

/// Per-request data the proxy stamps onto the forwarded request.
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    pub client_ip: String,
    pub request_id: Option<String>,
    pub identity: Option<Identity>,
}

/// Failure to obtain a response from a backend.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("no response headers within {0:?}")]
    HeaderTimeout(Duration),
}

/// Forwards requests to backend base URLs with a shared connection pool.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    client: reqwest::Client,
    header_timeout: Duration,
}

impl UpstreamProxy {
    /// `timeout` bounds connecting and waiting for response headers. The body
    /// streams afterwards without a deadline.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, header_timeout: timeout })
    }

    /// Send `req` to `base_url + path_and_query` and stream the answer back.
    pub async fn forward(
        &self,
        base_url: &str,
        path_and_query: &str,
        req: Request<Body>,
        ctx: &ForwardContext,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, body) = req.into_parts();
        let url = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);
        let headers = forwarded_headers(&parts.headers, ctx);

        let send = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send();
        let upstream = tokio::time::timeout(self.header_timeout, send)
            .await
            .map_err(|_| ProxyError::HeaderTimeout(self.header_timeout))??;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(h) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if !HOP_BY_HOP.contains(name) {
                    h.append(name.clone(), value.clone());
                }
            }
        }
        let body = Body::from_stream(upstream.bytes_stream());
        Ok(builder.body(body).unwrap_or_else(|_| Response::new(Body::empty())))
    }
}

/// Inbound headers minus hop-by-hop and spoofable identity headers, plus the
/// gateway's forwarding headers.
pub fn forwarded_headers(inbound: &HeaderMap, ctx: &ForwardContext) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len() + 10);
    for (name, value) in inbound {
        if name == header::HOST
            || name == header::CONTENT_LENGTH
            || HOP_BY_HOP.contains(name)
            || IDENTITY_HEADERS.contains(&name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    let mut set = |name: &'static str, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            out.insert(HeaderName::from_static(name), v);
        }
    };

    if let Some(host) = inbound.get(header::HOST).and_then(|h| h.to_str().ok()) {
        set(X_FORWARDED_HOST, host);
    }
    if !ctx.client_ip.is_empty() {
        set(X_REAL_IP, &ctx.client_ip);
        let chain = match inbound.get(X_FORWARDED_FOR).and_then(|h| h.to_str().ok()) {
            Some(prev) if !prev.trim().is_empty() => format!("{}, {}", prev.trim(), ctx.client_ip),
            _ => ctx.client_ip.clone(),
        };
        set(X_FORWARDED_FOR, &chain);
    }
    set(X_FORWARDED_PROTO, "http");
    set(X_GATEWAY, "mulegate");
    if let Some(id) = &ctx.request_id {
        set(X_REQUEST_ID, id);
    }
    if let Some(identity) = &ctx.identity {
        set(X_USER_ID, &identity.user_id);
        set(X_USERNAME, &identity.username);
        set(X_TENANT_ID, &identity.tenant_id);
        set(X_TENANT_CODE, &identity.tenant_code);
        set(X_ROLES, &identity.roles.join(","));
    }
    out
}
