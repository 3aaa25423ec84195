//! Consul HTTP API adapter: KV store for configuration and health API for discovery.

use crate::config_store::{ConfigStore, ConfigStoreError, KvPair};
use crate::discovery::{DiscoveryError, ServiceDiscovery};
use async_trait::async_trait;
use base64::Engine;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Thin client over Consul's `/v1/kv` and `/v1/health` endpoints.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: HealthNode,
    service: HealthService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(default)]
    address: String,
    port: u16,
}

impl ConsulClient {
    /// Connect to the agent at `addr` (`http://host:8500`; scheme optional).
    pub fn new(addr: &str) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()?;
        let addr = addr.trim().trim_end_matches('/');
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        Ok(Self { base, http })
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base, key)
    }
}

fn unavailable(e: reqwest::Error) -> ConfigStoreError {
    ConfigStoreError::Unavailable(e.to_string())
}

#[async_trait]
impl ConfigStore for ConsulClient {
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, ConfigStoreError> {
        let resp = self
            .http
            .get(self.kv_url(prefix))
            .query(&[("recurse", "true")])
            .send()
            .await
            .map_err(unavailable)?;
        // Consul answers 404 for a prefix with no keys.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = resp.error_for_status().map_err(unavailable)?;
        let entries: Vec<KvEntry> =
            resp.json().await.map_err(|e| ConfigStoreError::Malformed(e.to_string()))?;

        let mut pairs = Vec::with_capacity(entries.len());
        for entry in entries {
            let value = match entry.value {
                Some(encoded) => base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| ConfigStoreError::Malformed(format!("{}: {e}", entry.key)))?,
                None => Vec::new(),
            };
            pairs.push(KvPair { key: entry.key, value });
        }
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pairs)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ConfigStoreError> {
        self.http
            .put(self.kv_url(key))
            .body(value)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ConfigStoreError> {
        self.http
            .delete(self.kv_url(key))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl ServiceDiscovery for ConsulClient {
    async fn resolve(&self, service: &str) -> Result<String, DiscoveryError> {
        let entries: Vec<HealthEntry> = self
            .http
            .get(format!("{}/v1/health/service/{}", self.base, service))
            .query(&[("passing", "true")])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;

        if entries.is_empty() {
            return Err(DiscoveryError::NoInstance { service: service.to_string() });
        }
        let pick = &entries[rand::rng().random_range(0..entries.len())];
        // An empty service address means "same as the node".
        let host = if pick.service.address.is_empty() {
            &pick.node.address
        } else {
            &pick.service.address
        };
        Ok(format!("http://{}:{}", host, pick.service.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[tokio::test]
    async fn lists_and_decodes_values() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/gateway/routes/"))
            .and(query_param("recurse", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"Key": "gateway/routes/order", "Value": b64(r#"{"service_name":"order"}"#)},
                {"Key": "gateway/routes/basic", "Value": b64(r#"{"service_name":"basic"}"#)},
                {"Key": "gateway/routes/", "Value": null}
            ])))
            .mount(&server)
            .await;

        let client = ConsulClient::new(&server.uri()).unwrap();
        let pairs = client.list("gateway/routes/").await.unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[1].key, "gateway/routes/basic");
        assert_eq!(pairs[1].value, br#"{"service_name":"basic"}"#);
        assert!(pairs[0].value.is_empty());
    }

    #[tokio::test]
    async fn missing_prefix_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = ConsulClient::new(&server.uri()).unwrap();
        assert!(client.list("gateway/hystrix/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let client = ConsulClient::new(&server.uri()).unwrap();
        assert!(matches!(
            client.list("gateway/routes/").await,
            Err(ConfigStoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn put_and_delete_hit_kv_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/kv/gateway/hystrix/basic"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/kv/gateway/hystrix/basic"))
            .respond_with(ResponseTemplate::new(200).set_body_string("true"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ConsulClient::new(&server.uri()).unwrap();
        client.put("gateway/hystrix/basic", b"{}".to_vec()).await.unwrap();
        client.delete("gateway/hystrix/basic").await.unwrap();
    }

    #[tokio::test]
    async fn resolves_passing_instance_with_node_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/basic"))
            .and(query_param("passing", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"Node": {"Address": "10.0.0.9"}, "Service": {"Address": "", "Port": 8002}}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/ghost"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = ConsulClient::new(&server.uri()).unwrap();
        assert_eq!(client.resolve("basic").await.unwrap(), "http://10.0.0.9:8002");
        assert_eq!(
            client.resolve("ghost").await,
            Err(DiscoveryError::NoInstance { service: "ghost".into() })
        );
    }

    #[test]
    fn adds_scheme_when_missing() {
        let c = ConsulClient::new("127.0.0.1:8500/").unwrap();
        assert_eq!(c.kv_url("a"), "http://127.0.0.1:8500/v1/kv/a");
    }
}
