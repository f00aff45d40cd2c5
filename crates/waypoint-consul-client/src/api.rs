//! Thin HTTP bindings for the Consul agent, health and KV endpoints
//!
//! Every call takes the ACL token to send; token renewal happens one level up in
//! the client. Non-success responses are turned into `RegistryError` with 401/403
//! classified as access denied.

use std::{collections::HashMap, time::Duration};

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;
use waypoint_common::{RegistryError, Result};

use crate::{
    constants::{BLOCKING_QUERY_MARGIN_MS, X_CONSUL_INDEX, X_CONSUL_TOKEN, consul_api_path},
    model::{AgentCheckRegistration, AgentService, AgentServiceRegistration, HealthCheck, KVPair},
};

/// Parameters of a blocking query
#[derive(Clone, Copy, Debug)]
pub struct BlockingQuery {
    pub index: u64,
    pub wait: Duration,
}

/// Response body together with the `X-Consul-Index` header
#[derive(Clone, Debug)]
pub struct QueryResult<T> {
    pub index: u64,
    pub value: T,
}

/// HTTP access to a single Consul agent
#[derive(Clone, Debug)]
pub struct ConsulApi {
    client: Client,
    base_url: String,
}

impl ConsulApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        if token.is_empty() {
            builder
        } else {
            builder.header(X_CONSUL_TOKEN, token)
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %body, "Consul request failed");
        Err(RegistryError::from_status(status.as_u16(), body.trim()))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn put_json<B: Serialize + ?Sized>(&self, path: &str, token: &str, body: &B) -> Result<()> {
        self.send(self.request(Method::PUT, path, token).json(body))
            .await?;
        Ok(())
    }

    /// GET /v1/agent/self with its own timeout
    pub async fn agent_self(&self, timeout: Duration) -> Result<()> {
        self.send(
            self.request(Method::GET, consul_api_path::AGENT_SELF, "")
                .timeout(timeout),
        )
        .await?;
        Ok(())
    }

    pub async fn register_service(
        &self,
        token: &str,
        registration: &AgentServiceRegistration,
    ) -> Result<()> {
        self.put_json(consul_api_path::SERVICE_REGISTER, token, registration)
            .await
    }

    pub async fn deregister_service(&self, token: &str, service_id: &str) -> Result<()> {
        let path = format!("{}{}", consul_api_path::SERVICE_DEREGISTER, service_id);
        self.send(self.request(Method::PUT, &path, token)).await?;
        Ok(())
    }

    pub async fn register_check(&self, token: &str, check: &AgentCheckRegistration) -> Result<()> {
        self.put_json(consul_api_path::CHECK_REGISTER, token, check)
            .await
    }

    pub async fn deregister_check(&self, token: &str, check_id: &str) -> Result<()> {
        let path = format!("{}{}", consul_api_path::CHECK_DEREGISTER, check_id);
        self.send(self.request(Method::PUT, &path, token)).await?;
        Ok(())
    }

    /// Services registered with the local agent, keyed by service ID
    pub async fn services(&self, token: &str) -> Result<HashMap<String, AgentService>> {
        self.send_json(self.request(Method::GET, consul_api_path::AGENT_SERVICES, token))
            .await
    }

    pub async fn health_checks(&self, token: &str, service: &str) -> Result<Vec<HealthCheck>> {
        let path = format!("{}{}", consul_api_path::HEALTH_CHECKS, service);
        self.send_json(self.request(Method::GET, &path, token))
            .await
    }

    /// Fetch a single key; `None` when it does not exist
    pub async fn kv_get(&self, token: &str, key: &str) -> Result<Option<KVPair>> {
        let path = format!("{}{}", consul_api_path::KV, key);
        match self
            .send_json::<Vec<KVPair>>(self.request(Method::GET, &path, token))
            .await
        {
            Ok(pairs) => Ok(pairs.into_iter().next()),
            Err(RegistryError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List key names under `prefix`
    pub async fn kv_keys(&self, token: &str, prefix: &str) -> Result<Vec<String>> {
        let path = format!("{}{}", consul_api_path::KV, prefix);
        match self
            .send_json::<Vec<String>>(
                self.request(Method::GET, &path, token)
                    .query(&[("keys", "")]),
            )
            .await
        {
            Ok(keys) => Ok(keys),
            Err(RegistryError::Status { status: 404, .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// List every pair under `prefix`, optionally as a blocking query.
    ///
    /// A missing prefix yields an empty list; the index is still reported.
    pub async fn kv_list(
        &self,
        token: &str,
        prefix: &str,
        blocking: Option<BlockingQuery>,
    ) -> Result<QueryResult<Vec<KVPair>>> {
        let path = format!("{}{}", consul_api_path::KV, prefix);
        let mut builder = self
            .request(Method::GET, &path, token)
            .query(&[("recurse", "")]);
        if let Some(query) = blocking {
            let wait_ms = query.wait.as_millis() as u64;
            builder = builder
                .query(&[
                    ("index", query.index.to_string()),
                    ("wait", format!("{}ms", wait_ms)),
                ])
                .timeout(Duration::from_millis(wait_ms + BLOCKING_QUERY_MARGIN_MS));
        }

        let response = builder.send().await?;
        let index = response
            .headers()
            .get(X_CONSUL_INDEX)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(QueryResult {
                index,
                value: Vec::new(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::from_status(status.as_u16(), body.trim()));
        }

        let bytes = response.bytes().await?;
        Ok(QueryResult {
            index,
            value: serde_json::from_slice(&bytes)?,
        })
    }

    /// Store a raw value
    pub async fn kv_put(&self, token: &str, key: &str, value: &[u8]) -> Result<()> {
        let path = format!("{}{}", consul_api_path::KV, key);
        let response = self
            .send(self.request(Method::PUT, &path, token).body(value.to_vec()))
            .await?;
        let accepted = response.text().await?;
        if accepted.trim() == "false" {
            return Err(RegistryError::Status {
                status: 200,
                message: format!("consul refused to store {}", key),
            });
        }
        Ok(())
    }
}
