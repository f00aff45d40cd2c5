//! HTTP bindings for the Keeper registry resource
//!
//! Error bodies are `BaseResponse` envelopes; their message is carried into the
//! returned `RegistryError`. 401/403 are classified as access denied so the client's
//! token wrapper can renew and retry.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header::AUTHORIZATION};
use serde::de::DeserializeOwned;
use tracing::debug;
use waypoint_common::{RegistryError, Result};

use crate::{
    constants::{BEARER_PREFIX, keeper_api_path},
    model::{
        AddRegistrationRequest, BaseResponse, MultiRegistrationsResponse, RegistrationDTO,
        RegistrationResponse,
    },
};

/// HTTP access to a Keeper instance
#[derive(Clone, Debug)]
pub struct KeeperApi {
    client: Client,
    base_url: String,
}

/// Message of an error body, falling back to the raw text
fn error_message(body: &str) -> String {
    match serde_json::from_str::<BaseResponse>(body) {
        Ok(response) if !response.message.is_empty() => response.message,
        _ => body.trim().to_string(),
    }
}

impl KeeperApi {
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

    fn request(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if token.is_empty() {
            builder
        } else {
            builder.header(AUTHORIZATION, format!("{}{}", BEARER_PREFIX, token))
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %body, "Keeper request failed");
        Err(RegistryError::from_status(status.as_u16(), error_message(&body)))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// GET /api/v2/ping
    pub async fn ping(&self) -> Result<()> {
        self.send(self.request(Method::GET, keeper_api_path::PING, ""))
            .await?;
        Ok(())
    }

    /// POST /api/v2/registry, answered with 201 Created
    pub async fn add_registration(&self, token: &str, request: &AddRegistrationRequest) -> Result<()> {
        let response = self
            .send(
                self.request(Method::POST, keeper_api_path::REGISTRY, token)
                    .json(request),
            )
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(RegistryError::Status {
                status: response.status().as_u16(),
                message: format!(
                    "unexpected response to registration of {}",
                    request.registration.service_id
                ),
            });
        }
        Ok(())
    }

    /// PUT /api/v2/registry, replacing an existing registration
    pub async fn update_registration(
        &self,
        token: &str,
        request: &AddRegistrationRequest,
    ) -> Result<()> {
        self.send(
            self.request(Method::PUT, keeper_api_path::REGISTRY, token)
                .json(request),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_registration(&self, token: &str, service_id: &str) -> Result<()> {
        let path = format!("{}{}", keeper_api_path::REGISTRY_BY_SERVICE_ID, service_id);
        self.send(self.request(Method::DELETE, &path, token)).await?;
        Ok(())
    }

    /// A single registration; `None` when Keeper answers 404
    pub async fn registration(&self, token: &str, service_id: &str) -> Result<Option<RegistrationDTO>> {
        let path = format!("{}{}", keeper_api_path::REGISTRY_BY_SERVICE_ID, service_id);
        match self
            .send_json::<RegistrationResponse>(self.request(Method::GET, &path, token))
            .await
        {
            Ok(response) => Ok(Some(response.registration)),
            Err(RegistryError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn all_registrations(&self, token: &str) -> Result<Vec<RegistrationDTO>> {
        let response: MultiRegistrationsResponse = self
            .send_json(self.request(Method::GET, keeper_api_path::REGISTRY_ALL, token))
            .await?;
        Ok(response.registrations.unwrap_or_default())
    }
}
