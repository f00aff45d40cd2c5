// Registry connection settings and the service endpoint value object

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{RegistryError, Result},
    token::{AccessTokenProvider, TokenCallback},
};

pub const DEFAULT_PROTOCOL: &str = "http";

/// Backend implementation selected by [`Config::registry_type`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegistryType {
    Consul,
    Keeper,
}

impl RegistryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryType::Consul => "consul",
            RegistryType::Keeper => "keeper",
        }
    }
}

impl fmt::Display for RegistryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "consul" => Ok(RegistryType::Consul),
            "keeper" => Ok(RegistryType::Keeper),
            _ => Err(RegistryError::UnknownRegistryType(s.to_string())),
        }
    }
}

/// Connection parameters for the registry and, optionally, the identity of the
/// service that wants to register itself.
///
/// The service identity fields (`service_key`, `service_host`, `service_port`,
/// `check_route`, `check_interval`) may be left empty when the client is only
/// used for configuration access.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Protocol used to reach the registry (default: "http")
    pub protocol: String,
    /// Registry host name or IP address
    pub host: String,
    /// Registry HTTP port
    pub port: u16,
    /// Backend discriminator, "consul" or "keeper"
    #[serde(alias = "type")]
    pub registry_type: String,
    /// Base configuration path inside the registry, e.g. "edgex/core/2.0/"
    pub stem: String,
    /// Key identifying this service
    pub service_key: String,
    pub service_host: String,
    pub service_port: u16,
    /// Protocol the registry should use to call the health check (default: "http")
    pub service_protocol: String,
    /// Health check callback route, e.g. "/api/v2/ping"
    pub check_route: String,
    /// Health check interval, e.g. "10s"
    pub check_interval: String,
    /// Initial access token, empty when the registry has no ACLs
    pub access_token: String,
    /// Callback used to obtain a fresh token after an authorization failure
    #[serde(skip)]
    pub token_provider: Option<TokenCallback>,
    /// Timeout for every registry request in milliseconds (default: 10000)
    pub request_timeout_ms: u64,
    /// Maximum time a blocking watch query is held open in milliseconds (default: 30000)
    pub watch_wait_ms: u64,
    /// Initial back-off after a failed watch poll in milliseconds (default: 1000)
    pub watch_retry_ms: u64,
    /// Poll period for backends without blocking queries in milliseconds (default: 1000)
    pub watch_poll_interval_ms: u64,
    /// Capacity of each watch channel (default: 16)
    pub watch_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: String::new(),
            host: "localhost".to_string(),
            port: 8500,
            registry_type: RegistryType::Consul.to_string(),
            stem: String::new(),
            service_key: String::new(),
            service_host: String::new(),
            service_port: 0,
            service_protocol: String::new(),
            check_route: String::new(),
            check_interval: String::new(),
            access_token: String::new(),
            token_provider: None,
            request_timeout_ms: 10000,
            watch_wait_ms: 30000,
            watch_retry_ms: 1000,
            watch_poll_interval_ms: 1000,
            watch_channel_capacity: 16,
        }
    }
}

impl Config {
    /// Create a config pointing at a registry
    pub fn new(registry_type: RegistryType, host: &str, port: u16) -> Self {
        Self {
            registry_type: registry_type.to_string(),
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    /// Set the registry protocol
    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = protocol.to_string();
        self
    }

    /// Set the configuration stem and the service key
    pub fn with_service_key(mut self, stem: &str, service_key: &str) -> Self {
        self.stem = stem.to_string();
        self.service_key = service_key.to_string();
        self
    }

    /// Set the address the registry uses to reach this service
    pub fn with_service(mut self, host: &str, port: u16) -> Self {
        self.service_host = host.to_string();
        self.service_port = port;
        self
    }

    pub fn with_service_protocol(mut self, protocol: &str) -> Self {
        self.service_protocol = protocol.to_string();
        self
    }

    /// Set the health check route and interval
    pub fn with_check(mut self, route: &str, interval: &str) -> Self {
        self.check_route = route.to_string();
        self.check_interval = interval.to_string();
        self
    }

    pub fn with_access_token(mut self, token: &str) -> Self {
        self.access_token = token.to_string();
        self
    }

    /// Set the callback invoked when the registry rejects the current token
    pub fn with_token_provider<P: AccessTokenProvider>(mut self, provider: P) -> Self {
        self.token_provider = Some(TokenCallback::new(provider));
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Set watch timings
    pub fn with_watch_timings(mut self, wait_ms: u64, retry_ms: u64, poll_interval_ms: u64) -> Self {
        self.watch_wait_ms = wait_ms;
        self.watch_retry_ms = retry_ms;
        self.watch_poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn registry_protocol(&self) -> &str {
        if self.protocol.is_empty() {
            DEFAULT_PROTOCOL
        } else {
            &self.protocol
        }
    }

    pub fn service_protocol(&self) -> &str {
        if self.service_protocol.is_empty() {
            DEFAULT_PROTOCOL
        } else {
            &self.service_protocol
        }
    }

    /// `protocol://host:port` of the registry
    pub fn registry_url(&self) -> String {
        format!("{}://{}:{}", self.registry_protocol(), self.host, self.port)
    }

    /// URL the registry calls to check this service's health
    pub fn health_check_url(&self) -> String {
        self.service_url(&self.check_route)
    }

    /// URL of an arbitrary route on this service
    pub fn service_url(&self, route: &str) -> String {
        format!(
            "{}://{}:{}{}",
            self.service_protocol(),
            self.service_host,
            self.service_port,
            route
        )
    }

    /// Parsed backend discriminator
    pub fn registry_type(&self) -> Result<RegistryType> {
        self.registry_type.parse()
    }

    /// Registry path holding this service's configuration (stem + service key)
    pub fn config_base_path(&self) -> String {
        format!("{}{}", self.stem, self.service_key)
    }

    /// Validate the registry URL
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.registry_url())
            .map_err(|e| RegistryError::Config(format!("invalid registry url: {}", e)))?;
        Ok(())
    }

    /// Ensure every field needed to register this service is set
    pub fn validate_registration(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.service_key.is_empty() {
            missing.push("service_key");
        }
        if self.service_host.is_empty() {
            missing.push("service_host");
        }
        if self.service_port == 0 {
            missing.push("service_port");
        }
        if self.check_route.is_empty() {
            missing.push("check_route");
        }
        if self.check_interval.is_empty() {
            missing.push("check_interval");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Config(format!(
                "unable to register service: service information not set ({})",
                missing.join(", ")
            )))
        }
    }
}

/// Network location of a registered service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service_id: String,
    pub host: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn new(service_id: &str, host: &str, port: u16) -> Self {
        Self {
            service_id: service_id.to_string(),
            host: host.to_string(),
            port,
        }
    }

    /// A zero-value endpoint, returned by backends that signal "not found" without an error
    pub fn is_empty(&self) -> bool {
        self.service_id.is_empty() && self.host.is_empty() && self.port == 0
    }
}
