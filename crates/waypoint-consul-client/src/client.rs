// ConsulClient - registry, health and configuration access backed by a Consul agent

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};
use waypoint_common::{
    AccessTokenHolder, Config, KvPair, RegistryClient, RegistryError, RegistryType, Result,
    ServiceEndpoint, ShutdownSignal, WatchOptions, WatchSink, kv, watch::spawn_watch,
};

use crate::{
    api::ConsulApi,
    constants::{HEALTH_CHECK_NAME_PREFIX, HEALTH_CHECK_NOTES, HEALTH_PASSING},
    model::{AgentCheckRegistration, AgentServiceCheck, AgentServiceRegistration, aggregated_status},
    watch::{ConsulKvSource, relative_pairs},
};

/// Registry client for a Consul agent.
///
/// Service configuration lives in the KV store under `stem + service_key`.
pub struct ConsulClient {
    config: Config,
    api: ConsulApi,
    token: Arc<AccessTokenHolder>,
    config_base_path: String,
    shutdown: ShutdownSignal,
}

impl ConsulClient {
    /// Create a new ConsulClient with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let api = ConsulApi::new(
            &config.registry_url(),
            Duration::from_millis(config.request_timeout_ms),
        )?;
        let token = Arc::new(AccessTokenHolder::new(
            &config.access_token,
            config.token_provider.clone(),
        ));
        let config_base_path = config.config_base_path();

        Ok(Self {
            config,
            api,
            token,
            config_base_path,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// KV path holding this service's configuration
    pub fn config_base_path(&self) -> &str {
        &self.config_base_path
    }

    /// The token currently sent with requests
    pub fn access_token(&self) -> String {
        self.token.current()
    }

    fn full_path(&self, name: &str) -> String {
        format!("{}/{}", self.config_base_path, name)
    }

    fn watch_prefix(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            self.config_base_path.clone()
        } else {
            self.full_path(key)
        }
    }
}

#[async_trait]
impl RegistryClient for ConsulClient {
    fn registry_type(&self) -> RegistryType {
        RegistryType::Consul
    }

    fn config(&self) -> &Config {
        &self.config
    }

    async fn register(&self) -> Result<()> {
        self.config.validate_registration()?;

        let service_key = self.config.service_key.as_str();
        let registration = AgentServiceRegistration {
            id: Some(service_key.to_string()),
            name: service_key.to_string(),
            address: Some(self.config.service_host.clone()),
            port: Some(self.config.service_port),
            check: None,
        };
        let check = AgentCheckRegistration {
            id: None,
            name: format!("{}{}", HEALTH_CHECK_NAME_PREFIX, service_key),
            notes: Some(HEALTH_CHECK_NOTES.to_string()),
            service_id: Some(service_key.to_string()),
            check: AgentServiceCheck {
                http: Some(self.config.health_check_url()),
                interval: Some(self.config.check_interval.clone()),
                ..Default::default()
            },
        };

        let api = &self.api;
        let registration = &registration;
        self.token
            .with_retry("register", |token| async move {
                api.register_service(&token, registration).await
            })
            .await?;

        let check = &check;
        self.token
            .with_retry("register_check", |token| async move {
                api.register_check(&token, check).await
            })
            .await?;

        info!(
            service_id = %service_key,
            health_check_url = %self.config.health_check_url(),
            "Registered service with Consul"
        );
        Ok(())
    }

    async fn unregister(&self) -> Result<()> {
        let api = &self.api;
        let service_key = self.config.service_key.as_str();
        self.token
            .with_retry("unregister", |token| async move {
                api.deregister_service(&token, service_key).await
            })
            .await?;

        info!(service_id = %service_key, "Unregistered service from Consul");
        Ok(())
    }

    async fn register_check(
        &self,
        id: &str,
        name: &str,
        notes: &str,
        route: &str,
        interval: &str,
    ) -> Result<()> {
        let check = AgentCheckRegistration {
            id: Some(id.to_string()),
            name: name.to_string(),
            notes: (!notes.is_empty()).then(|| notes.to_string()),
            service_id: (!self.config.service_key.is_empty())
                .then(|| self.config.service_key.clone()),
            check: AgentServiceCheck {
                http: Some(self.config.service_url(route)),
                interval: Some(interval.to_string()),
                ..Default::default()
            },
        };

        let api = &self.api;
        let check = &check;
        self.token
            .with_retry("register_check", |token| async move {
                api.register_check(&token, check).await
            })
            .await?;

        debug!(check_id = %id, route = %route, "Registered Consul health check");
        Ok(())
    }

    async fn unregister_check(&self, id: &str) -> Result<()> {
        let api = &self.api;
        self.token
            .with_retry("unregister_check", |token| async move {
                api.deregister_check(&token, id).await
            })
            .await
    }

    async fn is_alive(&self) -> bool {
        self.api
            .agent_self(Duration::from_millis(self.config.request_timeout_ms))
            .await
            .is_ok()
    }

    async fn get_service_endpoint(&self, service_key: &str) -> Result<ServiceEndpoint> {
        let api = &self.api;
        let services = self
            .token
            .with_retry("get_service_endpoint", |token| async move {
                api.services(&token).await
            })
            .await?;

        services
            .get(service_key)
            .map(|service| ServiceEndpoint::new(service_key, &service.address, service.port))
            .ok_or_else(|| RegistryError::NotFound("no matching service endpoint found".to_string()))
    }

    async fn get_all_service_endpoints(&self) -> Result<Vec<ServiceEndpoint>> {
        let api = &self.api;
        let services = self
            .token
            .with_retry("get_all_service_endpoints", |token| async move {
                api.services(&token).await
            })
            .await?;

        let mut endpoints: Vec<ServiceEndpoint> = services
            .values()
            .map(|service| ServiceEndpoint::new(&service.id, &service.address, service.port))
            .collect();
        endpoints.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        Ok(endpoints)
    }

    async fn is_service_available(&self, service_key: &str) -> Result<bool> {
        let api = &self.api;
        let services = self
            .token
            .with_retry("is_service_available", |token| async move {
                api.services(&token).await
            })
            .await?;

        if !services.contains_key(service_key) {
            return Err(RegistryError::ServiceNotRegistered(service_key.to_string()));
        }

        let checks = self
            .token
            .with_retry("is_service_available", |token| async move {
                api.health_checks(&token, service_key).await
            })
            .await?;

        if checks.is_empty() {
            return Err(RegistryError::NoHealthChecks(service_key.to_string()));
        }

        let status = aggregated_status(&checks);
        if status != HEALTH_PASSING {
            debug!(service_id = %service_key, status = %status, "Service not healthy");
            return Err(RegistryError::ServiceNotHealthy(service_key.to_string()));
        }

        Ok(true)
    }

    async fn has_configuration(&self) -> Result<bool> {
        let api = &self.api;
        let prefix = format!("{}/", self.config_base_path);
        let prefix = prefix.as_str();
        let keys = self
            .token
            .with_retry("has_configuration", |token| async move {
                api.kv_keys(&token, prefix).await
            })
            .await?;

        Ok(!keys.is_empty())
    }

    async fn put_configuration_tree(&self, tree: &Value, overwrite: bool) -> Result<()> {
        let pairs = kv::flatten(tree);
        let mut written = 0usize;

        for pair in &pairs {
            if !overwrite && self.configuration_value_exists(&pair.key).await? {
                continue;
            }
            self.put_configuration_value(&pair.key, pair.value.as_bytes())
                .await?;
            written += 1;
        }

        info!(
            base_path = %self.config_base_path,
            total = pairs.len(),
            written,
            overwrite,
            "Stored configuration in Consul"
        );
        Ok(())
    }

    async fn get_configuration_pairs(&self) -> Result<Vec<KvPair>> {
        let api = &self.api;
        let prefix = self.config_base_path.as_str();
        let result = self
            .token
            .with_retry("get_configuration", |token| async move {
                api.kv_list(&token, prefix, None).await
            })
            .await?;

        relative_pairs(prefix, result.value)
    }

    async fn configuration_value_exists(&self, name: &str) -> Result<bool> {
        let api = &self.api;
        let key = self.full_path(name);
        let key = key.as_str();
        let pair = self
            .token
            .with_retry("configuration_value_exists", |token| async move {
                api.kv_get(&token, key).await
            })
            .await?;

        Ok(pair.is_some())
    }

    async fn get_configuration_value(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let api = &self.api;
        let key = self.full_path(name);
        let key = key.as_str();
        let pair = self
            .token
            .with_retry("get_configuration_value", |token| async move {
                api.kv_get(&token, key).await
            })
            .await?;

        pair.map(|p| {
            p.decoded_value()
                .map_err(|e| RegistryError::Decode(format!("value of {}: {}", key, e)))
        })
        .transpose()
    }

    async fn put_configuration_value(&self, name: &str, value: &[u8]) -> Result<()> {
        let api = &self.api;
        let key = self.full_path(name);
        let key = key.as_str();
        self.token
            .with_retry("put_configuration_value", |token| async move {
                api.kv_put(&token, key, value).await
            })
            .await?;

        debug!(key = %key, "Stored configuration value");
        Ok(())
    }

    async fn watch_for_changes(&self, key: &str, sink: WatchSink) -> Result<()> {
        if self.shutdown.is_shutdown() || sink.is_cancelled() {
            return Err(RegistryError::Closed);
        }

        let source = ConsulKvSource::new(
            self.api.clone(),
            self.token.clone(),
            self.watch_prefix(key),
            Duration::from_millis(self.config.watch_wait_ms),
        );
        info!(prefix = %source.prefix(), "Watching Consul key");
        spawn_watch(
            source,
            sink,
            self.shutdown.subscribe(),
            WatchOptions::blocking(&self.config),
        );
        Ok(())
    }

    fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}

impl Drop for ConsulClient {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ConsulClient {
        ConsulClient::new(
            Config::new(RegistryType::Consul, "localhost", 8500)
                .with_service_key("edgex/core/2.0/", "core-data"),
        )
        .unwrap()
    }

    #[test]
    fn test_paths() {
        let client = client();
        assert_eq!(client.config_base_path(), "edgex/core/2.0/core-data");
        assert_eq!(
            client.full_path("Writable/LogLevel"),
            "edgex/core/2.0/core-data/Writable/LogLevel"
        );
        assert_eq!(
            client.watch_prefix("Writable"),
            "edgex/core/2.0/core-data/Writable"
        );
        assert_eq!(
            client.watch_prefix("/Writable"),
            "edgex/core/2.0/core-data/Writable"
        );
        assert_eq!(client.watch_prefix(""), "edgex/core/2.0/core-data");
    }

    #[test]
    fn test_invalid_host_is_config_error() {
        let result = ConsulClient::new(Config::new(RegistryType::Consul, "bad host", 8500));
        assert!(matches!(result, Err(RegistryError::Config(_))));
    }
}
