// KeeperClient - registration and health status backed by a Keeper instance

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};
use waypoint_common::{
    AccessTokenHolder, Config, KvPair, RegistryClient, RegistryError, RegistryType, Result,
    ServiceEndpoint, ShutdownSignal, WatchOptions, WatchSink, watch::spawn_watch,
};

use crate::{
    api::KeeperApi,
    constants::{HEALTH_CHECK_TYPE_HTTP, STATUS_UP},
    model::{AddRegistrationRequest, HealthCheck, RegistrationDTO},
    watch::KeeperRegistrationSource,
};

const REGISTRY_NAME: &str = "keeper";

fn unsupported(operation: &'static str) -> RegistryError {
    RegistryError::Unsupported {
        registry: REGISTRY_NAME,
        operation,
    }
}

/// Registry client for Keeper.
///
/// Keeper combines registration and health check in a single resource and keeps no
/// configuration, so every configuration operation fails with `Unsupported`.
pub struct KeeperClient {
    config: Config,
    api: KeeperApi,
    token: Arc<AccessTokenHolder>,
    shutdown: ShutdownSignal,
}

impl KeeperClient {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let api = KeeperApi::new(
            &config.registry_url(),
            Duration::from_millis(config.request_timeout_ms),
        )?;
        let token = Arc::new(AccessTokenHolder::new(
            &config.access_token,
            config.token_provider.clone(),
        ));

        Ok(Self {
            config,
            api,
            token,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// The token currently sent with requests
    pub fn access_token(&self) -> String {
        self.token.current()
    }

    fn registration(&self) -> RegistrationDTO {
        RegistrationDTO {
            service_id: self.config.service_key.clone(),
            host: self.config.service_host.clone(),
            port: self.config.service_port,
            health_check: HealthCheck {
                interval: self.config.check_interval.clone(),
                path: self.config.check_route.clone(),
                check_type: HEALTH_CHECK_TYPE_HTTP.to_string(),
            },
            ..Default::default()
        }
    }
}

#[async_trait]
impl RegistryClient for KeeperClient {
    fn registry_type(&self) -> RegistryType {
        RegistryType::Keeper
    }

    fn config(&self) -> &Config {
        &self.config
    }

    async fn register(&self) -> Result<()> {
        self.config.validate_registration()?;

        let request = AddRegistrationRequest::new(self.registration());
        let api = &self.api;
        let request = &request;
        let added = self
            .token
            .with_retry("register", |token| async move {
                api.add_registration(&token, request).await
            })
            .await;

        match added {
            Ok(()) => {}
            Err(RegistryError::Status { status: 409, .. }) => {
                debug!(service_id = %self.config.service_key, "Already registered, updating registration");
                self.token
                    .with_retry("register", |token| async move {
                        api.update_registration(&token, request).await
                    })
                    .await?;
            }
            Err(e) => return Err(e),
        }

        info!(
            service_id = %self.config.service_key,
            health_check_url = %self.config.health_check_url(),
            "Registered service with Keeper"
        );
        Ok(())
    }

    async fn unregister(&self) -> Result<()> {
        let api = &self.api;
        let service_key = self.config.service_key.as_str();
        self.token
            .with_retry("unregister", |token| async move {
                api.delete_registration(&token, service_key).await
            })
            .await?;

        info!(service_id = %service_key, "Unregistered service from Keeper");
        Ok(())
    }

    async fn register_check(
        &self,
        id: &str,
        _name: &str,
        _notes: &str,
        _route: &str,
        _interval: &str,
    ) -> Result<()> {
        // The health check is part of the registration.
        debug!(check_id = %id, "Keeper registers health checks with the service, ignoring");
        Ok(())
    }

    async fn unregister_check(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.api.ping().await.is_ok()
    }

    async fn get_service_endpoint(&self, service_key: &str) -> Result<ServiceEndpoint> {
        let api = &self.api;
        let registration = self
            .token
            .with_retry("get_service_endpoint", |token| async move {
                api.registration(&token, service_key).await
            })
            .await?;

        // Keeper reports an unknown service with an empty endpoint.
        Ok(registration
            .map(|r| ServiceEndpoint::new(service_key, &r.host, r.port))
            .unwrap_or_default())
    }

    async fn get_all_service_endpoints(&self) -> Result<Vec<ServiceEndpoint>> {
        let api = &self.api;
        let registrations = self
            .token
            .with_retry("get_all_service_endpoints", |token| async move {
                api.all_registrations(&token).await
            })
            .await?;

        let mut endpoints: Vec<ServiceEndpoint> = registrations
            .iter()
            .map(|r| ServiceEndpoint::new(&r.service_id, &r.host, r.port))
            .collect();
        endpoints.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        Ok(endpoints)
    }

    async fn is_service_available(&self, service_key: &str) -> Result<bool> {
        let api = &self.api;
        let registration = self
            .token
            .with_retry("is_service_available", |token| async move {
                api.registration(&token, service_key).await
            })
            .await
            .map_err(|e| match e {
                RegistryError::Status { status, message } => RegistryError::Status {
                    status,
                    message: format!("failed to check service availability: {}", message),
                },
                other => other,
            })?;

        match registration {
            None => Err(RegistryError::ServiceNotRegistered(service_key.to_string())),
            Some(r) if r.status.eq_ignore_ascii_case(STATUS_UP) => Ok(true),
            Some(r) => {
                debug!(service_id = %service_key, status = %r.status, "Service not healthy");
                Err(RegistryError::ServiceNotHealthy(service_key.to_string()))
            }
        }
    }

    async fn has_configuration(&self) -> Result<bool> {
        Err(unsupported("has_configuration"))
    }

    async fn put_configuration_tree(&self, _tree: &Value, _overwrite: bool) -> Result<()> {
        Err(unsupported("put_configuration"))
    }

    async fn get_configuration_pairs(&self) -> Result<Vec<KvPair>> {
        Err(unsupported("get_configuration"))
    }

    async fn configuration_value_exists(&self, _name: &str) -> Result<bool> {
        Err(unsupported("configuration_value_exists"))
    }

    async fn get_configuration_value(&self, _name: &str) -> Result<Option<Vec<u8>>> {
        Err(unsupported("get_configuration_value"))
    }

    async fn put_configuration_value(&self, _name: &str, _value: &[u8]) -> Result<()> {
        Err(unsupported("put_configuration_value"))
    }

    /// Watch a registration; an empty key watches this service's own registration
    async fn watch_for_changes(&self, key: &str, sink: WatchSink) -> Result<()> {
        if self.shutdown.is_shutdown() || sink.is_cancelled() {
            return Err(RegistryError::Closed);
        }

        let key = key.trim_matches('/');
        let service_id = if key.is_empty() {
            self.config.service_key.clone()
        } else {
            key.to_string()
        };
        if service_id.is_empty() {
            return Err(RegistryError::Config(
                "no service key to watch".to_string(),
            ));
        }

        let source = KeeperRegistrationSource::new(self.api.clone(), self.token.clone(), service_id);
        info!(service_id = %source.service_id(), "Watching Keeper registration");
        spawn_watch(
            source,
            sink,
            self.shutdown.subscribe(),
            WatchOptions::polling(&self.config),
        );
        Ok(())
    }

    fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}

impl Drop for KeeperClient {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}
