//! The registry client contract
//!
//! [`RegistryClient`] is object safe so a backend can be chosen at runtime and held as
//! `Box<dyn RegistryClient>`. Typed helpers live on [`RegistryClientExt`], which is
//! implemented for every client including trait objects.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    config::{Config, RegistryType, ServiceEndpoint},
    error::{RegistryError, Result},
    kv::{self, KvPair},
    shutdown::ShutdownSignal,
    watch::{self, Watch, WatchSink},
};

#[async_trait]
pub trait RegistryClient: Send + Sync {
    fn registry_type(&self) -> RegistryType;

    /// Settings this client was built with
    fn config(&self) -> &Config;

    /// Register this service and its health check
    async fn register(&self) -> Result<()>;

    async fn unregister(&self) -> Result<()>;

    /// Register an additional HTTP health check against a route of this service
    async fn register_check(
        &self,
        id: &str,
        name: &str,
        notes: &str,
        route: &str,
        interval: &str,
    ) -> Result<()>;

    async fn unregister_check(&self, id: &str) -> Result<()>;

    /// Whether the registry answers its status endpoint. Never fails.
    async fn is_alive(&self) -> bool;

    async fn get_service_endpoint(&self, service_key: &str) -> Result<ServiceEndpoint>;

    async fn get_all_service_endpoints(&self) -> Result<Vec<ServiceEndpoint>>;

    /// `Ok(true)` when the service is registered and healthy, otherwise an error
    /// explaining why it is not available
    async fn is_service_available(&self, service_key: &str) -> Result<bool>;

    /// Whether any configuration is stored for this service
    async fn has_configuration(&self) -> Result<bool>;

    /// Store a configuration tree. Existing keys are only replaced when `overwrite` is set.
    async fn put_configuration_tree(&self, tree: &Value, overwrite: bool) -> Result<()>;

    /// All configuration pairs for this service, with keys relative to its base path
    async fn get_configuration_pairs(&self) -> Result<Vec<KvPair>>;

    async fn configuration_value_exists(&self, name: &str) -> Result<bool>;

    /// Raw value of a single key, `None` when it does not exist
    async fn get_configuration_value(&self, name: &str) -> Result<Option<Vec<u8>>>;

    async fn put_configuration_value(&self, name: &str, value: &[u8]) -> Result<()>;

    /// Start watching `key` and deliver changes to `sink` until the client is closed
    async fn watch_for_changes(&self, key: &str, sink: WatchSink) -> Result<()>;

    /// Signal that stops every watch started by this client
    fn shutdown_signal(&self) -> &ShutdownSignal;

    /// Stop all watches started by this client
    fn close(&self) {
        self.shutdown_signal().shutdown();
    }
}

/// Typed configuration and watch helpers
#[async_trait]
pub trait RegistryClientExt: RegistryClient {
    /// Store any serializable value as configuration
    async fn put_configuration<T>(&self, value: &T, overwrite: bool) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let tree = serde_json::to_value(value)?;
        self.put_configuration_tree(&tree, overwrite).await
    }

    /// Store a TOML document as configuration
    async fn put_configuration_toml(&self, document: &toml::Value, overwrite: bool) -> Result<()> {
        let tree = kv::toml_to_json(document);
        self.put_configuration_tree(&tree, overwrite).await
    }

    /// Read this service's configuration into `T`
    async fn get_configuration<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        let pairs = self.get_configuration_pairs().await?;
        if pairs.is_empty() {
            return Err(RegistryError::NotFound(format!(
                "no configuration found at '{}'",
                self.config().config_base_path()
            )));
        }
        kv::from_pairs(&pairs)
    }

    /// Watch `key` and decode every change into `T`
    async fn watch<T>(&self, key: &str) -> Result<Watch<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (sink, watch) = watch::channel::<T>(self.config().watch_channel_capacity);
        self.watch_for_changes(key, sink).await?;
        Ok(watch)
    }

    /// Like [`watch`](Self::watch), also stopping when `signal` fires
    async fn watch_until<T>(&self, key: &str, signal: &ShutdownSignal) -> Result<Watch<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (sink, watch) = watch::channel::<T>(self.config().watch_channel_capacity);
        self.watch_for_changes(key, sink.with_shutdown(signal)).await?;
        Ok(watch)
    }
}

impl<C: RegistryClient + ?Sized> RegistryClientExt for C {}
