//! Waypoint Client - registry and configuration access for services
//!
//! This crate provides:
//! - `new_registry_client`, which builds the backend named by `Config::registry_type`
//! - Re-exports of the client contract, configuration and error types
//! - The Consul and Keeper clients for callers that need a concrete type

// Contract re-exports
pub use waypoint_common::{
    AccessTokenProvider, Config, FnTokenProvider, KvPair, RegistryClient, RegistryClientExt,
    RegistryError, RegistryType, Result, ServiceEndpoint, ShutdownSignal, TokenCallback, Watch,
    kv,
    shutdown::shutdown_on_ctrl_c,
};

// Backend re-exports
pub use waypoint_consul_client::ConsulClient;
pub use waypoint_keeper_client::KeeperClient;

use tracing::debug;

/// Create the registry client selected by `config.registry_type`.
///
/// The type is matched case-insensitively; anything other than "consul" or
/// "keeper" fails with [`RegistryError::UnknownRegistryType`].
pub fn new_registry_client(config: Config) -> Result<Box<dyn RegistryClient>> {
    let registry_type = config.registry_type()?;
    debug!(
        registry_type = %registry_type,
        registry_url = %config.registry_url(),
        "Creating registry client"
    );

    match registry_type {
        RegistryType::Consul => Ok(Box::new(ConsulClient::new(config)?)),
        RegistryType::Keeper => Ok(Box::new(KeeperClient::new(config)?)),
    }
}
