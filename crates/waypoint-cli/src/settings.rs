//! Client settings from file, environment and command line
//!
//! Sources are layered lowest to highest: the optional settings file, `WAYPOINT_*`
//! environment variables (e.g. `WAYPOINT_HOST`, `WAYPOINT_SERVICE_KEY`), then the
//! command line flags.

use anyhow::Context;
use config::{Environment, File};
use waypoint_client::Config;

use crate::cli::Cli;

pub const ENV_PREFIX: &str = "WAYPOINT";

/// Build the client configuration for this invocation
pub fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut builder = config::Config::builder();

    if let Some(path) = &cli.config {
        builder = builder.add_source(File::from(path.as_path()));
    }
    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

    if let Some(registry_type) = &cli.registry_type {
        builder = builder.set_override("registry_type", registry_type.as_str())?;
    }
    if let Some(host) = &cli.host {
        builder = builder.set_override("host", host.as_str())?;
    }
    if let Some(port) = cli.port {
        builder = builder.set_override("port", i64::from(port))?;
    }
    if let Some(service_key) = &cli.service_key {
        builder = builder.set_override("service_key", service_key.as_str())?;
    }

    let settings = builder.build().with_context(|| match &cli.config {
        Some(path) => format!("failed to load settings from {}", path.display()),
        None => "failed to load settings".to_string(),
    })?;

    settings
        .try_deserialize::<Config>()
        .context("invalid registry settings")
}
