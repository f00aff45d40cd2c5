//! Command line arguments

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Register services and manage their configuration in a Consul or Keeper registry
#[derive(Debug, Parser)]
#[command(name = "waypoint", version)]
pub struct Cli {
    /// Settings file (TOML, YAML or JSON)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Registry backend, "consul" or "keeper"
    #[arg(short = 't', long = "registry-type", global = true)]
    pub registry_type: Option<String>,

    /// Registry host
    #[arg(long = "host", global = true)]
    pub host: Option<String>,

    /// Registry port
    #[arg(short = 'p', long = "port", global = true)]
    pub port: Option<u16>,

    /// Key of the service to act for
    #[arg(short = 's', long = "service-key", global = true)]
    pub service_key: Option<String>,

    /// Default log level, overridden by RUST_LOG
    #[arg(long = "log-level", default_value = "warn", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that the registry answers
    Alive,
    /// Register the configured service and its health check
    Register,
    /// Remove the configured service
    Unregister,
    /// Show where a service can be reached
    Endpoint { service: String },
    /// List every registered service
    Endpoints,
    /// Check that a service is registered and healthy
    Available { service: String },
    /// Check whether configuration is stored for the service
    HasConfig,
    /// Print a single configuration value
    Get { name: String },
    /// Store a single configuration value
    Put { name: String, value: String },
    /// Store a TOML or JSON file as configuration
    Push {
        file: PathBuf,
        /// Replace values that already exist
        #[arg(long)]
        overwrite: bool,
    },
    /// Print all configuration of the service
    Dump {
        /// Print a JSON document instead of key = value lines
        #[arg(long)]
        json: bool,
    },
    /// Print every change below a key until interrupted
    Watch {
        #[arg(default_value = "")]
        key: String,
    },
}
