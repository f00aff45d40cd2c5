//! Waypoint Common - shared building blocks for registry clients
//!
//! This crate provides what every backend needs:
//! - `Config` and `ServiceEndpoint` value objects
//! - `RegistryError` and the `Result` alias
//! - Flattening of configuration trees into key/value pairs and back
//! - The access token retry wrapper
//! - The change watch engine
//! - The `RegistryClient` contract

pub mod config;
pub mod error;
pub mod kv;
pub mod shutdown;
pub mod token;
pub mod traits;
pub mod watch;

// Re-exports for convenience
pub use config::{Config, RegistryType, ServiceEndpoint};
pub use error::{RegistryError, Result};
pub use kv::KvPair;
pub use shutdown::ShutdownSignal;
pub use token::{AccessTokenHolder, AccessTokenProvider, FnTokenProvider, TokenCallback};
pub use traits::{RegistryClient, RegistryClientExt};
pub use watch::{ChangeSource, Poll, Snapshot, Watch, WatchOptions, WatchSink};
