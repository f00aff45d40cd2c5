// waypoint-keeper-client: service registry client backed by Keeper

pub mod api;
pub mod client;
pub mod constants;
pub mod model;
pub mod watch;

pub use client::KeeperClient;
