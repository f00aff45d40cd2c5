// waypoint-consul-client: registry and configuration client backed by a Consul agent

pub mod api;
pub mod client;
pub mod constants;
pub mod model;
pub mod watch;

pub use client::ConsulClient;
