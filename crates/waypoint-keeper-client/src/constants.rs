// Keeper HTTP API paths and protocol constants

pub mod keeper_api_path {
    pub const PING: &str = "/api/v2/ping";
    pub const REGISTRY: &str = "/api/v2/registry";
    pub const REGISTRY_ALL: &str = "/api/v2/registry/all";
    pub const REGISTRY_BY_SERVICE_ID: &str = "/api/v2/registry/serviceId/";
}

pub const API_VERSION: &str = "v2";

/// Health check type understood by Keeper
pub const HEALTH_CHECK_TYPE_HTTP: &str = "http";

// Registration status values
pub const STATUS_UP: &str = "UP";
pub const STATUS_DOWN: &str = "DOWN";

pub const BEARER_PREFIX: &str = "Bearer ";
