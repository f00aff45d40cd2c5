// Consul HTTP API paths and protocol constants

pub mod consul_api_path {
    // Agent
    pub const AGENT_SELF: &str = "/v1/agent/self";
    pub const AGENT_SERVICES: &str = "/v1/agent/services";
    pub const SERVICE_REGISTER: &str = "/v1/agent/service/register";
    pub const SERVICE_DEREGISTER: &str = "/v1/agent/service/deregister/";
    pub const CHECK_REGISTER: &str = "/v1/agent/check/register";
    pub const CHECK_DEREGISTER: &str = "/v1/agent/check/deregister/";

    // Health
    pub const HEALTH_CHECKS: &str = "/v1/health/checks/";

    // KV
    pub const KV: &str = "/v1/kv/";
}

/// ACL token header
pub const X_CONSUL_TOKEN: &str = "X-Consul-Token";
/// Raft index returned with every blocking-capable query
pub const X_CONSUL_INDEX: &str = "X-Consul-Index";

// Health status values
pub const HEALTH_PASSING: &str = "passing";
pub const HEALTH_WARNING: &str = "warning";
pub const HEALTH_CRITICAL: &str = "critical";
pub const HEALTH_MAINT: &str = "maintenance";

// Maintenance check identifiers
pub const NODE_MAINT: &str = "_node_maintenance";
pub const SERVICE_MAINT_PREFIX: &str = "_service_maintenance:";

// Service health check registered by `register`
pub const HEALTH_CHECK_NAME_PREFIX: &str = "Health Check: ";
pub const HEALTH_CHECK_NOTES: &str = "Check the health of the API";

/// Extra time allowed on top of the blocking query wait before the request times out
pub const BLOCKING_QUERY_MARGIN_MS: u64 = 5000;
