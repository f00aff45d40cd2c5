// Consul wire types used by the agent, health and KV endpoints

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::constants::{
    HEALTH_CRITICAL, HEALTH_MAINT, HEALTH_PASSING, HEALTH_WARNING, NODE_MAINT,
    SERVICE_MAINT_PREFIX,
};

/// Consul KV Pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KVPair {
    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "CreateIndex", default)]
    pub create_index: u64,

    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: u64,

    #[serde(rename = "LockIndex", default)]
    pub lock_index: u64,

    #[serde(rename = "Flags", default)]
    pub flags: u64,

    #[serde(rename = "Value", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>, // Base64 encoded

    #[serde(rename = "Session", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl KVPair {
    /// Create a pair with a raw value, encoding it for the wire
    pub fn new(key: &str, value: &[u8], index: u64) -> Self {
        Self {
            key: key.to_string(),
            create_index: index,
            modify_index: index,
            value: Some(STANDARD.encode(value)),
            ..Default::default()
        }
    }

    /// Decoded value bytes, empty when the key holds no value
    pub fn decoded_value(&self) -> anyhow::Result<Vec<u8>> {
        match &self.value {
            Some(encoded) => Ok(STANDARD.decode(encoded)?),
            None => Ok(Vec::new()),
        }
    }
}

/// Health check definition attached to a registration
/// PUT /v1/agent/service/register and /v1/agent/check/register
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentServiceCheck {
    #[serde(rename = "HTTP", default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,

    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(rename = "Timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Remove the service when the check stays critical this long (e.g. "90m")
    #[serde(
        rename = "DeregisterCriticalServiceAfter",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deregister_critical_service_after: Option<String>,
}

/// Service registration request
/// PUT /v1/agent/service/register
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Address", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(rename = "Port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(rename = "Check", default, skip_serializing_if = "Option::is_none")]
    pub check: Option<AgentServiceCheck>,
}

/// Standalone check registration request
/// PUT /v1/agent/check/register
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCheckRegistration {
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Notes", default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(rename = "ServiceID", default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,

    #[serde(flatten)]
    pub check: AgentServiceCheck,
}

/// Agent service entry
/// GET /v1/agent/services
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Service")]
    pub service: String,

    #[serde(rename = "Port", default)]
    pub port: u16,

    #[serde(rename = "Address", default)]
    pub address: String,
}

/// Health check status
/// GET /v1/health/checks/{service}
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "Node", default)]
    pub node: String,

    #[serde(rename = "CheckID")]
    pub check_id: String,

    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "Status")]
    pub status: String,

    #[serde(rename = "Notes", default)]
    pub notes: String,

    #[serde(rename = "Output", default)]
    pub output: String,

    #[serde(rename = "ServiceID", default)]
    pub service_id: String,

    #[serde(rename = "ServiceName", default)]
    pub service_name: String,
}

/// Combined status of a set of checks.
///
/// Maintenance wins over critical, critical over warning, warning over passing.
/// An unrecognised status yields an empty string.
pub fn aggregated_status(checks: &[HealthCheck]) -> &'static str {
    let (mut warning, mut critical, mut maintenance) = (false, false, false);

    for check in checks {
        if check.check_id == NODE_MAINT || check.check_id.starts_with(SERVICE_MAINT_PREFIX) {
            maintenance = true;
            continue;
        }

        match check.status.to_ascii_lowercase().as_str() {
            HEALTH_PASSING => {}
            HEALTH_WARNING => warning = true,
            HEALTH_CRITICAL => critical = true,
            _ => return "",
        }
    }

    if maintenance {
        HEALTH_MAINT
    } else if critical {
        HEALTH_CRITICAL
    } else if warning {
        HEALTH_WARNING
    } else {
        HEALTH_PASSING
    }
}
