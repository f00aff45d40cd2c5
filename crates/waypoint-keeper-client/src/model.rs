// Keeper wire types for the registry resource

use serde::{Deserialize, Serialize};

use crate::constants::API_VERSION;

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Health check attached to a registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    #[serde(default)]
    pub interval: String,

    #[serde(default)]
    pub path: String,

    #[serde(rename = "type", default)]
    pub check_type: String,
}

/// A service registration as stored by Keeper
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationDTO {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub created: i64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub modified: i64,

    pub service_id: String,

    /// UP, DOWN or empty until the first check has run
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub health_check: HealthCheck,

    #[serde(default)]
    pub last_connected: i64,
}

/// POST/PUT /api/v2/registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRegistrationRequest {
    pub api_version: String,

    #[serde(default)]
    pub request_id: String,

    pub registration: RegistrationDTO,
}

impl AddRegistrationRequest {
    pub fn new(registration: RegistrationDTO) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            registration,
        }
    }
}

/// Common envelope of every Keeper response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseResponse {
    #[serde(default)]
    pub api_version: String,

    #[serde(default)]
    pub request_id: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub status_code: u16,
}

/// GET /api/v2/registry/serviceId/{id}
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationResponse {
    #[serde(flatten)]
    pub base: BaseResponse,

    pub registration: RegistrationDTO,
}

/// GET /api/v2/registry/all
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiRegistrationsResponse {
    #[serde(flatten)]
    pub base: BaseResponse,

    #[serde(default)]
    pub total_count: u32,

    /// Keeper sends `null` when nothing is registered
    #[serde(default)]
    pub registrations: Option<Vec<RegistrationDTO>>,
}
