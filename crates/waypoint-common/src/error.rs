//! Error types shared by every registry client
//!
//! `RegistryError` is returned by all remote operations. Authorization-class
//! failures are recognised by [`RegistryError::is_access_denied`] so the token
//! retry wrapper can decide whether a renewal is worth attempting.

/// Errors that can occur during registry client operations
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("access denied with status {status}: {message}")]
    AccessDenied { status: u16, message: String },

    #[error("failed to renew access token: {0}")]
    TokenRenewal(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0} service is not registered. Might not have started... ")]
    ServiceNotRegistered(String),

    #[error("{0} service not healthy...")]
    ServiceNotHealthy(String),

    #[error("no health checks found for {0}")]
    NoHealthChecks(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("{operation} is not supported by the {registry} registry")]
    Unsupported {
        registry: &'static str,
        operation: &'static str,
    },

    #[error("unknown registry type '{0}'")]
    UnknownRegistryType(String),

    #[error("registry client is closed")]
    Closed,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RegistryError {
    /// Build an error from a non-success HTTP status, classifying 401/403 as access denied
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => RegistryError::AccessDenied { status, message },
            _ => RegistryError::Status { status, message },
        }
    }

    /// Whether the failure was an authorization rejection (401/403)
    pub fn is_access_denied(&self) -> bool {
        match self {
            RegistryError::AccessDenied { .. } => true,
            RegistryError::Transport(e) => e
                .status()
                .is_some_and(|s| s.as_u16() == 401 || s.as_u16() == 403),
            _ => false,
        }
    }

    /// Whether the failure came from the network layer rather than the registry
    pub fn is_transport(&self) -> bool {
        matches!(self, RegistryError::Transport(_))
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::Status {
            status: 500,
            message: "internal error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "request failed with status 500: internal error"
        );

        let err = RegistryError::ServiceNotRegistered("core-data".to_string());
        assert_eq!(
            err.to_string(),
            "core-data service is not registered. Might not have started... "
        );

        let err = RegistryError::Unsupported {
            registry: "keeper",
            operation: "has_configuration",
        };
        assert_eq!(
            err.to_string(),
            "has_configuration is not supported by the keeper registry"
        );

        assert_eq!(RegistryError::Closed.to_string(), "registry client is closed");
    }

    #[test]
    fn test_from_status_classifies_auth() {
        assert!(RegistryError::from_status(401, "").is_access_denied());
        assert!(RegistryError::from_status(403, "ACL not found").is_access_denied());
        assert!(!RegistryError::from_status(404, "").is_access_denied());
        assert!(!RegistryError::from_status(500, "").is_access_denied());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: RegistryError = json_err.into();
        assert!(matches!(err, RegistryError::Decode(_)));
    }
}
