//! Instance group error types.

use canary_state::GroupRole;
use thiserror::Error;

/// Result type alias for instance group operations.
pub type InstanceResult<T> = Result<T, InstanceError>;

/// Errors raised by an instance group manager.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The group failed to start (image pull failure, crash loop, ...).
    #[error("failed to provision {service}/{role}: {reason}")]
    Provision {
        service: String,
        role: GroupRole,
        reason: String,
    },

    #[error("{service}/{role} is not provisioned")]
    NotProvisioned { service: String, role: GroupRole },

    /// A backend command failed outside of provisioning.
    #[error("command failed: {0}")]
    Command(String),
}

impl InstanceError {
    pub fn provision(service: &str, role: GroupRole, reason: impl Into<String>) -> Self {
        Self::Provision {
            service: service.to_string(),
            role,
            reason: reason.into(),
        }
    }
}
