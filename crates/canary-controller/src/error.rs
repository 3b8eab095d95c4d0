use canary_router::RouterError;
use canary_state::{ReleasePhase, StateError};

/// Errors returned to callers of the canary controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("rollout already in progress for {service} (phase {phase})")]
    RolloutInProgress { service: String, phase: ReleasePhase },

    #[error("service {service} is degraded: {reason}")]
    Degraded { service: String, reason: String },

    #[error("invalid rollout request: {0}")]
    InvalidRequest(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("no active rollout for {0}")]
    NoActiveRollout(String),

    #[error("cannot {action} {service} while {phase}")]
    InvalidPhase {
        service: String,
        phase: ReleasePhase,
        action: &'static str,
    },

    #[error("resolve already in progress for {0}")]
    ResolveInProgress(String),

    #[error("rollout for {0} was interrupted before it concluded")]
    Interrupted(String),

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("router error: {0}")]
    Router(#[from] RouterError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Failure to publish an evidence bundle.
#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
