//! Probe error types.

use std::time::Duration;

use thiserror::Error;

/// Why a single liveness probe did not report healthy.
///
/// Probe errors are evidence, not faults: the controller accumulates them
/// toward a verdict instead of propagating them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// No response within the probe timeout.
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// Connection could not be established or was reset.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The endpoint answered with a non-2xx status.
    #[error("unhealthy status {0}")]
    Status(u16),

    /// The request could not be built or sent.
    #[error("request failed: {0}")]
    Request(String),

    /// No endpoint configured for the probed group.
    #[error("no probe target for {0}")]
    UnknownTarget(String),
}
