//! canary-controller — the canary release state machine.
//!
//! Sequences the instance group manager, traffic router, health prober and
//! release store to take a service from "100% stable" to "100% new
//! version", or back to "100% stable" when the canary fails.
//!
//! # Components
//!
//! - **`controller`** — `CanaryController`: submit, operator commands, recovery
//! - **`gate`** — `HealthGate`: bounded probe loop over both groups
//! - **`evidence`** — post-mortem bundles and the sinks they are shipped to
//! - **`config`** — gate thresholds, timeouts and managed services
//!
//! At most one rollout is active per service. Rollouts for different
//! services run in parallel and share nothing but the collaborators.

pub mod config;
pub mod controller;
pub mod error;
pub mod evidence;
pub mod gate;

pub use config::{ControllerConfig, EvaluationConfig, TimeoutPolicy};
pub use controller::{CanaryController, Components};
pub use error::{ControllerError, ControllerResult, EvidenceError};
pub use evidence::{EvidenceBundle, EvidenceSink, FileEvidenceSink, LogEvidenceSink};
pub use gate::{GateVerdict, HealthGate, OperatorCommand};
