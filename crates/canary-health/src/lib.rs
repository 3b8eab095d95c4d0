//! canary-health — liveness probing for canary and stable groups.
//!
//! Provides a single-shot HTTP probe, the [`HealthProber`] seam the
//! controller polls through, and a [`HealthTracker`] that turns a stream of
//! probe results into a verdict after a run of consecutive failures.
//!
//! # Architecture
//!
//! ```text
//! HealthProber (trait)
//!   └── HttpProber
//!       ├── per-service stable/canary endpoints
//!       └── http_probe() → HealthResult { status, latency, error }
//! HealthTracker (consecutive failures → Unhealthy)
//! ```
//!
//! Probes never retry. Retry cadence and thresholds belong to the caller.

pub mod checker;
pub mod error;
pub mod prober;

pub use checker::{parse_duration, HealthTracker};
pub use error::ProbeError;
pub use prober::{GroupEndpoints, GroupRef, HealthProber, HealthResult, HttpProber};
