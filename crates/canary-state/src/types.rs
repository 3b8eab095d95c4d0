//! Domain types for canary releases.
//!
//! These types describe the per-service release record, the instance
//! groups a release is made of, and the audit trail of rollout attempts.
//! All types serialize to JSON, both for storage in redb and for the API.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Name of a managed service (e.g. `"account"`).
pub type ServiceName = String;

/// Unique identifier of a rollout attempt.
pub type RolloutId = String;

// ── Instance groups ────────────────────────────────────────────────

/// Which of the two instance groups of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Stable,
    Canary,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Canary => "canary",
        }
    }
}

impl fmt::Display for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of an instance group as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// A named, versioned set of running instances of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceGroup {
    pub service: ServiceName,
    pub role: GroupRole,
    pub tag: String,
    pub replica_count: u32,
    pub health: HealthStatus,
}

// ── Service release ────────────────────────────────────────────────

/// Phase of the per-service release state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePhase {
    /// No canary active, all traffic on stable.
    #[default]
    Idle,
    /// Canary group is being brought up.
    Provisioning,
    /// Traffic is split and the health gate is running (or holding).
    Evaluating,
    /// Canary is replacing the stable group.
    Promoting,
    /// Canary is being discarded.
    RollingBack,
    /// Automatic progress halted; operator must resolve.
    Degraded,
}

impl ReleasePhase {
    /// Phases in which a rollout owns the service.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Provisioning | Self::Evaluating | Self::Promoting | Self::RollingBack
        )
    }
}

impl fmt::Display for ReleasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning",
            Self::Evaluating => "evaluating",
            Self::Promoting => "promoting",
            Self::RollingBack => "rolling_back",
            Self::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Why a service is held in `Degraded`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DegradedState {
    /// Tag that should become stable once the operator resolves, if any.
    pub pending_tag: Option<String>,
    pub reason: String,
    pub since_ms: u64,
}

/// Release record for one managed service.
///
/// `canary_tag` is set exactly while the phase is active, and
/// `traffic_split` is zero whenever the phase is `Idle`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRelease {
    pub service: ServiceName,
    /// Last known-good version.
    pub stable_tag: String,
    /// Version under evaluation.
    pub canary_tag: Option<String>,
    /// Percentage of traffic routed to the canary (0-100).
    pub traffic_split: u8,
    /// Canary weight the active rollout asked for. Zero when idle.
    #[serde(default)]
    pub requested_weight: u8,
    pub phase: ReleasePhase,
    pub active_rollout: Option<RolloutId>,
    pub degraded: Option<DegradedState>,
    pub updated_at_ms: u64,
}

impl ServiceRelease {
    /// A fresh, idle release for a service.
    pub fn new(service: &str, stable_tag: &str) -> Self {
        Self {
            service: service.to_string(),
            stable_tag: stable_tag.to_string(),
            canary_tag: None,
            traffic_split: 0,
            requested_weight: 0,
            phase: ReleasePhase::Idle,
            active_rollout: None,
            degraded: None,
            updated_at_ms: epoch_millis(),
        }
    }

    /// Whether the release satisfies the phase/canary/split invariants.
    pub fn is_consistent(&self) -> bool {
        let canary_ok = self.canary_tag.is_some() == self.phase.is_active();
        let split_ok = self.phase != ReleasePhase::Idle || self.traffic_split == 0;
        let degraded_ok = self.degraded.is_some() == (self.phase == ReleasePhase::Degraded);
        canary_ok && split_ok && degraded_ok && self.traffic_split <= 100
    }

    /// Return to `Idle`: canary cleared, traffic on stable.
    pub fn settle(&mut self) {
        self.canary_tag = None;
        self.traffic_split = 0;
        self.requested_weight = 0;
        self.phase = ReleasePhase::Idle;
        self.active_rollout = None;
        self.degraded = None;
        self.touch();
    }

    /// Enter `Degraded`, dropping the canary reference.
    pub fn degrade(&mut self, pending_tag: Option<String>, reason: &str) {
        self.canary_tag = None;
        self.phase = ReleasePhase::Degraded;
        self.active_rollout = None;
        self.degraded = Some(DegradedState {
            pending_tag,
            reason: reason.to_string(),
            since_ms: epoch_millis(),
        });
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at_ms = epoch_millis();
    }
}

// ── Rollout requests and records ───────────────────────────────────

/// A rollout request as supplied by CI or an operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutRequest {
    pub service_name: ServiceName,
    pub new_version_tag: String,
    /// Percentage of traffic for the canary (0-100).
    #[serde(default = "default_canary_weight")]
    pub canary_weight: u8,
    #[serde(default = "default_true")]
    pub enable_canary: bool,
    #[serde(default)]
    pub promote: bool,
}

fn default_canary_weight() -> u8 {
    10
}

fn default_true() -> bool {
    true
}

impl RolloutRequest {
    pub fn new(service: &str, tag: &str, canary_weight: u8) -> Self {
        Self {
            service_name: service.to_string(),
            new_version_tag: tag.to_string(),
            canary_weight,
            enable_canary: true,
            promote: false,
        }
    }

    pub fn with_promote(mut self, promote: bool) -> Self {
        self.promote = promote;
        self
    }

    pub fn with_canary(mut self, enable: bool) -> Self {
        self.enable_canary = enable;
        self
    }

    /// Check the request is well-formed. Returns a human-readable reason.
    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.trim().is_empty() {
            return Err("service name must not be empty".to_string());
        }
        if self.new_version_tag.trim().is_empty() {
            return Err("version tag must not be empty".to_string());
        }
        if self.new_version_tag.chars().any(char::is_whitespace) {
            return Err(format!("invalid version tag {:?}", self.new_version_tag));
        }
        if self.canary_weight > 100 {
            return Err(format!(
                "canary weight {} out of range 0-100",
                self.canary_weight
            ));
        }
        Ok(())
    }
}

/// Terminal result of a rollout attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutOutcome {
    /// The new tag became stable.
    Promoted,
    /// Traffic was shifted and then restored to stable.
    RolledBack,
    /// Stopped before any traffic was shifted.
    Aborted,
    /// Halted for operator intervention.
    Degraded,
}

impl fmt::Display for RolloutOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Promoted => "promoted",
            Self::RolledBack => "rolled_back",
            Self::Aborted => "aborted",
            Self::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// One health observation captured during evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSample {
    pub role: GroupRole,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub at_ms: u64,
}

/// Post-mortem material attached to a failed rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FailureEvidence {
    /// Key under which the full bundle was published to the evidence sink.
    pub bundle_key: String,
    /// Last log lines of the canary group.
    pub logs: Vec<String>,
    /// Most recent health samples, oldest first.
    pub health_history: Vec<HealthSample>,
    /// Set when log capture itself failed.
    pub capture_error: Option<String>,
}

/// Audit entry for one rollout attempt. Sealed once an outcome is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutRecord {
    pub id: RolloutId,
    pub service: ServiceName,
    pub from_tag: String,
    pub to_tag: String,
    pub requested_weight: u8,
    pub enable_canary: bool,
    pub promote: bool,
    pub outcome: Option<RolloutOutcome>,
    pub reason: Option<String>,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub failure_evidence: Option<FailureEvidence>,
}

static ROLLOUT_SEQ: AtomicU64 = AtomicU64::new(0);

impl RolloutRecord {
    /// Open a record at rollout start.
    pub fn open(request: &RolloutRequest, from_tag: &str) -> Self {
        let started_at_ms = epoch_millis();
        let seq = ROLLOUT_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("{}-{started_at_ms}-{seq}", request.service_name),
            service: request.service_name.clone(),
            from_tag: from_tag.to_string(),
            to_tag: request.new_version_tag.clone(),
            requested_weight: request.canary_weight,
            enable_canary: request.enable_canary,
            promote: request.promote,
            outcome: None,
            reason: None,
            started_at_ms,
            finished_at_ms: None,
            failure_evidence: None,
        }
    }

    /// Record the terminal outcome. A sealed record is left untouched.
    pub fn seal(&mut self, outcome: RolloutOutcome, reason: Option<String>) {
        if self.is_sealed() {
            return;
        }
        self.outcome = Some(outcome);
        self.reason = reason;
        self.finished_at_ms = Some(epoch_millis());
    }

    pub fn is_sealed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Storage key; orders records per service by start time.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.service, self.started_at_ms, self.id)
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
