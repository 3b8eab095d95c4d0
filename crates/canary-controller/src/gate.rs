//! Health gate — the bounded probe loop run while a canary is evaluated.
//!
//! Each round probes the stable and canary groups concurrently and feeds
//! the results into one [`HealthTracker`] per group. The gate ends on the
//! first unhealthy verdict, once the canary has been healthy for a full
//! window, when the wall-clock ceiling is hit, or when an operator command
//! arrives between rounds.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use canary_health::{GroupRef, HealthProber, HealthResult, HealthTracker, ProbeError};
use canary_state::{GroupRole, HealthSample, HealthStatus, epoch_millis};

use crate::config::EvaluationConfig;

/// Operator decision delivered to a running rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorCommand {
    Promote,
    Rollback,
}

/// Per-rollout control channel. `None` until an operator acts.
pub type ControlReceiver = watch::Receiver<Option<OperatorCommand>>;

/// How a gate run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    /// Canary stayed healthy for the whole window.
    Passed,
    CanaryUnhealthy(String),
    /// The baseline itself failed; there is nothing to compare against.
    StableUnhealthy(String),
    /// `max_duration` elapsed without a verdict.
    TimedOut,
    Command(OperatorCommand),
    /// The control channel was dropped.
    Closed,
}

pub struct HealthGate {
    prober: Arc<dyn HealthProber>,
    service: String,
    config: EvaluationConfig,
    stable: HealthTracker,
    canary: HealthTracker,
    last_error: [Option<String>; 2],
    history: VecDeque<HealthSample>,
    checks: u32,
}

impl HealthGate {
    pub fn new(prober: Arc<dyn HealthProber>, service: &str, config: &EvaluationConfig) -> Self {
        Self {
            prober,
            service: service.to_string(),
            config: config.clone(),
            stable: HealthTracker::new(config.failure_threshold),
            canary: HealthTracker::new(config.failure_threshold),
            last_error: [None, None],
            history: VecDeque::new(),
            checks: 0,
        }
    }

    /// Probe rounds completed so far.
    pub fn checks(&self) -> u32 {
        self.checks
    }

    /// Most recent samples, oldest first.
    pub fn history(&self) -> Vec<HealthSample> {
        self.history.iter().cloned().collect()
    }

    /// Current verdict for one group; `Unknown` before the first round.
    pub fn status(&self, role: GroupRole) -> HealthStatus {
        match role {
            GroupRole::Stable => self.stable.status(),
            GroupRole::Canary => self.canary.status(),
        }
    }

    pub async fn run(&mut self, control: &mut ControlReceiver) -> GateVerdict {
        let deadline = Instant::now() + self.config.max_duration();
        let required = self.config.required_checks();
        let interval = self.config.interval();

        loop {
            if let Some(command) = *control.borrow_and_update() {
                return GateVerdict::Command(command);
            }
            if Instant::now() >= deadline {
                return GateVerdict::TimedOut;
            }

            let stable_ref = GroupRef::new(&self.service, GroupRole::Stable);
            let canary_ref = GroupRef::new(&self.service, GroupRole::Canary);
            let (stable, canary) = tokio::join!(self.probe(&stable_ref), self.probe(&canary_ref));
            let stable_status = self.observe(GroupRole::Stable, stable);
            let canary_status = self.observe(GroupRole::Canary, canary);
            self.checks += 1;

            if stable_status == HealthStatus::Unhealthy {
                return GateVerdict::StableUnhealthy(self.verdict_reason(GroupRole::Stable));
            }
            if canary_status == HealthStatus::Unhealthy {
                return GateVerdict::CanaryUnhealthy(self.verdict_reason(GroupRole::Canary));
            }
            if self.checks >= required && self.canary.consecutive_failures() == 0 {
                return GateVerdict::Passed;
            }

            debug!(
                service = %self.service,
                checks = self.checks,
                required,
                canary_failures = self.canary.consecutive_failures(),
                stable_failures = self.stable.consecutive_failures(),
                "health gate round complete"
            );

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = control.changed() => {
                    if changed.is_err() {
                        return GateVerdict::Closed;
                    }
                }
            }
        }
    }

    async fn probe(&self, group: &GroupRef) -> HealthResult {
        let timeout = self.config.probe_timeout();
        let started = Instant::now();
        // Bound the prober too, in case it ignores its own timeout.
        match tokio::time::timeout(timeout, self.prober.probe(group, timeout)).await {
            Ok(result) => result,
            Err(_) => HealthResult::unhealthy(started.elapsed(), ProbeError::Timeout(timeout)),
        }
    }

    fn observe(&mut self, role: GroupRole, result: HealthResult) -> HealthStatus {
        let tracker = match role {
            GroupRole::Stable => &mut self.stable,
            GroupRole::Canary => &mut self.canary,
        };
        let status = tracker.record(result.is_healthy());
        let error = result.error.as_ref().map(ToString::to_string);
        if error.is_some() {
            self.last_error[role_index(role)] = error.clone();
        }

        self.history.push_back(HealthSample {
            role,
            status: result.status,
            latency_ms: result.latency.as_millis() as u64,
            error,
            at_ms: epoch_millis(),
        });
        while self.history.len() > self.config.health_history.max(1) {
            self.history.pop_front();
        }
        status
    }

    fn verdict_reason(&self, role: GroupRole) -> String {
        let tracker = match role {
            GroupRole::Stable => &self.stable,
            GroupRole::Canary => &self.canary,
        };
        let last = self.last_error[role_index(role)]
            .as_deref()
            .unwrap_or("unhealthy");
        format!(
            "{role} group failed {} consecutive probes (last: {last})",
            tracker.consecutive_failures()
        )
    }
}

fn role_index(role: GroupRole) -> usize {
    match role {
        GroupRole::Stable => 0,
        GroupRole::Canary => 1,
    }
}

/// Block until an operator command arrives. `None` if the channel closes.
pub async fn wait_for_command(control: &mut ControlReceiver) -> Option<OperatorCommand> {
    loop {
        if let Some(command) = *control.borrow_and_update() {
            return Some(command);
        }
        if control.changed().await.is_err() {
            return None;
        }
    }
}
