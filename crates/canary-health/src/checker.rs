//! Consecutive-failure tracking and duration parsing.
//!
//! A single failed probe is not a verdict. The tracker marks a group
//! unhealthy only after `unhealthy_threshold` failures in a row, so cold
//! starts and transient blips do not end an evaluation.

use std::time::Duration;

use tracing::{debug, warn};

use canary_state::HealthStatus;

/// Tracks consecutive probe results for a single instance group.
///
/// One success makes the group healthy again and resets the failure run.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    /// Failures in a row before marking unhealthy.
    unhealthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Record whether a probe succeeded and return the new health status.
    pub fn record(&mut self, healthy: bool) -> HealthStatus {
        if healthy {
            if self.status == HealthStatus::Unhealthy {
                debug!(
                    failures = self.consecutive_failures,
                    "group recovered to healthy"
                );
            }
            self.consecutive_failures = 0;
            self.status = HealthStatus::Healthy;
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.unhealthy_threshold {
                if self.status != HealthStatus::Unhealthy {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "group marked unhealthy"
                    );
                }
                self.status = HealthStatus::Unhealthy;
            }
        }

        self.status
    }

    /// Last status returned by [`HealthTracker::record`].
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    /// Current number of consecutive failures.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Parse a duration string like "5s", "500ms", "2m".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
