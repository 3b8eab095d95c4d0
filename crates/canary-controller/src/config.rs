//! Controller configuration.
//!
//! Durations are kept as strings (`"5s"`, `"500ms"`, `"2m"`) so the
//! struct deserializes straight from the daemon's TOML file; accessors
//! parse them and fall back to the defaults on malformed input.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use canary_health::parse_duration;

/// What to do when evaluation hits `max_duration` without a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Stay in `Evaluating` until an operator promotes or rolls back.
    #[default]
    Hold,
    /// Treat the evaluation as passed.
    Conclude,
}

/// Health gate and component-call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Delay between probe rounds.
    pub interval: String,
    /// How long the canary must stay healthy.
    pub window: String,
    /// Timeout for a single probe.
    pub probe_timeout: String,
    /// Hard ceiling on evaluation wall-clock time.
    pub max_duration: String,
    /// Consecutive failed probes that make a group unhealthy.
    pub failure_threshold: u32,
    pub on_timeout: TimeoutPolicy,
    /// Bound for every provision, route and teardown call.
    pub operation_timeout: String,
    /// Attempts for `ensure` before giving up.
    pub provision_attempts: u32,
    /// Pause between retried component calls.
    pub retry_backoff: String,
    /// Log lines captured from the canary on rollback.
    pub evidence_log_lines: usize,
    /// Health samples kept for evidence.
    pub health_history: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            window: "60s".to_string(),
            probe_timeout: "2s".to_string(),
            max_duration: "5m".to_string(),
            failure_threshold: 2,
            on_timeout: TimeoutPolicy::Hold,
            operation_timeout: "2m".to_string(),
            provision_attempts: 2,
            retry_backoff: "1s".to_string(),
            evidence_log_lines: 100,
            health_history: 20,
        }
    }
}

impl EvaluationConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn window(&self) -> Duration {
        parse_duration(&self.window).unwrap_or(Duration::from_secs(60))
    }

    pub fn probe_timeout(&self) -> Duration {
        parse_duration(&self.probe_timeout).unwrap_or(Duration::from_secs(2))
    }

    pub fn max_duration(&self) -> Duration {
        parse_duration(&self.max_duration).unwrap_or(Duration::from_secs(300))
    }

    pub fn operation_timeout(&self) -> Duration {
        parse_duration(&self.operation_timeout).unwrap_or(Duration::from_secs(120))
    }

    pub fn retry_backoff(&self) -> Duration {
        parse_duration(&self.retry_backoff).unwrap_or(Duration::from_secs(1))
    }

    /// Probe rounds that make up a full window. At least one.
    pub fn required_checks(&self) -> u32 {
        let interval = self.interval().as_millis().max(1);
        let checks = self.window().as_millis().div_ceil(interval);
        checks.clamp(1, u128::from(u32::MAX)) as u32
    }

    /// Check every field parses and the thresholds make sense.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("interval", &self.interval),
            ("window", &self.window),
            ("probe_timeout", &self.probe_timeout),
            ("max_duration", &self.max_duration),
            ("operation_timeout", &self.operation_timeout),
            ("retry_backoff", &self.retry_backoff),
        ] {
            if parse_duration(value).is_none() {
                return Err(format!("evaluation.{name}: invalid duration {value:?}"));
            }
        }
        if self.interval().is_zero() {
            return Err("evaluation.interval must be greater than zero".to_string());
        }
        if self.interval() > self.window() {
            return Err("evaluation.interval must not exceed evaluation.window".to_string());
        }
        if self.window() > self.max_duration() {
            return Err("evaluation.window must not exceed evaluation.max_duration".to_string());
        }
        if self.failure_threshold == 0 {
            return Err("evaluation.failure_threshold must be at least 1".to_string());
        }
        if self.provision_attempts == 0 {
            return Err("evaluation.provision_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Controller settings: the gate plus the managed services.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub evaluation: EvaluationConfig,
    /// Replica count per managed service. Empty means any service is accepted.
    pub services: BTreeMap<String, u32>,
}

impl ControllerConfig {
    pub fn new(evaluation: EvaluationConfig) -> Self {
        Self {
            evaluation,
            services: BTreeMap::new(),
        }
    }

    pub fn with_service(mut self, service: &str, replicas: u32) -> Self {
        self.services.insert(service.to_string(), replicas.max(1));
        self
    }

    pub fn is_known(&self, service: &str) -> bool {
        self.services.is_empty() || self.services.contains_key(service)
    }

    pub fn replicas(&self, service: &str) -> u32 {
        self.services.get(service).copied().unwrap_or(1)
    }
}
