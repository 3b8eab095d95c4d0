//! Traffic split — the weight contract between controller and proxy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RouterError, RouterResult};

/// Percentage of traffic sent to each group of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub stable_weight: u8,
    pub canary_weight: u8,
}

impl TrafficSplit {
    /// Build a split, rejecting weights that do not sum to 100.
    pub fn new(stable_weight: u8, canary_weight: u8) -> RouterResult<Self> {
        let split = Self {
            stable_weight,
            canary_weight,
        };
        split.validate()?;
        Ok(split)
    }

    /// Everything to stable. Always valid.
    pub fn all_stable() -> Self {
        Self {
            stable_weight: 100,
            canary_weight: 0,
        }
    }

    pub fn validate(&self) -> RouterResult<()> {
        if u16::from(self.stable_weight) + u16::from(self.canary_weight) != 100 {
            return Err(RouterError::InvalidSplit {
                stable: self.stable_weight,
                canary: self.canary_weight,
            });
        }
        Ok(())
    }

    pub fn is_all_stable(&self) -> bool {
        self.canary_weight == 0
    }
}

impl Default for TrafficSplit {
    fn default() -> Self {
        Self::all_stable()
    }
}

impl std::fmt::Display for TrafficSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stable_weight, self.canary_weight)
    }
}

/// Declarative routing state: service name → split. Ordered for stable rendering.
pub type WeightMap = BTreeMap<String, TrafficSplit>;
