//! Traffic router seam and the in-memory router.
//!
//! `MemoryRouter` keeps the whole weight map behind a single `Arc` and
//! replaces it wholesale on every change, so a reader sees either the old
//! map or the new one, never a mix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::RouterResult;
use crate::split::{TrafficSplit, WeightMap};

/// Applies traffic splits to a reverse proxy.
///
/// `apply_split` is atomic from the point of view of new requests and
/// fails closed: on error, the previous split stays in effect.
/// Applying the split that is already active is a no-op.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    async fn apply_split(
        &self,
        service: &str,
        stable_weight: u8,
        canary_weight: u8,
    ) -> RouterResult<()>;

    /// Split currently in effect. `None` if the service was never configured.
    async fn current_split(&self, service: &str) -> Option<TrafficSplit>;

    /// Snapshot of every configured split.
    async fn weight_map(&self) -> WeightMap;
}

/// In-process router that publishes weight maps by pointer swap.
pub struct MemoryRouter {
    map: RwLock<Arc<WeightMap>>,
    /// Bumped on every published change.
    generation: AtomicU64,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(Arc::new(WeightMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Current published map.
    pub fn snapshot(&self) -> Arc<WeightMap> {
        self.map.read().expect("weight map lock").clone()
    }

    /// Number of changes published so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn publish(&self, service: &str, split: TrafficSplit) -> bool {
        let mut guard = self.map.write().expect("weight map lock");
        if guard.get(service) == Some(&split) {
            return false;
        }
        let mut next = WeightMap::clone(&guard);
        next.insert(service.to_string(), split);
        *guard = Arc::new(next);
        self.generation.fetch_add(1, Ordering::AcqRel);
        true
    }
}

impl Default for MemoryRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrafficRouter for MemoryRouter {
    async fn apply_split(
        &self,
        service: &str,
        stable_weight: u8,
        canary_weight: u8,
    ) -> RouterResult<()> {
        let split = TrafficSplit::new(stable_weight, canary_weight)?;
        if self.publish(service, split) {
            debug!(service, %split, "traffic split published");
        }
        Ok(())
    }

    async fn current_split(&self, service: &str) -> Option<TrafficSplit> {
        self.snapshot().get(service).copied()
    }

    async fn weight_map(&self) -> WeightMap {
        WeightMap::clone(&self.snapshot())
    }
}
