//! Instance group manager seam and the in-process backend.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use canary_state::{GroupRole, HealthStatus, InstanceGroup};

use crate::error::{InstanceError, InstanceResult};

/// Starts, stops, and queries the instance groups of a service.
#[async_trait]
pub trait InstanceGroupManager: Send + Sync {
    /// Make `role` run `replicas` instances of `tag`.
    ///
    /// No-op when the group already matches; otherwise a rolling replace.
    async fn ensure(
        &self,
        service: &str,
        role: GroupRole,
        tag: &str,
        replicas: u32,
    ) -> InstanceResult<()>;

    /// Tag the group is running, or `NotProvisioned`.
    async fn current_tag(&self, service: &str, role: GroupRole) -> InstanceResult<String>;

    /// Remove the group. Removing an absent group succeeds.
    async fn teardown(&self, service: &str, role: GroupRole) -> InstanceResult<()>;

    /// Last `lines` log lines of the group, oldest first.
    async fn logs(&self, service: &str, role: GroupRole, lines: usize)
    -> InstanceResult<Vec<String>>;

    /// Attach the latest gate verdict to the group. Ignored for absent groups.
    ///
    /// A rolling replace resets the group to `Unknown`.
    async fn record_health(
        &self,
        service: &str,
        role: GroupRole,
        status: HealthStatus,
    ) -> InstanceResult<()>;

    /// Current shape and health of the group, or `NotProvisioned`.
    async fn describe(&self, service: &str, role: GroupRole) -> InstanceResult<InstanceGroup>;
}

/// Per-group bookkeeping for the local backend.
#[derive(Debug, Clone)]
struct LocalGroup {
    tag: String,
    replicas: u32,
    health: HealthStatus,
    log: Vec<String>,
}

/// In-process instance groups.
///
/// Tags registered with [`LocalGroupManager::with_broken_tag`] fail to
/// provision, which simulates a crash-looping image.
#[derive(Default)]
pub struct LocalGroupManager {
    groups: RwLock<HashMap<(String, GroupRole), LocalGroup>>,
    broken_tags: RwLock<HashSet<String>>,
    replacements: AtomicU64,
}

impl LocalGroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `ensure` at `tag` fail.
    pub fn with_broken_tag(self, tag: &str) -> Self {
        self.break_tag(tag);
        self
    }

    pub fn break_tag(&self, tag: &str) {
        self.broken_tags
            .write()
            .expect("broken tags lock")
            .insert(tag.to_string());
    }

    /// Snapshot of a group, if it exists.
    pub fn group(&self, service: &str, role: GroupRole) -> Option<InstanceGroup> {
        let groups = self.groups.read().expect("groups lock");
        groups
            .get(&(service.to_string(), role))
            .map(|g| InstanceGroup {
                service: service.to_string(),
                role,
                tag: g.tag.clone(),
                replica_count: g.replicas,
                health: g.health,
            })
    }

    /// Number of rolling replaces performed so far.
    pub fn replacements(&self) -> u64 {
        self.replacements.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl InstanceGroupManager for LocalGroupManager {
    async fn ensure(
        &self,
        service: &str,
        role: GroupRole,
        tag: &str,
        replicas: u32,
    ) -> InstanceResult<()> {
        let key = (service.to_string(), role);

        if let Some(existing) = self.groups.read().expect("groups lock").get(&key) {
            if existing.tag == tag && existing.replicas == replicas {
                debug!(service, %role, tag, "group already at target");
                return Ok(());
            }
        }

        if self
            .broken_tags
            .read()
            .expect("broken tags lock")
            .contains(tag)
        {
            warn!(service, %role, tag, "instance crash-looped on start");
            return Err(InstanceError::provision(
                service,
                role,
                format!("{tag} exited during startup"),
            ));
        }

        let mut groups = self.groups.write().expect("groups lock");
        let mut log = groups.remove(&key).map(|g| g.log).unwrap_or_default();
        for index in 0..replicas {
            log.push(format!("{service}-{role}-{index}: started {tag}"));
        }
        groups.insert(
            key,
            LocalGroup {
                tag: tag.to_string(),
                replicas,
                health: HealthStatus::Unknown,
                log,
            },
        );
        self.replacements.fetch_add(1, Ordering::Relaxed);

        info!(service, %role, tag, replicas, "group replaced");
        Ok(())
    }

    async fn current_tag(&self, service: &str, role: GroupRole) -> InstanceResult<String> {
        self.groups
            .read()
            .expect("groups lock")
            .get(&(service.to_string(), role))
            .map(|g| g.tag.clone())
            .ok_or_else(|| InstanceError::NotProvisioned {
                service: service.to_string(),
                role,
            })
    }

    async fn teardown(&self, service: &str, role: GroupRole) -> InstanceResult<()> {
        let removed = self
            .groups
            .write()
            .expect("groups lock")
            .remove(&(service.to_string(), role));
        if removed.is_some() {
            info!(service, %role, "group torn down");
        }
        Ok(())
    }

    async fn logs(
        &self,
        service: &str,
        role: GroupRole,
        lines: usize,
    ) -> InstanceResult<Vec<String>> {
        let groups = self.groups.read().expect("groups lock");
        let log = groups
            .get(&(service.to_string(), role))
            .map(|g| g.log.clone())
            .unwrap_or_default();
        let skip = log.len().saturating_sub(lines);
        Ok(log.into_iter().skip(skip).collect())
    }

    async fn record_health(
        &self,
        service: &str,
        role: GroupRole,
        status: HealthStatus,
    ) -> InstanceResult<()> {
        if let Some(group) = self
            .groups
            .write()
            .expect("groups lock")
            .get_mut(&(service.to_string(), role))
        {
            group.health = status;
        }
        Ok(())
    }

    async fn describe(&self, service: &str, role: GroupRole) -> InstanceResult<InstanceGroup> {
        self.group(service, role)
            .ok_or_else(|| InstanceError::NotProvisioned {
                service: service.to_string(),
                role,
            })
    }
}
