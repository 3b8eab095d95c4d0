//! Canary controller — drives the per-service release state machine.
//!
//! ```text
//! Idle → Provisioning → Evaluating → Promoting  → Idle
//!             │              │
//!             └──────────────┴─────→ RollingBack → Idle
//!                                         │
//!                     (routing or stable write lost) → Degraded
//! ```
//!
//! Each accepted request runs as one task that owns its service until the
//! rollout is sealed. The task issues one bounded component call at a time
//! and records every transition in the release store. Operator commands
//! reach a running task through a per-service watch channel.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use canary_health::HealthProber;
use canary_instances::{InstanceError, InstanceGroupManager};
use canary_router::{TrafficRouter, WeightMap};
use canary_state::{
    FailureEvidence, GroupRole, HealthSample, InstanceGroup, ReleasePhase, ReleaseStore, RolloutId,
    RolloutOutcome, RolloutRecord, RolloutRequest, ServiceRelease,
};

use crate::config::{ControllerConfig, TimeoutPolicy};
use crate::error::{ControllerError, ControllerResult};
use crate::evidence::{EvidenceBundle, EvidenceSink};
use crate::gate::{ControlReceiver, GateVerdict, HealthGate, OperatorCommand, wait_for_command};

/// The collaborators a controller drives.
pub struct Components {
    pub store: Arc<dyn ReleaseStore>,
    pub router: Arc<dyn TrafficRouter>,
    pub instances: Arc<dyn InstanceGroupManager>,
    pub prober: Arc<dyn HealthProber>,
    pub evidence: Arc<dyn EvidenceSink>,
}

/// In-memory view of one service plus the control channel of its rollout.
struct Slot {
    release: ServiceRelease,
    control: watch::Sender<Option<OperatorCommand>>,
    /// Set while an operator resolve owns the service.
    resolving: bool,
}

/// Clears the `resolving` flag of a slot however the resolve ends.
struct ResolveGuard<'a> {
    inner: &'a Inner,
    service: String,
}

impl Drop for ResolveGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self
            .inner
            .slots
            .lock()
            .expect("release slots lock")
            .get_mut(&self.service)
        {
            slot.resolving = false;
        }
    }
}

/// Orchestrates canary rollouts for any number of services.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CanaryController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ReleaseStore>,
    router: Arc<dyn TrafficRouter>,
    instances: Arc<dyn InstanceGroupManager>,
    prober: Arc<dyn HealthProber>,
    evidence: Arc<dyn EvidenceSink>,
    config: ControllerConfig,
    slots: Mutex<HashMap<String, Slot>>,
    records: broadcast::Sender<RolloutRecord>,
}

impl CanaryController {
    pub fn new(components: Components, config: ControllerConfig) -> Self {
        let (records, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                store: components.store,
                router: components.router,
                instances: components.instances,
                prober: components.prober,
                evidence: components.evidence,
                config,
                slots: Mutex::new(HashMap::new()),
                records,
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Accept a rollout and run it in the background.
    ///
    /// Rejections (`RolloutInProgress`, `Degraded`, invalid requests) are
    /// returned synchronously. The sealed record is published on
    /// [`CanaryController::subscribe`] and appended to the history.
    pub fn submit(&self, request: RolloutRequest) -> ControllerResult<RolloutId> {
        let (record, control) = self.inner.claim(&request)?;
        let id = record.id.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.execute(record, request, control).await;
        });
        Ok(id)
    }

    /// Run a rollout to its conclusion and return the sealed record.
    ///
    /// With `promote = false` this waits for an operator command once the
    /// gate passes.
    pub async fn run(&self, request: RolloutRequest) -> ControllerResult<RolloutRecord> {
        let (record, control) = self.inner.claim(&request)?;
        let service = request.service_name.clone();
        let record = self.inner.execute(record, request, control).await;
        if record.is_sealed() {
            Ok(record)
        } else {
            Err(ControllerError::Interrupted(service))
        }
    }

    /// Promote the canary under evaluation, bypassing the remaining gate.
    pub fn promote(&self, service: &str) -> ControllerResult<()> {
        self.inner.command(service, OperatorCommand::Promote)
    }

    /// Abandon the rollout in progress.
    pub fn rollback(&self, service: &str) -> ControllerResult<()> {
        self.inner.command(service, OperatorCommand::Rollback)
    }

    /// Clear `Degraded`: finish the pending stable write, restore routing to
    /// the stable group, and return to `Idle`.
    pub async fn resolve(&self, service: &str) -> ControllerResult<ServiceRelease> {
        self.inner.resolve(service).await
    }

    /// Conclude rollouts interrupted by a restart. Run once before serving.
    pub async fn recover(&self) -> ControllerResult<Vec<RolloutRecord>> {
        self.inner.recover().await
    }

    pub fn release(&self, service: &str) -> ControllerResult<ServiceRelease> {
        self.inner.release(service)
    }

    /// Every known release, ordered by service name.
    pub fn releases(&self) -> ControllerResult<Vec<ServiceRelease>> {
        self.inner.releases()
    }

    /// Sealed rollout records for a service, oldest first.
    pub fn history(&self, service: &str) -> ControllerResult<Vec<RolloutRecord>> {
        Ok(self.inner.store.list_records(service)?)
    }

    /// Instance groups of a service with the health last recorded for them.
    ///
    /// Absent groups are omitted.
    pub async fn groups(&self, service: &str) -> ControllerResult<Vec<InstanceGroup>> {
        self.inner.groups(service).await
    }

    /// Weight map currently applied by the router.
    pub async fn routes(&self) -> WeightMap {
        self.inner.router.weight_map().await
    }

    /// Sealed records as they are produced.
    pub fn subscribe(&self) -> broadcast::Receiver<RolloutRecord> {
        self.inner.records.subscribe()
    }
}

impl Inner {
    // ── Bookkeeping ────────────────────────────────────────────────

    fn load_slot<'a>(
        &self,
        slots: &'a mut HashMap<String, Slot>,
        service: &str,
    ) -> ControllerResult<&'a mut Slot> {
        match slots.entry(service.to_string()) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(vacant) => {
                let release = match self.store.get_release(service)? {
                    Some(release) => release,
                    None => ServiceRelease::new(service, &self.store.get_stable(service)?),
                };
                let (control, _) = watch::channel(None);
                Ok(vacant.insert(Slot {
                    release,
                    control,
                    resolving: false,
                }))
            }
        }
    }

    /// Validate a request and take ownership of its service.
    fn claim(&self, request: &RolloutRequest) -> ControllerResult<(RolloutRecord, ControlReceiver)> {
        request.validate().map_err(ControllerError::InvalidRequest)?;
        let service = request.service_name.as_str();
        if !self.config.is_known(service) {
            return Err(ControllerError::UnknownService(service.to_string()));
        }

        // The store, not the running stable group, is the source of truth.
        let stable_tag = self.store.get_stable(service)?;

        let (record, control, release) = {
            let mut slots = self.slots.lock().expect("release slots lock");
            let slot = self.load_slot(&mut slots, service)?;
            let phase = slot.release.phase;
            if phase.is_active() {
                return Err(ControllerError::RolloutInProgress {
                    service: service.to_string(),
                    phase,
                });
            }
            if phase == ReleasePhase::Degraded {
                let reason = slot
                    .release
                    .degraded
                    .as_ref()
                    .map(|d| d.reason.clone())
                    .unwrap_or_default();
                return Err(ControllerError::Degraded {
                    service: service.to_string(),
                    reason,
                });
            }

            let record = RolloutRecord::open(request, &stable_tag);
            let (sender, control) = watch::channel(None);
            slot.control = sender;

            let release = &mut slot.release;
            release.stable_tag = stable_tag;
            release.canary_tag = Some(request.new_version_tag.clone());
            release.traffic_split = 0;
            release.requested_weight = request.canary_weight;
            release.phase = if request.enable_canary {
                ReleasePhase::Provisioning
            } else {
                ReleasePhase::Promoting
            };
            release.active_rollout = Some(record.id.clone());
            release.degraded = None;
            release.touch();
            (record, control, release.clone())
        };

        self.persist(&release);
        info!(
            service,
            rollout = %record.id,
            from = %record.from_tag,
            to = %record.to_tag,
            weight = request.canary_weight,
            canary = request.enable_canary,
            promote = request.promote,
            "rollout accepted"
        );
        Ok((record, control))
    }

    fn persist(&self, release: &ServiceRelease) {
        if let Err(e) = self.store.put_release(release) {
            warn!(service = %release.service, error = %e, "failed to persist release");
        }
    }

    fn transition(&self, service: &str, update: impl FnOnce(&mut ServiceRelease)) {
        let release = {
            let mut slots = self.slots.lock().expect("release slots lock");
            let Some(slot) = slots.get_mut(service) else {
                warn!(service, "transition for unknown service ignored");
                return;
            };
            update(&mut slot.release);
            slot.release.touch();
            slot.release.clone()
        };
        debug!(
            service,
            phase = %release.phase,
            split = release.traffic_split,
            canary = ?release.canary_tag,
            "release updated"
        );
        self.persist(&release);
    }

    fn finish(&self, record: &RolloutRecord) {
        if let Err(e) = self.store.append_record(record) {
            warn!(service = %record.service, rollout = %record.id, error = %e, "failed to append rollout record");
        }
        let outcome = record.outcome.map(|o| o.to_string()).unwrap_or_default();
        info!(
            service = %record.service,
            rollout = %record.id,
            outcome = %outcome,
            reason = record.reason.as_deref().unwrap_or(""),
            "rollout concluded"
        );
        // No subscribers is fine.
        let _ = self.records.send(record.clone());
    }

    fn command(&self, service: &str, command: OperatorCommand) -> ControllerResult<()> {
        let slots = self.slots.lock().expect("release slots lock");
        let Some(slot) = slots.get(service) else {
            return Err(ControllerError::NoActiveRollout(service.to_string()));
        };
        let phase = slot.release.phase;
        let allowed = match command {
            OperatorCommand::Promote => phase == ReleasePhase::Evaluating,
            OperatorCommand::Rollback => {
                matches!(phase, ReleasePhase::Provisioning | ReleasePhase::Evaluating)
            }
        };
        if !allowed {
            return Err(match phase {
                ReleasePhase::Idle => ControllerError::NoActiveRollout(service.to_string()),
                _ => ControllerError::InvalidPhase {
                    service: service.to_string(),
                    phase,
                    action: match command {
                        OperatorCommand::Promote => "promote",
                        OperatorCommand::Rollback => "roll back",
                    },
                },
            });
        }
        slot.control.send_replace(Some(command));
        info!(service, ?command, "operator command delivered");
        Ok(())
    }

    fn release(&self, service: &str) -> ControllerResult<ServiceRelease> {
        if !self.config.is_known(service) {
            return Err(ControllerError::UnknownService(service.to_string()));
        }
        if let Some(slot) = self.slots.lock().expect("release slots lock").get(service) {
            return Ok(slot.release.clone());
        }
        match self.store.get_release(service)? {
            Some(release) => Ok(release),
            None => Ok(ServiceRelease::new(service, &self.store.get_stable(service)?)),
        }
    }

    fn releases(&self) -> ControllerResult<Vec<ServiceRelease>> {
        let mut all: BTreeMap<String, ServiceRelease> = self
            .store
            .list_releases()?
            .into_iter()
            .map(|r| (r.service.clone(), r))
            .collect();
        for service in self.config.services.keys() {
            if !all.contains_key(service) {
                let stable = self.store.get_stable(service)?;
                all.insert(service.clone(), ServiceRelease::new(service, &stable));
            }
        }
        for (service, slot) in self.slots.lock().expect("release slots lock").iter() {
            all.insert(service.clone(), slot.release.clone());
        }
        Ok(all.into_values().collect())
    }

    // ── Bounded component calls ────────────────────────────────────

    async fn bounded<T, E: Display>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, String> {
        let limit = self.config.evaluation.operation_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("{what} timed out after {limit:?}")),
        }
    }

    /// `ensure` with a small bounded number of attempts.
    async fn provision(
        &self,
        service: &str,
        role: GroupRole,
        tag: &str,
        replicas: u32,
    ) -> Result<(), String> {
        let attempts = self.config.evaluation.provision_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self
                .bounded("ensure", self.instances.ensure(service, role, tag, replicas))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(service, %role, tag, attempt, attempts, error = %e, "provisioning failed");
                    last = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.evaluation.retry_backoff()).await;
            }
        }
        Err(last)
    }

    /// Put all traffic back on the stable group.
    async fn reset_routing(&self, service: &str) -> Result<(), String> {
        let attempts = self.config.evaluation.provision_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self
                .bounded("apply split", self.router.apply_split(service, 100, 0))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(service, attempt, attempts, error = %e, "failed to restore stable routing");
                    last = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.evaluation.retry_backoff()).await;
            }
        }
        Err(last)
    }

    /// After a rejected split, check the router kept the previous one.
    async fn verify_previous_split(&self, service: &str) {
        match self.router.current_split(service).await {
            Some(split) if !split.is_all_stable() => {
                warn!(service, %split, "router still carries canary traffic");
            }
            Some(split) => debug!(service, %split, "previous split still in effect"),
            None => debug!(service, "no split applied yet"),
        }
    }

    async fn teardown_canary(&self, service: &str) {
        if let Err(e) = self
            .bounded("teardown", self.instances.teardown(service, GroupRole::Canary))
            .await
        {
            warn!(service, error = %e, "canary teardown failed");
        }
    }

    async fn check_stable_drift(&self, service: &str, stable_tag: &str) {
        match self
            .bounded("current tag", self.instances.current_tag(service, GroupRole::Stable))
            .await
        {
            Ok(running) if running != stable_tag => {
                warn!(service, stored = stable_tag, running = %running, "stable group drifted from stored tag");
            }
            Ok(_) => {}
            Err(e) => debug!(service, error = %e, "could not read stable group tag"),
        }
    }

    /// Attach the gate's final verdict to both groups.
    async fn record_gate_health(&self, service: &str, gate: &HealthGate) {
        for role in [GroupRole::Stable, GroupRole::Canary] {
            let status = gate.status(role);
            if let Err(e) = self
                .bounded("record health", self.instances.record_health(service, role, status))
                .await
            {
                debug!(service, %role, error = %e, "could not record group health");
            }
        }
    }

    async fn groups(&self, service: &str) -> ControllerResult<Vec<InstanceGroup>> {
        if !self.config.is_known(service) {
            return Err(ControllerError::UnknownService(service.to_string()));
        }
        let limit = self.config.evaluation.operation_timeout();
        let mut groups = Vec::new();
        for role in [GroupRole::Stable, GroupRole::Canary] {
            match tokio::time::timeout(limit, self.instances.describe(service, role)).await {
                Ok(Ok(group)) => groups.push(group),
                Ok(Err(InstanceError::NotProvisioned { .. })) => {}
                Ok(Err(e)) => return Err(ControllerError::Operation(e.to_string())),
                Err(_) => {
                    return Err(ControllerError::Operation(format!(
                        "describe {role} group timed out after {limit:?}"
                    )));
                }
            }
        }
        Ok(groups)
    }

    // ── Rollout pipeline ───────────────────────────────────────────

    async fn execute(
        &self,
        mut record: RolloutRecord,
        request: RolloutRequest,
        control: ControlReceiver,
    ) -> RolloutRecord {
        if request.enable_canary {
            self.canary_rollout(&mut record, &request, control).await;
        } else {
            let replicas = self.config.replicas(&request.service_name);
            self.replace_stable(&mut record, replicas, false).await;
        }
        if record.is_sealed() {
            self.finish(&record);
        }
        record
    }

    async fn canary_rollout(
        &self,
        record: &mut RolloutRecord,
        request: &RolloutRequest,
        mut control: ControlReceiver,
    ) {
        let service = request.service_name.as_str();
        let tag = request.new_version_tag.as_str();
        let weight = request.canary_weight;
        let replicas = self.config.replicas(service);

        self.check_stable_drift(service, &record.from_tag).await;

        // Provisioning
        if let Err(e) = self.provision(service, GroupRole::Canary, tag, replicas).await {
            let reason = format!("canary provisioning failed: {e}");
            self.roll_back(record, RolloutOutcome::Aborted, reason, Vec::new())
                .await;
            return;
        }
        if *control.borrow() == Some(OperatorCommand::Rollback) {
            let reason = "rolled back by operator".to_string();
            self.roll_back(record, RolloutOutcome::Aborted, reason, Vec::new())
                .await;
            return;
        }

        // Evaluating
        self.transition(service, |r| r.phase = ReleasePhase::Evaluating);
        if let Err(e) = self
            .bounded("apply split", self.router.apply_split(service, 100 - weight, weight))
            .await
        {
            self.verify_previous_split(service).await;
            let reason = format!("router rejected {}/{weight} split: {e}", 100 - weight);
            self.roll_back(record, RolloutOutcome::Aborted, reason, Vec::new())
                .await;
            return;
        }
        self.transition(service, |r| r.traffic_split = weight);
        info!(service, tag, weight, "canary receiving traffic");

        let mut gate = HealthGate::new(self.prober.clone(), service, &self.config.evaluation);
        let verdict = gate.run(&mut control).await;
        debug!(service, ?verdict, checks = gate.checks(), "health gate finished");
        self.record_gate_health(service, &gate).await;

        let concluded = match verdict {
            GateVerdict::Passed => true,
            GateVerdict::TimedOut => {
                let policy = self.config.evaluation.on_timeout;
                warn!(service, ?policy, "evaluation hit its time limit without a verdict");
                policy == TimeoutPolicy::Conclude
            }
            GateVerdict::CanaryUnhealthy(reason) => {
                self.roll_back(record, RolloutOutcome::RolledBack, reason, gate.history())
                    .await;
                return;
            }
            GateVerdict::StableUnhealthy(reason) => {
                error!(service, reason = %reason, "stable group failed during evaluation");
                let reason = format!("baseline unhealthy during evaluation: {reason}");
                self.roll_back(record, RolloutOutcome::RolledBack, reason, gate.history())
                    .await;
                return;
            }
            GateVerdict::Command(OperatorCommand::Promote) => {
                info!(service, "operator promoted before the gate finished");
                self.promote(record, replicas).await;
                return;
            }
            GateVerdict::Command(OperatorCommand::Rollback) => {
                let reason = "rolled back by operator".to_string();
                self.roll_back(record, RolloutOutcome::RolledBack, reason, gate.history())
                    .await;
                return;
            }
            GateVerdict::Closed => {
                warn!(service, "control channel closed during evaluation");
                return;
            }
        };

        let decision = if concluded && request.promote {
            Some(OperatorCommand::Promote)
        } else {
            info!(service, passed = concluded, "holding in evaluating for operator decision");
            wait_for_command(&mut control).await
        };

        match decision {
            Some(OperatorCommand::Promote) => self.promote(record, replicas).await,
            Some(OperatorCommand::Rollback) => {
                let reason = "rolled back by operator".to_string();
                self.roll_back(record, RolloutOutcome::RolledBack, reason, gate.history())
                    .await;
            }
            None => warn!(service, "control channel closed while holding"),
        }
    }

    async fn promote(&self, record: &mut RolloutRecord, replicas: u32) {
        let service = record.service.clone();
        self.transition(&service, |r| r.phase = ReleasePhase::Promoting);

        // Canary carries everything while the stable group is recreated.
        if let Err(e) = self
            .bounded("apply split", self.router.apply_split(&service, 0, 100))
            .await
        {
            self.verify_previous_split(&service).await;
            let reason = format!("could not shift traffic to canary: {e}");
            self.roll_back(record, RolloutOutcome::RolledBack, reason, Vec::new())
                .await;
            return;
        }
        self.transition(&service, |r| r.traffic_split = 100);

        self.replace_stable(record, replicas, true).await;
    }

    /// Recreate stable at the new tag and make it durable.
    ///
    /// The stable tag is written only after the new group is confirmed
    /// running; that write is the durability point of a promotion.
    async fn replace_stable(&self, record: &mut RolloutRecord, replicas: u32, with_canary: bool) {
        let service = record.service.clone();
        let new_tag = record.to_tag.clone();
        let old_tag = record.from_tag.clone();

        if let Err(e) = self
            .provision(&service, GroupRole::Stable, &new_tag, replicas)
            .await
        {
            error!(service = %service, tag = %new_tag, error = %e, "stable group failed at new tag");
            if let Err(restore) = self
                .provision(&service, GroupRole::Stable, &old_tag, replicas)
                .await
            {
                let reason = format!(
                    "stable group failed at {new_tag} ({e}) and could not be restored to {old_tag} ({restore})"
                );
                self.degrade(record, None, reason);
                return;
            }
            let reason = format!("stable group failed at {new_tag}: {e}");
            if let Err(route) = self.reset_routing(&service).await {
                let reason = format!("{reason}; traffic could not be restored to stable: {route}");
                self.degrade(record, None, reason);
                return;
            }
            if with_canary {
                self.teardown_canary(&service).await;
            }
            self.transition(&service, |r| r.settle());
            record.seal(RolloutOutcome::RolledBack, Some(reason));
            return;
        }

        if let Err(e) = self.store.set_stable(&service, &new_tag) {
            error!(service = %service, tag = %new_tag, error = %e, "stable tag write failed, halting");
            let routed = self.reset_routing(&service).await.is_ok();
            if with_canary {
                self.teardown_canary(&service).await;
            }
            if routed {
                self.transition(&service, |r| r.traffic_split = 0);
            }
            let reason = format!("{new_tag} is serving but the stable tag write failed: {e}");
            self.degrade(record, Some(new_tag), reason);
            return;
        }
        self.transition(&service, |r| r.stable_tag = new_tag.clone());

        if let Err(e) = self.reset_routing(&service).await {
            let reason =
                format!("{new_tag} is stable but traffic could not be moved off the canary: {e}");
            self.degrade(record, None, reason);
            return;
        }
        if with_canary {
            self.teardown_canary(&service).await;
        }
        self.transition(&service, |r| r.settle());
        record.seal(RolloutOutcome::Promoted, None);
        info!(service = %service, from = %old_tag, to = %new_tag, "promoted");
    }

    /// Discard the canary and put all traffic back on stable.
    ///
    /// Traffic leaves the canary first. Evidence is captured after that
    /// but before teardown, so a slow or failing capture never holds
    /// users on the canary.
    async fn roll_back(
        &self,
        record: &mut RolloutRecord,
        outcome: RolloutOutcome,
        reason: String,
        history: Vec<HealthSample>,
    ) {
        let service = record.service.clone();
        warn!(service = %service, rollout = %record.id, reason = %reason, "rolling back");
        self.transition(&service, |r| r.phase = ReleasePhase::RollingBack);

        let routed = self.reset_routing(&service).await;
        if routed.is_ok() {
            self.transition(&service, |r| r.traffic_split = 0);
        }

        record.failure_evidence = Some(self.capture_evidence(record, &reason, history).await);

        if let Err(e) = routed {
            let reason = format!("{reason}; traffic could not be restored to stable: {e}");
            self.degrade(record, None, reason);
            return;
        }
        self.teardown_canary(&service).await;
        self.transition(&service, |r| r.settle());
        record.seal(outcome, Some(reason));
    }

    fn degrade(&self, record: &mut RolloutRecord, pending_tag: Option<String>, reason: String) {
        error!(service = %record.service, rollout = %record.id, pending = ?pending_tag, reason = %reason, "service degraded");
        self.transition(&record.service, |r| r.degrade(pending_tag, &reason));
        record.seal(RolloutOutcome::Degraded, Some(reason));
    }

    async fn capture_evidence(
        &self,
        record: &RolloutRecord,
        reason: &str,
        history: Vec<HealthSample>,
    ) -> FailureEvidence {
        let mut bundle = EvidenceBundle::new(record, reason);
        bundle.health_history = history;
        let lines = self.config.evaluation.evidence_log_lines;
        match self
            .bounded("log capture", self.instances.logs(&record.service, GroupRole::Canary, lines))
            .await
        {
            Ok(logs) => bundle.logs = logs,
            Err(e) => {
                warn!(service = %record.service, error = %e, "log capture failed");
                bundle.capture_error = Some(e);
            }
        }

        let evidence = FailureEvidence {
            bundle_key: self.evidence.key(&bundle),
            logs: bundle.logs.clone(),
            health_history: bundle.health_history.clone(),
            capture_error: bundle.capture_error.clone(),
        };

        let sink = self.evidence.clone();
        let limit = self.config.evaluation.operation_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(limit, sink.publish(&bundle)).await {
                Ok(Ok(())) => debug!(rollout = %bundle.rollout_id, "evidence published"),
                Ok(Err(e)) => warn!(rollout = %bundle.rollout_id, error = %e, "evidence publish failed"),
                Err(_) => warn!(rollout = %bundle.rollout_id, "evidence publish timed out"),
            }
        });
        evidence
    }

    // ── Operator resolution and recovery ───────────────────────────

    async fn resolve(&self, service: &str) -> ControllerResult<ServiceRelease> {
        let (pending, stable_tag) = {
            let mut slots = self.slots.lock().expect("release slots lock");
            let slot = self.load_slot(&mut slots, service)?;
            if slot.release.phase != ReleasePhase::Degraded {
                return Err(ControllerError::InvalidPhase {
                    service: service.to_string(),
                    phase: slot.release.phase,
                    action: "resolve",
                });
            }
            if slot.resolving {
                return Err(ControllerError::ResolveInProgress(service.to_string()));
            }
            slot.resolving = true;
            let release = &slot.release;
            let pending = release.degraded.as_ref().and_then(|d| d.pending_tag.clone());
            (pending, release.stable_tag.clone())
        };
        let _guard = ResolveGuard {
            inner: self,
            service: service.to_string(),
        };

        let target = pending.clone().unwrap_or(stable_tag);
        let replicas = self.config.replicas(service);
        self.provision(service, GroupRole::Stable, &target, replicas)
            .await
            .map_err(ControllerError::Operation)?;
        if let Some(tag) = &pending {
            self.store.set_stable(service, tag)?;
        }
        self.reset_routing(service)
            .await
            .map_err(ControllerError::Operation)?;
        self.teardown_canary(service).await;

        self.transition(service, |r| {
            r.stable_tag = target.clone();
            r.settle();
        });
        info!(service, stable = %target, "degraded state resolved");
        self.release(service)
    }

    async fn recover(&self) -> ControllerResult<Vec<RolloutRecord>> {
        let persisted = self.store.list_releases()?;
        let mut concluded = Vec::new();

        for release in persisted {
            let service = release.service.clone();
            let phase = release.phase;
            {
                let (control, _) = watch::channel(None);
                let mut slots = self.slots.lock().expect("release slots lock");
                slots.insert(
                    service.clone(),
                    Slot {
                        release: release.clone(),
                        control,
                        resolving: false,
                    },
                );
            }
            if !phase.is_active() {
                debug!(service = %service, %phase, "release loaded");
                continue;
            }

            warn!(service = %service, %phase, rollout = ?release.active_rollout, "concluding interrupted rollout");
            let to_tag = release
                .canary_tag
                .clone()
                .unwrap_or_else(|| release.stable_tag.clone());
            // Releases written before the requested weight was stored only
            // carry the applied split.
            let weight = if release.requested_weight > 0 {
                release.requested_weight
            } else {
                release.traffic_split
            };
            let request = RolloutRequest::new(&service, &to_tag, weight);
            let mut record = RolloutRecord::open(&request, &release.stable_tag);
            if let Some(id) = &release.active_rollout {
                record.id = id.clone();
            }

            if phase == ReleasePhase::Promoting {
                self.recover_promotion(&mut record).await;
            } else {
                let reason = format!("controller restarted during {phase}");
                self.roll_back(&mut record, RolloutOutcome::Aborted, reason, Vec::new())
                    .await;
            }
            self.finish(&record);
            concluded.push(record);
        }
        Ok(concluded)
    }

    /// Roll an interrupted promotion forward only when it provably
    /// reached its durability point.
    async fn recover_promotion(&self, record: &mut RolloutRecord) {
        let service = record.service.clone();
        let to_tag = record.to_tag.clone();
        let stored = self.store.get_stable(&service);
        let running = self
            .bounded("current tag", self.instances.current_tag(&service, GroupRole::Stable))
            .await;

        let stable_running = matches!(&running, Ok(tag) if *tag == to_tag);
        let stable_stored = matches!(&stored, Ok(tag) if *tag == to_tag);

        if stable_running && stable_stored {
            if let Err(e) = self.reset_routing(&service).await {
                let reason = format!("promotion of {to_tag} completed but routing was not restored: {e}");
                self.degrade(record, None, reason);
                return;
            }
            self.teardown_canary(&service).await;
            self.transition(&service, |r| {
                r.stable_tag = to_tag.clone();
                r.settle();
            });
            record.seal(
                RolloutOutcome::Promoted,
                Some("completed after controller restart".to_string()),
            );
            return;
        }

        let pending = stable_running.then(|| to_tag.clone());
        let reason = format!(
            "controller restarted during promotion of {to_tag} (stable group running: {}, stored: {})",
            running.unwrap_or_else(|e| format!("unknown, {e}")),
            stored.map_err(|e| e.to_string()).unwrap_or_else(|e| format!("unknown, {e}")),
        );
        self.degrade(record, pending, reason);
    }
}
