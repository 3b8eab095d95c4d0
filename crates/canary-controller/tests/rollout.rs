//! End-to-end rollout scenarios against in-process collaborators.
//!
//! Every collaborator is real (redb store, memory router, local instance
//! groups) except the prober, which replays a script. Thin wrappers inject
//! router and store failures. Time is paused, so gate windows run instantly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use canary_controller::*;
use canary_health::{GroupRef, HealthProber, HealthResult, ProbeError};
use canary_instances::{InstanceError, InstanceGroupManager, InstanceResult, LocalGroupManager};
use canary_router::{MemoryRouter, RouterError, RouterResult, TrafficRouter, TrafficSplit, WeightMap};
use canary_state::*;

// ── Fakes ──────────────────────────────────────────────────────────

/// Replays a script per role, then repeats its last entry.
struct ScriptedProber {
    stable: Mutex<VecDeque<bool>>,
    canary: Mutex<VecDeque<bool>>,
}

impl ScriptedProber {
    fn healthy() -> Self {
        Self::new(&[true], &[true])
    }

    fn new(stable: &[bool], canary: &[bool]) -> Self {
        Self {
            stable: Mutex::new(stable.iter().copied().collect()),
            canary: Mutex::new(canary.iter().copied().collect()),
        }
    }
}

#[async_trait]
impl HealthProber for ScriptedProber {
    async fn probe(&self, group: &GroupRef, _timeout: Duration) -> HealthResult {
        let script = match group.role {
            GroupRole::Stable => &self.stable,
            GroupRole::Canary => &self.canary,
        };
        let mut script = script.lock().unwrap();
        let healthy = if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().copied().unwrap_or(true)
        };
        if healthy {
            HealthResult::healthy(Duration::from_millis(4))
        } else {
            HealthResult::unhealthy(Duration::from_millis(4), ProbeError::Status(500))
        }
    }
}

/// Memory router that can be told to reject splits.
#[derive(Default)]
struct FlakyRouter {
    inner: MemoryRouter,
    reject_canary: AtomicBool,
    reject_all: AtomicBool,
    applied: Mutex<Vec<(u8, u8)>>,
}

impl FlakyRouter {
    fn applied(&self) -> Vec<(u8, u8)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrafficRouter for FlakyRouter {
    async fn apply_split(&self, service: &str, stable: u8, canary: u8) -> RouterResult<()> {
        let rejected = self.reject_all.load(Ordering::SeqCst)
            || (canary > 0 && self.reject_canary.load(Ordering::SeqCst));
        if rejected {
            return Err(RouterError::Validation("config test failed".to_string()));
        }
        self.inner.apply_split(service, stable, canary).await?;
        self.applied.lock().unwrap().push((stable, canary));
        Ok(())
    }

    async fn current_split(&self, service: &str) -> Option<TrafficSplit> {
        self.inner.current_split(service).await
    }

    async fn weight_map(&self) -> WeightMap {
        self.inner.weight_map().await
    }
}

/// redb store whose `set_stable` can be made to fail.
struct FlakyStore {
    inner: StateStore,
    fail_set_stable: AtomicBool,
}

impl FlakyStore {
    fn new(inner: StateStore) -> Self {
        Self {
            inner,
            fail_set_stable: AtomicBool::new(false),
        }
    }
}

impl ReleaseStore for FlakyStore {
    fn get_stable(&self, service: &str) -> StateResult<String> {
        self.inner.get_stable(service)
    }

    fn set_stable(&self, service: &str, tag: &str) -> StateResult<()> {
        if self.fail_set_stable.load(Ordering::SeqCst) {
            return Err(StateError::Write("disk full".to_string()));
        }
        self.inner.set_stable(service, tag)
    }

    fn put_release(&self, release: &ServiceRelease) -> StateResult<()> {
        self.inner.put_release(release)
    }

    fn get_release(&self, service: &str) -> StateResult<Option<ServiceRelease>> {
        self.inner.get_release(service)
    }

    fn list_releases(&self) -> StateResult<Vec<ServiceRelease>> {
        self.inner.list_releases()
    }

    fn append_record(&self, record: &RolloutRecord) -> StateResult<()> {
        self.inner.append_record(record)
    }

    fn list_records(&self, service: &str) -> StateResult<Vec<RolloutRecord>> {
        self.inner.list_records(service)
    }
}

#[derive(Default)]
struct RecordingSink {
    bundles: Mutex<Vec<EvidenceBundle>>,
}

#[async_trait]
impl EvidenceSink for RecordingSink {
    fn key(&self, bundle: &EvidenceBundle) -> String {
        format!("mem:{}", bundle.rollout_id)
    }

    async fn publish(&self, bundle: &EvidenceBundle) -> Result<(), EvidenceError> {
        self.bundles.lock().unwrap().push(bundle.clone());
        Ok(())
    }
}

/// Local groups whose log capture and provisioning can be slowed or
/// broken. Each log capture notes the split in force at that moment and
/// whether the canary group still existed.
struct ObservedInstances {
    inner: Arc<LocalGroupManager>,
    router: Arc<FlakyRouter>,
    log_delay: Duration,
    fail_logs: bool,
    ensure_delay: Mutex<Duration>,
    captures: Mutex<Vec<(Option<TrafficSplit>, bool)>>,
}

impl ObservedInstances {
    fn captures(&self) -> Vec<(Option<TrafficSplit>, bool)> {
        self.captures.lock().unwrap().clone()
    }

    fn slow_ensure(&self, delay: Duration) {
        *self.ensure_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl InstanceGroupManager for ObservedInstances {
    async fn ensure(
        &self,
        service: &str,
        role: GroupRole,
        tag: &str,
        replicas: u32,
    ) -> InstanceResult<()> {
        let delay = *self.ensure_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.inner.ensure(service, role, tag, replicas).await
    }

    async fn current_tag(&self, service: &str, role: GroupRole) -> InstanceResult<String> {
        self.inner.current_tag(service, role).await
    }

    async fn teardown(&self, service: &str, role: GroupRole) -> InstanceResult<()> {
        self.inner.teardown(service, role).await
    }

    async fn logs(
        &self,
        service: &str,
        role: GroupRole,
        lines: usize,
    ) -> InstanceResult<Vec<String>> {
        let split = self.router.current_split(service).await;
        let canary_up = self.inner.group(service, GroupRole::Canary).is_some();
        self.captures.lock().unwrap().push((split, canary_up));

        tokio::time::sleep(self.log_delay).await;
        if self.fail_logs {
            return Err(InstanceError::Command("log driver unavailable".to_string()));
        }
        self.inner.logs(service, role, lines).await
    }

    async fn record_health(
        &self,
        service: &str,
        role: GroupRole,
        status: HealthStatus,
    ) -> InstanceResult<()> {
        self.inner.record_health(service, role, status).await
    }

    async fn describe(&self, service: &str, role: GroupRole) -> InstanceResult<InstanceGroup> {
        self.inner.describe(service, role).await
    }
}

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    controller: CanaryController,
    store: Arc<FlakyStore>,
    router: Arc<FlakyRouter>,
    instances: Arc<LocalGroupManager>,
    sink: Arc<RecordingSink>,
}

fn evaluation() -> EvaluationConfig {
    EvaluationConfig {
        interval: "1s".to_string(),
        window: "3s".to_string(),
        probe_timeout: "500ms".to_string(),
        max_duration: "30s".to_string(),
        failure_threshold: 2,
        operation_timeout: "5s".to_string(),
        retry_backoff: "10ms".to_string(),
        ..Default::default()
    }
}

async fn harness_with(
    prober: ScriptedProber,
    instances: LocalGroupManager,
    evaluation: EvaluationConfig,
) -> Harness {
    harness_from(
        StateStore::open_in_memory().unwrap(),
        prober,
        instances,
        evaluation,
    )
    .await
}

async fn harness_from(
    state: StateStore,
    prober: ScriptedProber,
    instances: LocalGroupManager,
    evaluation: EvaluationConfig,
) -> Harness {
    harness_wrapped(state, prober, instances, evaluation, |local, _| {
        local as Arc<dyn InstanceGroupManager>
    })
    .await
}

/// Harness whose controller drives `wrap(local groups)` instead of the
/// local groups directly.
async fn harness_wrapped(
    state: StateStore,
    prober: ScriptedProber,
    instances: LocalGroupManager,
    evaluation: EvaluationConfig,
    wrap: impl FnOnce(Arc<LocalGroupManager>, Arc<FlakyRouter>) -> Arc<dyn InstanceGroupManager>,
) -> Harness {
    let store = Arc::new(FlakyStore::new(state));
    let router = Arc::new(FlakyRouter::default());
    let instances = Arc::new(instances);
    let sink = Arc::new(RecordingSink::default());

    if store.get_release("account").unwrap().is_none() {
        store.set_stable("account", "v1").unwrap();
        instances
            .ensure("account", GroupRole::Stable, "v1", 2)
            .await
            .unwrap();
    }

    let config = ControllerConfig::new(evaluation)
        .with_service("account", 2)
        .with_service("transaction", 1);
    let driven = wrap(instances.clone(), router.clone());
    let controller = CanaryController::new(
        Components {
            store: store.clone(),
            router: router.clone(),
            instances: driven,
            prober: Arc::new(prober),
            evidence: sink.clone(),
        },
        config,
    );

    Harness {
        controller,
        store,
        router,
        instances,
        sink,
    }
}

async fn harness(prober: ScriptedProber) -> Harness {
    harness_with(prober, LocalGroupManager::new(), evaluation()).await
}

async fn observed_harness(
    prober: ScriptedProber,
    evaluation: EvaluationConfig,
    log_delay: Duration,
    fail_logs: bool,
) -> (Harness, Arc<ObservedInstances>) {
    let mut observed = None;
    let h = harness_wrapped(
        StateStore::open_in_memory().unwrap(),
        prober,
        LocalGroupManager::new(),
        evaluation,
        |inner, router| {
            let wrapper = Arc::new(ObservedInstances {
                inner,
                router,
                log_delay,
                fail_logs,
                ensure_delay: Mutex::new(Duration::ZERO),
                captures: Mutex::new(Vec::new()),
            });
            observed = Some(wrapper.clone());
            wrapper as Arc<dyn InstanceGroupManager>
        },
    )
    .await;
    (h, observed.unwrap())
}

fn request(tag: &str) -> RolloutRequest {
    RolloutRequest::new("account", tag, 10).with_promote(true)
}

async fn wait_for_phase(controller: &CanaryController, service: &str, phase: ReleasePhase) {
    for _ in 0..600 {
        if controller.release(service).unwrap().phase == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{service} never reached {phase}");
}

/// Common post-conditions of any concluded rollout that kept `tag` stable.
async fn assert_settled_on(h: &Harness, tag: &str) {
    let release = h.controller.release("account").unwrap();
    assert_eq!(release.phase, ReleasePhase::Idle);
    assert_eq!(release.stable_tag, tag);
    assert_eq!(release.traffic_split, 0);
    assert!(release.canary_tag.is_none());
    assert!(release.is_consistent());

    assert_eq!(h.store.get_stable("account").unwrap(), tag);
    assert_eq!(
        h.router.current_split("account").await,
        Some(TrafficSplit::all_stable())
    );
    assert!(h.instances.group("account", GroupRole::Canary).is_none());
    assert_eq!(
        h.instances.group("account", GroupRole::Stable).unwrap().tag,
        tag
    );
}

// ── Promotion ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn healthy_canary_is_promoted() {
    let h = harness(ScriptedProber::healthy()).await;

    let record = h.controller.run(request("v2")).await.unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::Promoted));
    assert_eq!(record.from_tag, "v1");
    assert_eq!(record.to_tag, "v2");
    assert!(record.failure_evidence.is_none());
    assert_settled_on(&h, "v2").await;
    assert_eq!(
        h.instances.group("account", GroupRole::Stable).unwrap().replica_count,
        2
    );

    // Canary split, full shift, then back to the recreated stable group.
    assert_eq!(h.router.applied(), vec![(90, 10), (0, 100), (100, 0)]);

    let history = h.controller.history("account").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, record.id);
}

#[tokio::test(start_paused = true)]
async fn submit_publishes_sealed_record() {
    let h = harness(ScriptedProber::healthy()).await;
    let mut records = h.controller.subscribe();

    let id = h.controller.submit(request("v2")).unwrap();
    let record = records.recv().await.unwrap();

    assert_eq!(record.id, id);
    assert_eq!(record.outcome, Some(RolloutOutcome::Promoted));
    assert!(record.is_sealed());
    assert_settled_on(&h, "v2").await;
}

#[tokio::test(start_paused = true)]
async fn passed_gate_holds_until_operator_promotes() {
    let h = harness(ScriptedProber::healthy()).await;
    let mut records = h.controller.subscribe();

    h.controller
        .submit(RolloutRequest::new("account", "v2", 25))
        .unwrap();
    wait_for_phase(&h.controller, "account", ReleasePhase::Evaluating).await;

    // Well past the window, still held.
    tokio::time::sleep(Duration::from_secs(20)).await;
    let held = h.controller.release("account").unwrap();
    assert_eq!(held.phase, ReleasePhase::Evaluating);
    assert_eq!(held.traffic_split, 25);
    assert_eq!(held.requested_weight, 25);

    h.controller.promote("account").unwrap();
    let record = records.recv().await.unwrap();
    assert_eq!(record.outcome, Some(RolloutOutcome::Promoted));
    assert_settled_on(&h, "v2").await;
}

#[tokio::test(start_paused = true)]
async fn gate_verdicts_are_recorded_on_groups() {
    let h = harness(ScriptedProber::healthy()).await;
    let mut records = h.controller.subscribe();

    h.controller
        .submit(RolloutRequest::new("account", "v2", 25))
        .unwrap();
    wait_for_phase(&h.controller, "account", ReleasePhase::Evaluating).await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    let groups = h.controller.groups("account").await.unwrap();
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|g| g.health == HealthStatus::Healthy));
    let canary = groups.iter().find(|g| g.role == GroupRole::Canary).unwrap();
    assert_eq!(canary.tag, "v2");

    h.controller.promote("account").unwrap();
    records.recv().await.unwrap();

    // The recreated stable group has not been through a gate yet.
    let groups = h.controller.groups("account").await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].role, GroupRole::Stable);
    assert_eq!(groups[0].tag, "v2");
    assert_eq!(groups[0].health, HealthStatus::Unknown);

    let err = h.controller.groups("ledger").await.unwrap_err();
    assert!(matches!(err, ControllerError::UnknownService(_)));
}

#[tokio::test(start_paused = true)]
async fn operator_promote_bypasses_running_gate() {
    let eval = EvaluationConfig {
        window: "60s".to_string(),
        max_duration: "120s".to_string(),
        ..evaluation()
    };
    let h = harness_with(ScriptedProber::healthy(), LocalGroupManager::new(), eval).await;
    let mut records = h.controller.subscribe();

    h.controller.submit(request("v2")).unwrap();
    wait_for_phase(&h.controller, "account", ReleasePhase::Evaluating).await;
    h.controller.promote("account").unwrap();

    let record = records.recv().await.unwrap();
    assert_eq!(record.outcome, Some(RolloutOutcome::Promoted));
    assert_settled_on(&h, "v2").await;
}

#[tokio::test(start_paused = true)]
async fn timeout_with_conclude_policy_promotes() {
    let eval = EvaluationConfig {
        window: "5s".to_string(),
        max_duration: "6s".to_string(),
        failure_threshold: 10,
        on_timeout: TimeoutPolicy::Conclude,
        ..evaluation()
    };
    // Canary keeps failing, but never ten times in a row before the ceiling.
    let prober = ScriptedProber::new(&[true], &[false]);
    let h = harness_with(prober, LocalGroupManager::new(), eval).await;

    let record = h.controller.run(request("v2")).await.unwrap();
    assert_eq!(record.outcome, Some(RolloutOutcome::Promoted));
}

#[tokio::test(start_paused = true)]
async fn timeout_with_hold_policy_waits_for_operator() {
    let eval = EvaluationConfig {
        window: "5s".to_string(),
        max_duration: "6s".to_string(),
        failure_threshold: 10,
        on_timeout: TimeoutPolicy::Hold,
        ..evaluation()
    };
    let prober = ScriptedProber::new(&[true], &[false]);
    let h = harness_with(prober, LocalGroupManager::new(), eval).await;
    let mut records = h.controller.subscribe();

    h.controller.submit(request("v2")).unwrap();
    wait_for_phase(&h.controller, "account", ReleasePhase::Evaluating).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        h.controller.release("account").unwrap().phase,
        ReleasePhase::Evaluating
    );

    h.controller.rollback("account").unwrap();
    let record = records.recv().await.unwrap();
    assert_eq!(record.outcome, Some(RolloutOutcome::RolledBack));
    assert_settled_on(&h, "v1").await;
}

// ── Rollback ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn two_consecutive_failures_roll_back_with_evidence() {
    let prober = ScriptedProber::new(&[true], &[false, false]);
    let h = harness(prober).await;

    let record = h.controller.run(request("v2")).await.unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::RolledBack));
    assert!(record.reason.as_deref().unwrap().contains("canary group failed 2"));
    assert_settled_on(&h, "v1").await;
    assert!(!h.router.applied().contains(&(0, 100)));

    let evidence = record.failure_evidence.as_ref().unwrap();
    assert_eq!(evidence.bundle_key, format!("mem:{}", record.id));
    assert!(evidence.capture_error.is_none());
    assert!(evidence.logs.iter().any(|l| l.contains("started v2")));
    let canary_failures = evidence
        .health_history
        .iter()
        .filter(|s| s.role == GroupRole::Canary && s.status == HealthStatus::Unhealthy)
        .count();
    assert_eq!(canary_failures, 2);

    // Publication is detached from the rollback.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let bundles = h.sink.bundles.lock().unwrap().clone();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].from_tag, "v1");
    assert_eq!(bundles[0].to_tag, "v2");

    let history = h.controller.history("account").unwrap();
    assert_eq!(history[0].outcome, Some(RolloutOutcome::RolledBack));
    assert!(history[0].failure_evidence.is_some());
}

#[tokio::test(start_paused = true)]
async fn any_k_consecutive_failures_never_promote() {
    for lead in 0..3usize {
        let mut script = vec![true; lead];
        script.extend([false, false, false]);
        let h = harness(ScriptedProber::new(&[true], &script)).await;

        let record = h.controller.run(request("v2")).await.unwrap();
        assert_eq!(record.outcome, Some(RolloutOutcome::RolledBack), "lead {lead}");
        assert_settled_on(&h, "v1").await;
    }
}

#[tokio::test(start_paused = true)]
async fn failing_stable_forces_rollback() {
    let prober = ScriptedProber::new(&[false], &[true]);
    let h = harness(prober).await;

    let record = h.controller.run(request("v2")).await.unwrap();
    assert_eq!(record.outcome, Some(RolloutOutcome::RolledBack));
    assert!(record.reason.as_deref().unwrap().contains("baseline"));
    assert_settled_on(&h, "v1").await;
    assert_eq!(
        h.instances.group("account", GroupRole::Stable).unwrap().health,
        HealthStatus::Unhealthy
    );
}

#[tokio::test(start_paused = true)]
async fn rollback_moves_traffic_off_canary_before_capturing_logs() {
    let cfg = EvaluationConfig {
        operation_timeout: "2m".to_string(),
        ..evaluation()
    };
    let (h, observed) = observed_harness(
        ScriptedProber::new(&[true], &[false]),
        cfg,
        Duration::from_secs(60),
        false,
    )
    .await;

    let record = h.controller.run(request("v2")).await.unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::RolledBack));
    // Stable already carried everything while the slow capture ran, and
    // the canary was still there to read logs from.
    assert_eq!(
        observed.captures(),
        vec![(Some(TrafficSplit::all_stable()), true)]
    );
    assert_eq!(h.router.applied(), vec![(90, 10), (100, 0)]);
    let evidence = record.failure_evidence.as_ref().unwrap();
    assert!(evidence.capture_error.is_none());
    assert!(evidence.logs.iter().any(|l| l.contains("started v2")));
    assert_settled_on(&h, "v1").await;
}

#[tokio::test(start_paused = true)]
async fn failed_log_capture_still_rolls_back() {
    let (h, observed) = observed_harness(
        ScriptedProber::new(&[true], &[false]),
        evaluation(),
        Duration::ZERO,
        true,
    )
    .await;

    let record = h.controller.run(request("v2")).await.unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::RolledBack));
    let evidence = record.failure_evidence.as_ref().unwrap();
    assert!(evidence
        .capture_error
        .as_deref()
        .unwrap()
        .contains("log driver unavailable"));
    assert!(evidence.logs.is_empty());
    assert_eq!(observed.captures().len(), 1);
    assert_settled_on(&h, "v1").await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    let bundles = h.sink.bundles.lock().unwrap().clone();
    assert_eq!(bundles.len(), 1);
    assert!(bundles[0].capture_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn hung_log_capture_times_out_and_rolls_back() {
    let (h, _observed) = observed_harness(
        ScriptedProber::new(&[true], &[false]),
        evaluation(),
        Duration::from_secs(600),
        false,
    )
    .await;

    let record = h.controller.run(request("v2")).await.unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::RolledBack));
    let evidence = record.failure_evidence.as_ref().unwrap();
    assert!(evidence
        .capture_error
        .as_deref()
        .unwrap()
        .contains("log capture timed out"));
    assert_settled_on(&h, "v1").await;
}

#[tokio::test(start_paused = true)]
async fn provisioning_failure_aborts_without_shifting_traffic() {
    let instances = LocalGroupManager::new().with_broken_tag("v2");
    let h = harness_with(ScriptedProber::healthy(), instances, evaluation()).await;

    let record = h.controller.run(request("v2")).await.unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::Aborted));
    assert!(record.reason.as_deref().unwrap().contains("provisioning"));
    assert_settled_on(&h, "v1").await;
    assert!(h.router.applied().iter().all(|(_, canary)| *canary == 0));
    assert_eq!(
        h.instances.group("account", GroupRole::Stable).unwrap().replica_count,
        2
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_split_aborts_and_keeps_stable_routing() {
    let h = harness(ScriptedProber::healthy()).await;
    h.router.reject_canary.store(true, Ordering::SeqCst);

    let record = h.controller.run(request("v2")).await.unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::Aborted));
    assert!(record.reason.as_deref().unwrap().contains("router rejected 90/10"));
    assert_settled_on(&h, "v1").await;
}

#[tokio::test(start_paused = true)]
async fn unrestorable_routing_degrades() {
    let h = harness(ScriptedProber::healthy()).await;
    h.router.reject_all.store(true, Ordering::SeqCst);

    let record = h.controller.run(request("v2")).await.unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::Degraded));
    let release = h.controller.release("account").unwrap();
    assert_eq!(release.phase, ReleasePhase::Degraded);
    assert_eq!(release.stable_tag, "v1");
    assert!(release.is_consistent());
    assert!(release
        .degraded
        .as_ref()
        .unwrap()
        .reason
        .contains("could not be restored"));
}

#[tokio::test(start_paused = true)]
async fn operator_rollback_during_evaluation() {
    let eval = EvaluationConfig {
        window: "60s".to_string(),
        max_duration: "120s".to_string(),
        ..evaluation()
    };
    let h = harness_with(ScriptedProber::healthy(), LocalGroupManager::new(), eval).await;
    let mut records = h.controller.subscribe();

    h.controller.submit(request("v2")).unwrap();
    wait_for_phase(&h.controller, "account", ReleasePhase::Evaluating).await;
    h.controller.rollback("account").unwrap();

    let record = records.recv().await.unwrap();
    assert_eq!(record.outcome, Some(RolloutOutcome::RolledBack));
    assert_eq!(record.reason.as_deref(), Some("rolled back by operator"));
    assert_settled_on(&h, "v1").await;
}

// ── Promotion failures ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stable_write_failure_leaves_new_stable_serving() {
    let h = harness(ScriptedProber::healthy()).await;
    h.store.fail_set_stable.store(true, Ordering::SeqCst);

    let record = h.controller.run(request("v2")).await.unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::Degraded));
    // New stable group serves all traffic, canary is gone.
    assert_eq!(
        h.instances.group("account", GroupRole::Stable).unwrap().tag,
        "v2"
    );
    assert!(h.instances.group("account", GroupRole::Canary).is_none());
    assert_eq!(
        h.router.current_split("account").await,
        Some(TrafficSplit::all_stable())
    );
    // Stored tag lags by one rollout.
    assert_eq!(h.store.get_stable("account").unwrap(), "v1");

    let release = h.controller.release("account").unwrap();
    assert_eq!(release.phase, ReleasePhase::Degraded);
    assert_eq!(release.traffic_split, 0);
    let degraded = release.degraded.unwrap();
    assert_eq!(degraded.pending_tag.as_deref(), Some("v2"));

    // No automatic progress until resolved.
    let err = h.controller.submit(request("v3")).unwrap_err();
    assert!(matches!(err, ControllerError::Degraded { .. }));

    h.store.fail_set_stable.store(false, Ordering::SeqCst);
    let resolved = h.controller.resolve("account").await.unwrap();
    assert_eq!(resolved.phase, ReleasePhase::Idle);
    assert_settled_on(&h, "v2").await;

    h.controller.submit(request("v3")).unwrap();
}

#[tokio::test(start_paused = true)]
async fn resolve_fails_while_store_is_down() {
    let h = harness(ScriptedProber::healthy()).await;
    h.store.fail_set_stable.store(true, Ordering::SeqCst);
    h.controller.run(request("v2")).await.unwrap();

    let err = h.controller.resolve("account").await.unwrap_err();
    assert!(matches!(err, ControllerError::State(_)));
    assert_eq!(
        h.controller.release("account").unwrap().phase,
        ReleasePhase::Degraded
    );

    // A failed resolve does not leave the service marked busy.
    let err = h.controller.resolve("account").await.unwrap_err();
    assert!(matches!(err, ControllerError::State(_)));
}

#[tokio::test(start_paused = true)]
async fn concurrent_resolve_is_rejected() {
    let (h, observed) =
        observed_harness(ScriptedProber::healthy(), evaluation(), Duration::ZERO, false).await;
    h.store.fail_set_stable.store(true, Ordering::SeqCst);
    h.controller.run(request("v2")).await.unwrap();
    h.store.fail_set_stable.store(false, Ordering::SeqCst);

    observed.slow_ensure(Duration::from_secs(2));
    let controller = h.controller.clone();
    let first = tokio::spawn(async move { controller.resolve("account").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = h.controller.resolve("account").await.unwrap_err();
    assert!(matches!(err, ControllerError::ResolveInProgress(_)));
    assert_eq!(
        h.controller.release("account").unwrap().phase,
        ReleasePhase::Degraded
    );

    let resolved = first.await.unwrap().unwrap();
    assert_eq!(resolved.phase, ReleasePhase::Idle);
    assert_eq!(resolved.stable_tag, "v2");
    assert_eq!(h.store.get_stable("account").unwrap(), "v2");

    let err = h.controller.resolve("account").await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidPhase { .. }));
}

#[tokio::test(start_paused = true)]
async fn resolve_requires_degraded() {
    let h = harness(ScriptedProber::healthy()).await;
    let err = h.controller.resolve("account").await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::InvalidPhase {
            action: "resolve",
            ..
        }
    ));
}

// ── Direct release ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn direct_release_skips_canary() {
    let h = harness(ScriptedProber::healthy()).await;

    let record = h
        .controller
        .run(request("v2").with_canary(false))
        .await
        .unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::Promoted));
    assert_settled_on(&h, "v2").await;
    assert!(h.router.applied().iter().all(|(_, canary)| *canary == 0));
}

#[tokio::test(start_paused = true)]
async fn failed_direct_release_restores_old_stable() {
    let instances = LocalGroupManager::new().with_broken_tag("v2");
    let h = harness_with(ScriptedProber::healthy(), instances, evaluation()).await;

    let record = h
        .controller
        .run(request("v2").with_canary(false))
        .await
        .unwrap();

    assert_eq!(record.outcome, Some(RolloutOutcome::RolledBack));
    assert_settled_on(&h, "v1").await;
}

// ── Admission ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn second_request_mid_evaluation_is_rejected() {
    let eval = EvaluationConfig {
        window: "60s".to_string(),
        max_duration: "120s".to_string(),
        ..evaluation()
    };
    let h = harness_with(ScriptedProber::healthy(), LocalGroupManager::new(), eval).await;

    let first = h.controller.submit(request("v2")).unwrap();
    wait_for_phase(&h.controller, "account", ReleasePhase::Evaluating).await;
    let before = h.controller.release("account").unwrap();

    let err = h.controller.submit(request("v3")).unwrap_err();
    assert!(matches!(
        err,
        ControllerError::RolloutInProgress {
            phase: ReleasePhase::Evaluating,
            ..
        }
    ));

    let after = h.controller.release("account").unwrap();
    assert_eq!(after.active_rollout.as_deref(), Some(first.as_str()));
    assert_eq!(after.canary_tag.as_deref(), Some("v2"));
    assert_eq!(after.traffic_split, before.traffic_split);
    assert_eq!(
        h.instances.group("account", GroupRole::Canary).unwrap().tag,
        "v2"
    );
}

#[tokio::test(start_paused = true)]
async fn services_roll_out_independently() {
    let h = harness(ScriptedProber::healthy()).await;
    h.store.set_stable("transaction", "t1").unwrap();
    h.instances
        .ensure("transaction", GroupRole::Stable, "t1", 1)
        .await
        .unwrap();

    let account = h.controller.clone();
    let transaction = h.controller.clone();
    let (a, t) = tokio::join!(
        account.run(request("v2")),
        transaction.run(RolloutRequest::new("transaction", "t2", 50).with_promote(true)),
    );

    assert_eq!(a.unwrap().outcome, Some(RolloutOutcome::Promoted));
    assert_eq!(t.unwrap().outcome, Some(RolloutOutcome::Promoted));
    assert_eq!(h.store.get_stable("transaction").unwrap(), "t2");
    assert_settled_on(&h, "v2").await;
}

#[tokio::test(start_paused = true)]
async fn invalid_and_unknown_requests_are_rejected() {
    let h = harness(ScriptedProber::healthy()).await;

    let err = h
        .controller
        .submit(RolloutRequest::new("account", "v2", 150))
        .unwrap_err();
    assert!(matches!(err, ControllerError::InvalidRequest(_)));

    let err = h
        .controller
        .submit(RolloutRequest::new("ledger", "v2", 10))
        .unwrap_err();
    assert!(matches!(err, ControllerError::UnknownService(_)));

    assert_eq!(
        h.controller.release("account").unwrap().phase,
        ReleasePhase::Idle
    );
}

#[tokio::test(start_paused = true)]
async fn operator_commands_need_an_active_rollout() {
    let h = harness(ScriptedProber::healthy()).await;
    assert!(matches!(
        h.controller.promote("account").unwrap_err(),
        ControllerError::NoActiveRollout(_)
    ));
    assert!(matches!(
        h.controller.rollback("account").unwrap_err(),
        ControllerError::NoActiveRollout(_)
    ));
}

// ── Restart recovery ───────────────────────────────────────────────

fn interrupted(phase: ReleasePhase, split: u8) -> ServiceRelease {
    let mut release = ServiceRelease::new("account", "v1");
    release.canary_tag = Some("v2".to_string());
    release.traffic_split = split;
    release.requested_weight = 25;
    release.phase = phase;
    release.active_rollout = Some("account-1-0".to_string());
    release
}

#[tokio::test(start_paused = true)]
async fn restart_mid_evaluation_rolls_back() {
    let state = StateStore::open_in_memory().unwrap();
    state.set_stable("account", "v1").unwrap();
    state
        .put_release(&interrupted(ReleasePhase::Evaluating, 10))
        .unwrap();

    let instances = LocalGroupManager::new();
    instances.ensure("account", GroupRole::Stable, "v1", 2).await.unwrap();
    instances.ensure("account", GroupRole::Canary, "v2", 2).await.unwrap();
    let h = harness_from(state, ScriptedProber::healthy(), instances, evaluation()).await;
    h.router.apply_split("account", 90, 10).await.unwrap();

    let concluded = h.controller.recover().await.unwrap();

    assert_eq!(concluded.len(), 1);
    assert_eq!(concluded[0].id, "account-1-0");
    assert_eq!(concluded[0].outcome, Some(RolloutOutcome::Aborted));
    assert_eq!(concluded[0].requested_weight, 25);
    assert_settled_on(&h, "v1").await;
    assert_eq!(h.controller.history("account").unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_after_durable_promotion_rolls_forward() {
    let state = StateStore::open_in_memory().unwrap();
    state.set_stable("account", "v2").unwrap();
    state
        .put_release(&interrupted(ReleasePhase::Promoting, 100))
        .unwrap();

    let instances = LocalGroupManager::new();
    instances.ensure("account", GroupRole::Stable, "v2", 2).await.unwrap();
    instances.ensure("account", GroupRole::Canary, "v2", 2).await.unwrap();
    let h = harness_from(state, ScriptedProber::healthy(), instances, evaluation()).await;

    let concluded = h.controller.recover().await.unwrap();

    assert_eq!(concluded[0].outcome, Some(RolloutOutcome::Promoted));
    assert_eq!(concluded[0].requested_weight, 25);
    assert_settled_on(&h, "v2").await;
}

#[tokio::test(start_paused = true)]
async fn restart_mid_promotion_without_write_degrades() {
    let state = StateStore::open_in_memory().unwrap();
    state.set_stable("account", "v1").unwrap();
    state
        .put_release(&interrupted(ReleasePhase::Promoting, 100))
        .unwrap();

    let instances = LocalGroupManager::new();
    instances.ensure("account", GroupRole::Stable, "v2", 2).await.unwrap();
    let h = harness_from(state, ScriptedProber::healthy(), instances, evaluation()).await;

    let concluded = h.controller.recover().await.unwrap();

    assert_eq!(concluded[0].outcome, Some(RolloutOutcome::Degraded));
    let release = h.controller.release("account").unwrap();
    assert_eq!(release.phase, ReleasePhase::Degraded);
    assert_eq!(
        release.degraded.unwrap().pending_tag.as_deref(),
        Some("v2")
    );

    let resolved = h.controller.resolve("account").await.unwrap();
    assert_eq!(resolved.stable_tag, "v2");
    assert_eq!(h.store.get_stable("account").unwrap(), "v2");
}

#[tokio::test(start_paused = true)]
async fn idle_releases_survive_restart_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("canary.redb");
    {
        let state = StateStore::open(&path).unwrap();
        let h = harness_from(state, ScriptedProber::healthy(), LocalGroupManager::new(), evaluation()).await;
        h.controller.run(request("v2")).await.unwrap();
    }

    let state = StateStore::open(&path).unwrap();
    let instances = LocalGroupManager::new();
    instances.ensure("account", GroupRole::Stable, "v2", 2).await.unwrap();
    let h = harness_from(state, ScriptedProber::healthy(), instances, evaluation()).await;

    assert!(h.controller.recover().await.unwrap().is_empty());
    let release = h.controller.release("account").unwrap();
    assert_eq!(release.phase, ReleasePhase::Idle);
    assert_eq!(release.stable_tag, "v2");
    assert_eq!(h.controller.history("account").unwrap().len(), 1);

    let releases = h.controller.releases().unwrap();
    let names: Vec<&str> = releases.iter().map(|r| r.service.as_str()).collect();
    assert_eq!(names, vec!["account", "transaction"]);
}
