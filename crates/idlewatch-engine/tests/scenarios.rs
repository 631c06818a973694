//! End-to-end pass scenarios.
//!
//! Every scenario drives [`Watcher::run_pass`] with a manual clock, scripted
//! activity sources, and a fake instance control, and checks the durable
//! state left in the store. Times are minutes from the start of the idle
//! period unless stated otherwise.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use idlewatch_engine::{
    ControlFuture, ControlSurface, InstanceConfig, InstanceControl, InstanceState, ManualClock,
    PassReport, StopConfig, StopError, WatchConfig, WatchFile, Watcher,
};
use idlewatch_sampler::{ActivitySource, Sampler, SignalFuture, SourceConfig};
use idlewatch_state::{DecisionStatus, ShutdownDecision, StateError, StateStore};

const MIN: u64 = 60;

// ── Fakes ─────────────────────────────────────────────────────────

/// Activity source answering from a queue first, then a standing value.
#[derive(Default)]
struct Activity {
    queued: Mutex<VecDeque<Option<u64>>>,
    last: Mutex<Option<u64>>,
}

impl Activity {
    fn touch(&self, at: u64) {
        *self.last.lock().unwrap() = Some(at);
    }

    fn then(&self, answer: Option<u64>) {
        self.queued.lock().unwrap().push_back(answer);
    }
}

impl ActivitySource for Activity {
    fn name(&self) -> &str {
        "activity"
    }

    fn latest_activity(&self, _now: u64) -> SignalFuture<'_> {
        let answer = match self.queued.lock().unwrap().pop_front() {
            Some(queued) => queued,
            None => *self.last.lock().unwrap(),
        };
        Box::pin(async move { Ok(answer) })
    }
}

/// Instance control that remembers what it stopped.
#[derive(Default)]
struct FakeControl {
    stop_calls: Mutex<Vec<String>>,
    stopped: Mutex<HashSet<String>>,
    broken: HashSet<String>,
    delay: Option<Duration>,
}

impl FakeControl {
    fn calls(&self) -> usize {
        self.stop_calls.lock().unwrap().len()
    }

    fn calls_for(&self, id: &str) -> usize {
        self.stop_calls.lock().unwrap().iter().filter(|c| *c == id).count()
    }
}

impl InstanceControl for FakeControl {
    fn stop<'a>(&'a self, instance_id: &'a str) -> ControlFuture<'a, ()> {
        Box::pin(async move {
            self.stop_calls.lock().unwrap().push(instance_id.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.broken.contains(instance_id) {
                return Err(StopError::Other("AccessDenied".to_string()));
            }
            self.stopped.lock().unwrap().insert(instance_id.to_string());
            Ok(())
        })
    }

    fn describe<'a>(&'a self, instance_id: &'a str) -> ControlFuture<'a, InstanceState> {
        Box::pin(async move {
            if self.stopped.lock().unwrap().contains(instance_id) {
                Ok(InstanceState::Stopped)
            } else {
                Ok(InstanceState::Running)
            }
        })
    }
}

// ── Harness ───────────────────────────────────────────────────────

struct Harness {
    watcher: Watcher,
    store: StateStore,
    clock: Arc<ManualClock>,
    control: Arc<FakeControl>,
    sources: HashMap<String, Arc<Activity>>,
    origin: u64,
}

fn watch_file(ids: &[&str], threshold_minutes: u64) -> WatchFile {
    WatchFile {
        watch: WatchConfig {
            threshold_minutes,
            ..WatchConfig::default()
        },
        stop: StopConfig {
            max_attempts: 1,
            base_backoff: "1ms".to_string(),
            max_backoff: "1ms".to_string(),
            call_timeout: "5s".to_string(),
        },
        control: None,
        instances: ids
            .iter()
            .map(|id| InstanceConfig {
                id: id.to_string(),
                threshold_minutes: None,
                sources: vec![SourceConfig::Requests {
                    path: format!("/nonexistent/{id}.log").into(),
                }],
            })
            .collect(),
    }
}

impl Harness {
    fn new(ids: &[&str], threshold_minutes: u64) -> Self {
        Self::with(
            StateStore::open_in_memory().unwrap(),
            ids,
            threshold_minutes,
            FakeControl::default(),
            0,
        )
    }

    fn with(
        store: StateStore,
        ids: &[&str],
        threshold_minutes: u64,
        control: FakeControl,
        origin: u64,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(origin));
        let control = Arc::new(control);
        let sources: HashMap<String, Arc<Activity>> = ids
            .iter()
            .map(|id| (id.to_string(), Arc::new(Activity::default())))
            .collect();

        let by_id = sources.clone();
        let watcher = Watcher::new(
            store.clone(),
            Arc::new(watch_file(ids, threshold_minutes)),
            control.clone(),
            clock.clone(),
        )
        .with_sampler_fn(Arc::new(move |inst: &InstanceConfig| {
            let source = by_id[&inst.id].clone();
            Sampler::new(vec![source as Arc<dyn ActivitySource>])
        }));

        Self {
            watcher,
            store,
            clock,
            control,
            sources,
            origin,
        }
    }

    fn source(&self, id: &str) -> &Activity {
        &self.sources[id]
    }

    /// Run a pass at `minute` minutes after the origin.
    async fn pass_at(&self, minute: u64) -> PassReport {
        self.clock.set(self.origin + minute * MIN);
        self.watcher.run_pass().await.unwrap()
    }

    fn unresolved(&self, id: &str) -> usize {
        self.store
            .list_decisions_for_instance(id)
            .unwrap()
            .iter()
            .filter(|d| d.is_unresolved())
            .count()
    }
}

// ── Scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn morning_trace_stops_at_half_past() {
    // 09:00 last activity, 5-minute polls, 30-minute threshold.
    let nine = 9 * 3_600;
    let h = Harness::with(
        StateStore::open_in_memory().unwrap(),
        &["nb-1"],
        30,
        FakeControl::default(),
        nine,
    );
    h.source("nb-1").touch(nine);

    for minute in (0..=25).step_by(5) {
        let report = h.pass_at(minute).await;
        assert_eq!(report.proposed(), 0, "nothing expected at 09:{minute:02}");
    }
    assert_eq!(h.control.calls(), 0);

    let report = h.pass_at(30).await;
    assert_eq!(report.proposed(), 1);
    assert_eq!(report.executed(), 1);

    let decision = h.store.latest_decision("nb-1").unwrap().unwrap();
    assert_eq!(decision.decided_at, nine + 30 * MIN);
    assert_eq!(decision.status, DecisionStatus::Executed);
    assert!(decision.resolved_at.unwrap() <= nine + 31 * MIN);
    assert_eq!(h.control.calls(), 1);
}

#[tokio::test]
async fn proposal_fires_exactly_at_threshold() {
    let h = Harness::new(&["nb-1"], 30);
    h.source("nb-1").touch(0);

    let mut first = None;
    for minute in 0..=40 {
        if h.pass_at(minute).await.proposed() > 0 && first.is_none() {
            first = Some(minute);
        }
    }
    assert_eq!(first, Some(30));
    assert_eq!(h.control.calls(), 1);
}

#[tokio::test]
async fn override_holds_until_its_end() {
    let h = Harness::new(&["nb-1"], 30);
    h.source("nb-1").touch(0);
    h.pass_at(0).await;
    ControlSurface::new(h.watcher.clone())
        .set_override("nb-1", 60)
        .unwrap();

    for minute in 1..60 {
        let report = h.pass_at(minute).await;
        assert_eq!(report.proposed(), 0, "proposal at t={minute}");
    }
    assert_eq!(h.control.calls(), 0);

    let report = h.pass_at(60).await;
    assert_eq!(report.proposed(), 1);
    assert_eq!(h.control.calls(), 1);
}

fn reopen(path: &Path, ids: &[&str]) -> Harness {
    let store = StateStore::open(path).unwrap();
    let h = Harness::with(store, ids, 30, FakeControl::default(), 0);
    h.source("nb-1").touch(0);
    h
}

#[tokio::test]
async fn restart_keeps_the_idle_period() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idlewatch.redb");

    {
        let h = reopen(&path, &["nb-1"]);
        for minute in 0..=10 {
            h.pass_at(minute).await;
        }
    }

    // Controller restarts at t=11 with a fresh process and the same file.
    let h = reopen(&path, &["nb-1"]);
    for minute in 11..30 {
        assert_eq!(h.pass_at(minute).await.proposed(), 0);
    }
    let record = h.store.get_idle_record("nb-1").unwrap().unwrap();
    assert_eq!(record.idle_since, 0);

    let report = h.pass_at(30).await;
    assert_eq!(report.proposed(), 1);
    assert_eq!(h.control.calls(), 1);
}

#[tokio::test]
async fn resume_between_proposal_and_execution_prevents_stop() {
    let h = Harness::new(&["nb-1"], 30);
    h.source("nb-1").touch(0);
    h.pass_at(0).await;

    // First sample of the t=30 pass sees nothing new; the pre-stop sample
    // sees the user who just came back.
    h.source("nb-1").then(Some(0));
    h.source("nb-1").then(Some(30 * MIN));
    let report = h.pass_at(30).await;

    assert_eq!(report.proposed(), 1);
    assert_eq!(report.executed(), 0);
    assert_eq!(report.cancelled(), 1);
    assert_eq!(h.control.calls(), 0);

    let decision = h.store.latest_decision("nb-1").unwrap().unwrap();
    assert_eq!(decision.status, DecisionStatus::Cancelled);
    assert_eq!(
        h.store.get_idle_record("nb-1").unwrap().unwrap().idle_since,
        30 * MIN
    );
}

#[tokio::test]
async fn reenabling_resumes_where_tracking_left_off() {
    let h = Harness::new(&["nb-1"], 30);
    h.source("nb-1").touch(0);
    h.pass_at(0).await;
    let surface = ControlSurface::new(h.watcher.clone());
    surface.disable().unwrap();

    // Disabled: still tracked, nothing proposed.
    let report = h.pass_at(40).await;
    assert_eq!(report.proposed(), 0);
    assert_eq!(report.instance("nb-1").unwrap().idle_secs, Some(40 * MIN));
    assert_eq!(h.unresolved("nb-1"), 0);

    surface.enable().unwrap();
    let report = h.pass_at(45).await;
    assert_eq!(report.proposed(), 1);
    assert_eq!(h.control.calls(), 1);
}

/// A decision proposed by a pass that crashed before executing it.
fn leave_proposal(store: &StateStore) {
    let decision = ShutdownDecision::propose("nb-1", 0, 1, 30 * MIN, "idle".to_string());
    store
        .with_instance::<_, StateError, _>("nb-1", |txn| txn.put_decision(&decision))
        .unwrap();
}

#[tokio::test]
async fn leftover_proposal_is_executed_by_next_pass() {
    let h = Harness::new(&["nb-1"], 30);
    h.source("nb-1").touch(0);
    h.pass_at(0).await;
    leave_proposal(&h.store);

    let report = h.pass_at(31).await;
    assert_eq!(report.proposed(), 0);
    assert_eq!(report.executed(), 1);
    assert_eq!(h.control.calls(), 1);
    let decisions = h.store.list_decisions_for_instance("nb-1").unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].status, DecisionStatus::Executed);
}

#[tokio::test]
async fn leftover_proposal_is_cancelled_by_activity() {
    let h = Harness::new(&["nb-1"], 30);
    h.source("nb-1").touch(0);
    h.pass_at(0).await;
    leave_proposal(&h.store);

    h.source("nb-1").touch(31 * MIN);
    let report = h.pass_at(31).await;
    assert_eq!(report.cancelled(), 1);
    assert_eq!(h.control.calls(), 0);
    assert_eq!(
        h.store.latest_decision("nb-1").unwrap().unwrap().status,
        DecisionStatus::Cancelled
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_passes_never_double_stop() {
    let control = FakeControl {
        delay: Some(Duration::from_millis(50)),
        ..FakeControl::default()
    };
    let h = Harness::with(
        StateStore::open_in_memory().unwrap(),
        &["nb-1", "nb-2"],
        30,
        control,
        0,
    );
    h.source("nb-1").touch(0);
    h.source("nb-2").touch(0);
    h.pass_at(0).await;

    h.clock.set(30 * MIN);
    let other = h.watcher.clone();
    let (a, b) = tokio::join!(h.watcher.run_pass(), other.run_pass());
    a.unwrap();
    b.unwrap();

    for id in ["nb-1", "nb-2"] {
        assert_eq!(h.control.calls_for(id), 1, "{id} stopped more than once");
        assert_eq!(h.unresolved(id), 0);
        let decisions = h.store.list_decisions_for_instance(id).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].status, DecisionStatus::Executed);
    }
}

#[tokio::test]
async fn at_most_one_unresolved_decision_throughout() {
    let control = FakeControl {
        broken: HashSet::from(["nb-1".to_string()]),
        ..FakeControl::default()
    };
    let h = Harness::with(
        StateStore::open_in_memory().unwrap(),
        &["nb-1"],
        10,
        control,
        0,
    );
    h.source("nb-1").touch(0);

    // Activity comes and goes while stops keep failing.
    let touches = [3, 25, 26, 50];
    for minute in 0..=80 {
        if touches.contains(&minute) {
            h.source("nb-1").touch(minute * MIN);
        }
        h.pass_at(minute).await;
        assert!(h.unresolved("nb-1") <= 1, "two unresolved decisions at t={minute}");
    }
}

#[tokio::test]
async fn one_failing_instance_does_not_block_others() {
    let control = FakeControl {
        broken: HashSet::from(["broken".to_string()]),
        ..FakeControl::default()
    };
    let h = Harness::with(
        StateStore::open_in_memory().unwrap(),
        &["broken", "healthy-a", "healthy-b"],
        30,
        control,
        0,
    );
    for id in ["broken", "healthy-a", "healthy-b"] {
        h.source(id).touch(0);
    }
    h.pass_at(0).await;

    let report = h.pass_at(30).await;
    assert_eq!(report.instances.len(), 3);
    assert_eq!(report.executed(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(h.control.calls_for("healthy-a"), 1);
    assert_eq!(h.control.calls_for("healthy-b"), 1);

    let status = ControlSurface::new(h.watcher.clone()).status("broken").unwrap();
    assert_eq!(
        status.last_decision.unwrap().status,
        DecisionStatus::Failed
    );
    assert!(status.last_error.unwrap().message.contains("AccessDenied"));
}

#[tokio::test]
async fn repeated_pass_is_idempotent() {
    let h = Harness::new(&["nb-1"], 30);
    h.source("nb-1").touch(0);

    h.pass_at(20).await;
    let before = h.store.get_idle_record("nb-1").unwrap();
    h.pass_at(20).await;
    assert_eq!(h.store.get_idle_record("nb-1").unwrap(), before);

    h.pass_at(30).await;
    h.pass_at(30).await;
    h.pass_at(30).await;
    assert_eq!(h.control.calls(), 1);
    assert_eq!(h.store.list_decisions_for_instance("nb-1").unwrap().len(), 1);
}

#[tokio::test]
async fn late_pass_acts_once() {
    let h = Harness::new(&["nb-1"], 30);
    h.source("nb-1").touch(0);
    h.pass_at(5).await;

    // The scheduler was down from t=5 to t=95.
    let report = h.pass_at(95).await;
    assert_eq!(report.proposed(), 1);
    assert_eq!(h.control.calls(), 1);
    let decision = h.store.latest_decision("nb-1").unwrap().unwrap();
    assert_eq!(decision.decision_id, "0-1");
}
