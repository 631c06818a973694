//! Pass runner — one evaluation cycle over every monitored instance.
//!
//! A pass is stateless: everything it needs is re-read from the config
//! file and the state store, so running it late, twice, or from a fresh
//! process after a crash reaches the same result as a single on-time run.
//!
//! ```text
//! load config ── error → abort before any write
//! seed/read settings
//! per instance (bounded concurrency, faults isolated):
//!   sample sources
//!   restart check (idle period already stopped → describe)
//!   txn: merge sample, decide, propose / cancel
//!   coordinator: execute pending decision (enabled only)
//! archive resolved decisions older than retention
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use idlewatch_sampler::{build_sampler, ActivitySample, Sampler};
use idlewatch_state::{
    DecisionStatus, ErrorKind, InstanceError, Settings, ShutdownDecision, StateStore, Timestamp,
};

use crate::clock::Clock;
use crate::config::{ConfigSource, InstanceConfig, StopPolicy, WatchFile};
use crate::coordinator::{ExecutionResult, ShutdownCoordinator};
use crate::decision::{self, DecisionConfig, DecisionOutcome};
use crate::error::{EngineError, EngineResult};
use crate::instance::{InstanceControl, StopError};
use crate::tracker;

/// Builds the sampler for one configured instance.
pub type SamplerFn = Arc<dyn Fn(&InstanceConfig) -> Sampler + Send + Sync>;

/// Source name used for the synthetic signal of a restarted instance.
pub const RESTART_SIGNAL: &str = "restart";

/// What happened to one instance during a pass.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DecisionOutcome>,
    /// Why a proposal was withheld although the threshold was reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstanceReport {
    fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            idle_secs: None,
            outcome: None,
            held: None,
            decision_id: None,
            execution: None,
            error: None,
        }
    }
}

/// Summary of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub started_at: Timestamp,
    pub enabled: bool,
    pub instances: Vec<InstanceReport>,
    /// Resolved decisions moved to the archive.
    pub archived: u32,
}

impl PassReport {
    pub fn proposed(&self) -> usize {
        self.count(|r| r.outcome == Some(DecisionOutcome::Propose))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|r| {
            r.outcome == Some(DecisionOutcome::Cancel)
                || matches!(r.execution, Some(ExecutionResult::Cancelled { .. }))
        })
    }

    pub fn executed(&self) -> usize {
        self.count(|r| matches!(r.execution, Some(ExecutionResult::Executed { .. })))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r.execution, Some(ExecutionResult::Failed { .. })))
    }

    pub fn errors(&self) -> usize {
        self.count(|r| r.error.is_some())
    }

    pub fn instance(&self, id: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|r| r.instance_id == id)
    }

    fn count(&self, f: impl Fn(&InstanceReport) -> bool) -> usize {
        self.instances.iter().filter(|r| f(r)).count()
    }
}

/// Per-pass parameters shared by every instance task.
#[derive(Debug, Clone)]
struct PassContext {
    settings: Settings,
    policy: StopPolicy,
    max_decision_failures: u32,
}

/// Result of the per-instance transaction.
struct Evaluated {
    idle_secs: u64,
    outcome: DecisionOutcome,
    held: Option<String>,
    /// Held because too many shutdowns failed; surfaced as a policy error.
    failure_hold: bool,
    pending: Option<ShutdownDecision>,
}

/// Runs passes. Cheap to clone; clones share the store and coordinator.
#[derive(Clone)]
pub struct Watcher {
    store: StateStore,
    config: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    coordinator: Arc<ShutdownCoordinator>,
    sampler_fn: SamplerFn,
}

impl Watcher {
    pub fn new(
        store: StateStore,
        config: Arc<dyn ConfigSource>,
        control: Arc<dyn InstanceControl>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let coordinator = Arc::new(ShutdownCoordinator::new(
            store.clone(),
            control,
            clock.clone(),
        ));
        Self {
            store,
            config,
            clock,
            coordinator,
            sampler_fn: Arc::new(|inst: &InstanceConfig| build_sampler(&inst.sources)),
        }
    }

    /// Replace how samplers are built from instance configs.
    pub fn with_sampler_fn(mut self, f: SamplerFn) -> Self {
        self.sampler_fn = f;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config_source(&self) -> &Arc<dyn ConfigSource> {
        &self.config
    }

    /// Run one pass over every configured instance.
    ///
    /// Fails only if the config file or the settings cannot be read; every
    /// per-instance failure is recorded and reported instead.
    pub async fn run_pass(&self) -> EngineResult<PassReport> {
        let started_at = self.clock.now();
        let file = self.config.load()?;
        let policy = file.stop.policy()?;
        let retention = file.watch.retention()?;
        let settings = self.store.settings_or_seed(&file.watch.seed_settings())?;

        info!(
            instances = file.instances.len(),
            enabled = settings.enabled,
            threshold_minutes = settings.threshold_minutes,
            "pass started"
        );

        let ctx = PassContext {
            settings: settings.clone(),
            policy,
            max_decision_failures: file.watch.max_decision_failures,
        };
        let mut instances = self.evaluate_all(&file, &ctx).await;
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let cutoff = self.clock.now().saturating_sub(retention.as_secs());
        let archived = match self.store.archive_resolved(cutoff) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "archiving resolved decisions failed");
                0
            }
        };

        let report = PassReport {
            started_at,
            enabled: settings.enabled,
            instances,
            archived,
        };
        info!(
            proposed = report.proposed(),
            cancelled = report.cancelled(),
            executed = report.executed(),
            failed = report.failed(),
            errors = report.errors(),
            archived,
            "pass finished"
        );
        Ok(report)
    }

    async fn evaluate_all(&self, file: &WatchFile, ctx: &PassContext) -> Vec<InstanceReport> {
        let limit = file.watch.worker_limit.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();

        for inst in &file.instances {
            let watcher = self.clone();
            let inst = inst.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                watcher.evaluate_instance(&inst, &ctx).await
            });
        }

        let mut reports = Vec::with_capacity(file.instances.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "instance task panicked"),
            }
        }
        reports
    }

    /// Evaluate one instance. Never fails; errors land in the report and
    /// in the instance's error slot.
    async fn evaluate_instance(&self, inst: &InstanceConfig, ctx: &PassContext) -> InstanceReport {
        let mut report = InstanceReport::new(&inst.id);
        if let Err(e) = self.try_evaluate(inst, ctx, &mut report).await {
            warn!(instance = %inst.id, error = %e, "instance evaluation failed");
            self.record_error(&inst.id, error_kind(&e), &e.to_string());
            report.error = Some(e.to_string());
        }
        report
    }

    async fn try_evaluate(
        &self,
        inst: &InstanceConfig,
        ctx: &PassContext,
        report: &mut InstanceReport,
    ) -> EngineResult<()> {
        inst.validate()?;
        let config = DecisionConfig {
            threshold_minutes: inst.effective_threshold(&ctx.settings)?,
        };

        let sampler = (self.sampler_fn)(inst);
        let now = self.clock.now();
        let mut sample = sampler.sample(&inst.id, now).await;
        if !sample.unavailable.is_empty() {
            let reasons: Vec<String> = sample
                .unavailable
                .iter()
                .map(|u| format!("{}: {}", u.source, u.reason))
                .collect();
            self.record_error(&inst.id, ErrorKind::SignalUnavailable, &reasons.join("; "));
        }

        self.check_restart(&inst.id, &mut sample, now, &ctx.policy).await?;

        let evaluated = self.store.with_instance(&inst.id, |txn| -> EngineResult<Evaluated> {
            let merged = tracker::merge_in(txn, &sample)?;
            let record = merged.record;
            let existing = txn.unresolved_decision()?;
            let outcome = decision::decide(&record, &config, existing.as_ref(), now);
            let idle_secs = record.idle_secs(now);

            match outcome {
                DecisionOutcome::Propose => {
                    let period = txn.period_decisions(record.idle_since)?;
                    let mut failure_hold = false;
                    let held = if !ctx.settings.enabled {
                        Some("controller disabled".to_string())
                    } else if period.iter().any(|d| d.status == DecisionStatus::Executed) {
                        Some("already stopped for this idle period".to_string())
                    } else {
                        let failures = period
                            .iter()
                            .filter(|d| d.status == DecisionStatus::Failed)
                            .count() as u32;
                        failure_hold = failures >= ctx.max_decision_failures;
                        failure_hold.then(|| {
                            format!("{failures} failed shutdowns for this idle period")
                        })
                    };

                    if let Some(reason) = held {
                        return Ok(Evaluated {
                            idle_secs,
                            outcome: DecisionOutcome::None,
                            held: Some(reason),
                            failure_hold,
                            pending: None,
                        });
                    }

                    let sequence = txn.next_sequence(record.idle_since)?;
                    let proposed = ShutdownDecision::propose(
                        &inst.id,
                        record.idle_since,
                        sequence,
                        now,
                        decision::propose_reason(&record, &config, now),
                    );
                    txn.put_decision(&proposed)?;
                    info!(
                        instance = %inst.id,
                        decision = %proposed.decision_id,
                        idle_secs,
                        "shutdown proposed"
                    );
                    Ok(Evaluated {
                        idle_secs,
                        outcome,
                        held: None,
                        failure_hold: false,
                        pending: Some(proposed),
                    })
                }
                DecisionOutcome::Cancel => {
                    if let Some(mut pending) = existing {
                        pending.reason = format!("{}; cancelled: activity resumed", pending.reason);
                        pending.resolve(DecisionStatus::Cancelled, now);
                        txn.put_decision(&pending)?;
                        info!(
                            instance = %inst.id,
                            decision = %pending.decision_id,
                            "shutdown cancelled, activity resumed"
                        );
                    }
                    Ok(Evaluated {
                        idle_secs,
                        outcome,
                        held: None,
                        failure_hold: false,
                        pending: None,
                    })
                }
                // An unresolved decision left by an earlier pass (or one
                // under a fresh override) still goes to the coordinator,
                // which re-checks and resolves it.
                DecisionOutcome::None => Ok(Evaluated {
                    idle_secs,
                    outcome,
                    held: None,
                    failure_hold: false,
                    pending: existing,
                }),
            }
        })?;

        report.idle_secs = Some(evaluated.idle_secs);
        report.outcome = Some(evaluated.outcome);
        if evaluated.failure_hold
            && let Some(reason) = &evaluated.held
        {
            warn!(instance = %inst.id, %reason, "shutdown withheld");
            self.record_error(&inst.id, ErrorKind::Policy, reason);
        }
        report.held = evaluated.held;

        let Some(pending) = evaluated.pending else {
            return Ok(());
        };
        report.decision_id = Some(pending.decision_id.clone());
        if !ctx.settings.enabled {
            debug!(instance = %inst.id, decision = %pending.decision_id, "disabled, leaving decision pending");
            return Ok(());
        }

        let fresh = sampler.sample(&inst.id, self.clock.now()).await;
        let result = self
            .coordinator
            .execute(&pending, Some(&fresh), &config, &ctx.policy)
            .await?;
        if let ExecutionResult::Failed { attempts, error } = &result {
            self.record_error(
                &inst.id,
                ErrorKind::StopApi,
                &format!("stop failed after {attempts} attempts: {error}"),
            );
        }
        report.execution = Some(result);
        Ok(())
    }

    /// If this idle period already ended in a stop, ask whether the
    /// instance is still down.
    ///
    /// An instance that is back up gets a synthetic activity signal at
    /// `now`, which starts a new idle period. Otherwise the period stays
    /// held and no new decision is proposed for it.
    async fn check_restart(
        &self,
        instance_id: &str,
        sample: &mut ActivitySample,
        now: Timestamp,
        policy: &StopPolicy,
    ) -> EngineResult<()> {
        let Some(record) = self.store.get_idle_record(instance_id)? else {
            return Ok(());
        };
        let period = tracker::merge(&record, sample, now).idle_since;
        let stopped = self
            .store
            .list_decisions_for_instance(instance_id)?
            .into_iter()
            .chain(self.store.list_archived_for_instance(instance_id)?)
            .any(|d| d.idle_since == period && d.status == DecisionStatus::Executed);
        if !stopped {
            return Ok(());
        }

        let describe = self.coordinator.control().describe(instance_id);
        let state = tokio::time::timeout(policy.call_timeout, describe)
            .await
            .unwrap_or(Err(StopError::Timeout(policy.call_timeout)));
        match state {
            Ok(state) if state.is_up() => {
                info!(instance = %instance_id, ?state, "instance running again after stop");
                sample.push_signal(RESTART_SIGNAL, Some(now));
            }
            Ok(state) => debug!(instance = %instance_id, ?state, "instance still down"),
            Err(e) => self.record_error(
                instance_id,
                ErrorKind::StopApi,
                &format!("describe after stop failed: {e}"),
            ),
        }
        Ok(())
    }

    fn record_error(&self, instance_id: &str, kind: ErrorKind, message: &str) {
        let error = InstanceError {
            instance_id: instance_id.to_string(),
            kind,
            message: message.to_string(),
            at: self.clock.now(),
        };
        if let Err(e) = self.store.record_error(&error) {
            warn!(instance = %instance_id, error = %e, "failed to record instance error");
        }
    }

    /// Poll period from the stored settings, at least one minute.
    pub fn poll_period(&self) -> Duration {
        let minutes = match self.store.get_settings() {
            Ok(Some(settings)) => settings.poll_period_minutes,
            Ok(None) => Settings::default().poll_period_minutes,
            Err(e) => {
                warn!(error = %e, "failed to read settings, using default poll period");
                Settings::default().poll_period_minutes
            }
        };
        Duration::from_secs(minutes.max(1) * 60)
    }

    /// Run passes until `shutdown` flips. The poll period is re-read from
    /// the settings after every pass.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("watcher started");

        loop {
            if let Err(e) = self.run_pass().await {
                error!(error = %e, "pass failed");
            }

            let period = self.poll_period();
            debug!(period_secs = period.as_secs(), "waiting for next pass");
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => {
                    info!("watcher shutting down");
                    break;
                }
            }
        }
    }
}

fn error_kind(e: &EngineError) -> ErrorKind {
    match e {
        EngineError::Config(_) | EngineError::UnknownInstance(_) => ErrorKind::Config,
        EngineError::State(_) => ErrorKind::Persistence,
        EngineError::Stop(_) => ErrorKind::StopApi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use idlewatch_sampler::{ActivitySource, SignalError, SignalFuture, SourceConfig};

    use crate::clock::ManualClock;
    use crate::config::{StopConfig, WatchConfig};
    use crate::coordinator::tests::MockControl;
    use crate::instance::{InstanceState, StopError};

    const MIN: u64 = 60;

    /// Source whose answer the test sets.
    struct Scripted {
        value: Mutex<Result<Option<u64>, String>>,
    }

    impl Scripted {
        fn new(at: Option<u64>) -> Arc<Self> {
            Arc::new(Self {
                value: Mutex::new(Ok(at)),
            })
        }
    }

    impl ActivitySource for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn latest_activity(&self, _now: u64) -> SignalFuture<'_> {
            let value = self.value.lock().unwrap().clone();
            Box::pin(async move { value.map_err(SignalError::Unavailable) })
        }
    }

    fn instance(id: &str) -> InstanceConfig {
        InstanceConfig {
            id: id.to_string(),
            threshold_minutes: None,
            sources: vec![SourceConfig::Requests {
                path: format!("/tmp/{id}.log").into(),
            }],
        }
    }

    fn file(ids: &[&str]) -> WatchFile {
        WatchFile {
            watch: WatchConfig {
                threshold_minutes: 30,
                ..WatchConfig::default()
            },
            stop: StopConfig {
                max_attempts: 2,
                base_backoff: "1ms".to_string(),
                max_backoff: "2ms".to_string(),
                call_timeout: "1s".to_string(),
            },
            control: None,
            instances: ids.iter().map(|id| instance(id)).collect(),
        }
    }

    struct Fixture {
        watcher: Watcher,
        store: StateStore,
        clock: Arc<ManualClock>,
        control: Arc<MockControl>,
        source: Arc<Scripted>,
    }

    fn fixture(file: WatchFile, control: MockControl) -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let control = Arc::new(control);
        let source = Scripted::new(None);
        let shared = source.clone();
        let watcher = Watcher::new(store.clone(), Arc::new(file), control.clone(), clock.clone())
            .with_sampler_fn(Arc::new(move |_inst: &InstanceConfig| {
                Sampler::new(vec![shared.clone() as Arc<dyn ActivitySource>])
            }));
        Fixture {
            watcher,
            store,
            clock,
            control,
            source,
        }
    }

    #[tokio::test]
    async fn idle_instance_is_stopped_at_threshold() {
        let f = fixture(file(&["nb-1"]), MockControl::new());

        f.watcher.run_pass().await.unwrap();
        f.clock.set(29 * MIN);
        let report = f.watcher.run_pass().await.unwrap();
        assert_eq!(report.proposed(), 0);
        assert_eq!(f.control.stop_calls(), 0);

        f.clock.set(30 * MIN);
        let report = f.watcher.run_pass().await.unwrap();
        assert_eq!(report.proposed(), 1);
        assert_eq!(report.executed(), 1);
        assert_eq!(f.control.stop_calls(), 1);
    }

    #[tokio::test]
    async fn stopped_instance_is_not_stopped_again() {
        let f = fixture(file(&["nb-1"]), MockControl::new());
        f.watcher.run_pass().await.unwrap();
        f.clock.set(30 * MIN);
        f.watcher.run_pass().await.unwrap();
        assert_eq!(f.control.stop_calls(), 1);

        for minute in [35, 40, 45] {
            f.clock.set(minute * MIN);
            let report = f.watcher.run_pass().await.unwrap();
            assert_eq!(report.proposed(), 0);
            assert!(report.instance("nb-1").unwrap().held.is_some());
        }
        assert_eq!(f.control.stop_calls(), 1);
    }

    #[tokio::test]
    async fn restarted_instance_starts_a_new_idle_period() {
        let f = fixture(file(&["nb-1"]), MockControl::new());
        f.watcher.run_pass().await.unwrap();
        f.clock.set(30 * MIN);
        f.watcher.run_pass().await.unwrap();

        // User starts the instance again but does nothing with it.
        *f.control.state.lock().unwrap() = InstanceState::Running;
        f.clock.set(50 * MIN);
        f.watcher.run_pass().await.unwrap();
        assert_eq!(
            f.store.get_idle_record("nb-1").unwrap().unwrap().idle_since,
            50 * MIN
        );

        f.clock.set(80 * MIN);
        let report = f.watcher.run_pass().await.unwrap();
        assert_eq!(report.executed(), 1);
        assert_eq!(f.control.stop_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_describe_after_stop_does_not_stall_the_pass() {
        let f = fixture(file(&["nb-1", "nb-2"]), MockControl::new());
        f.watcher.run_pass().await.unwrap();
        f.clock.set(30 * MIN);
        f.watcher.run_pass().await.unwrap();
        assert_eq!(f.control.stop_calls(), 2);

        f.control
            .describe_hangs
            .store(true, std::sync::atomic::Ordering::SeqCst);
        f.clock.set(40 * MIN);
        let report = tokio::time::timeout(Duration::from_secs(5), f.watcher.run_pass())
            .await
            .expect("pass finished within the call timeout")
            .unwrap();

        assert_eq!(report.instances.len(), 2);
        assert_eq!(f.control.stop_calls(), 2);
        let err = f.store.get_error("nb-1").unwrap().unwrap();
        assert_eq!(err.kind, ErrorKind::StopApi);
        assert!(err.message.contains("timed out"), "{}", err.message);
    }

    #[tokio::test]
    async fn disabled_controller_tracks_but_never_stops() {
        let f = fixture(file(&["nb-1"]), MockControl::new());
        f.watcher.run_pass().await.unwrap();
        f.store
            .update_settings(&Settings::default(), |s| s.enabled = false)
            .unwrap();

        f.clock.set(90 * MIN);
        let report = f.watcher.run_pass().await.unwrap();
        assert!(!report.enabled);
        assert_eq!(report.proposed(), 0);
        assert_eq!(f.control.stop_calls(), 0);
        assert_eq!(report.instance("nb-1").unwrap().idle_secs, Some(90 * MIN));
    }

    #[tokio::test]
    async fn failed_source_degrades_and_is_recorded() {
        let f = fixture(file(&["nb-1"]), MockControl::new());
        *f.source.value.lock().unwrap() = Err("connection refused".to_string());

        let report = f.watcher.run_pass().await.unwrap();
        assert!(report.instance("nb-1").unwrap().error.is_none());
        let err = f.store.get_error("nb-1").unwrap().unwrap();
        assert_eq!(err.kind, ErrorKind::SignalUnavailable);
        assert!(err.message.contains("connection refused"));
    }

    #[tokio::test]
    async fn invalid_instance_threshold_skips_only_that_instance() {
        let mut file = file(&["good", "bad"]);
        file.instances[1].threshold_minutes = Some(0);
        let f = fixture(file, MockControl::new());

        let report = f.watcher.run_pass().await.unwrap();
        assert_eq!(report.errors(), 1);
        assert!(report.instance("bad").unwrap().error.is_some());
        assert!(f.store.get_idle_record("bad").unwrap().is_none());
        assert!(f.store.get_idle_record("good").unwrap().is_some());
        assert_eq!(f.store.get_error("bad").unwrap().unwrap().kind, ErrorKind::Config);
    }

    #[tokio::test]
    async fn repeated_failures_stop_new_proposals() {
        let results = (0..20)
            .map(|i| Err(StopError::Throttled(format!("{i}"))))
            .collect();
        let mut file = file(&["nb-1"]);
        file.watch.max_decision_failures = 2;
        let f = fixture(file, MockControl::with_results(results));

        f.watcher.run_pass().await.unwrap();
        for minute in [30, 35, 40] {
            f.clock.set(minute * MIN);
            f.watcher.run_pass().await.unwrap();
        }

        // Two decisions, two attempts each; the third proposal is withheld.
        assert_eq!(f.control.stop_calls(), 4);
        let decisions = f.store.list_decisions_for_instance("nb-1").unwrap();
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| d.status == DecisionStatus::Failed));
        assert_eq!(f.store.get_error("nb-1").unwrap().unwrap().kind, ErrorKind::Policy);
    }

    #[tokio::test]
    async fn unparseable_config_aborts_before_writes() {
        struct Broken;
        impl ConfigSource for Broken {
            fn load(&self) -> Result<WatchFile, crate::error::ConfigError> {
                WatchFile::parse("[[instances]]\nid = \"a:b\"\n")
            }
        }
        let store = StateStore::open_in_memory().unwrap();
        let watcher = Watcher::new(
            store.clone(),
            Arc::new(Broken),
            Arc::new(MockControl::new()),
            Arc::new(ManualClock::new(0)),
        );

        assert!(watcher.run_pass().await.is_err());
        assert!(store.get_settings().unwrap().is_none());
    }

    #[tokio::test]
    async fn resolved_decisions_are_archived_after_retention() {
        let mut file = file(&["nb-1"]);
        file.watch.decision_retention = "1h".to_string();
        let f = fixture(file, MockControl::new());

        f.watcher.run_pass().await.unwrap();
        f.clock.set(30 * MIN);
        f.watcher.run_pass().await.unwrap();
        assert_eq!(f.store.list_decisions_for_instance("nb-1").unwrap().len(), 1);

        f.clock.set(30 * MIN + 3_600);
        let report = f.watcher.run_pass().await.unwrap();
        assert_eq!(report.archived, 1);
        assert!(f.store.list_decisions_for_instance("nb-1").unwrap().is_empty());
        assert_eq!(f.store.list_archived_for_instance("nb-1").unwrap().len(), 1);

        // Still recognised as stopped through the archive.
        f.clock.advance(5 * MIN);
        let report = f.watcher.run_pass().await.unwrap();
        assert_eq!(report.proposed(), 0);
        assert_eq!(f.control.stop_calls(), 1);
    }

    #[tokio::test]
    async fn report_serializes_for_operators() {
        let f = fixture(file(&["nb-1"]), MockControl::new());
        f.watcher.run_pass().await.unwrap();
        f.clock.set(30 * MIN);
        let report = f.watcher.run_pass().await.unwrap();

        let json = serde_json::to_value(&report).unwrap();
        let inst = &json["instances"][0];
        assert_eq!(inst["outcome"], "propose");
        assert_eq!(inst["decision_id"], "0-1");
        assert_eq!(inst["execution"]["result"], "executed");
        assert!(inst.get("error").is_none());
    }

    #[test]
    fn poll_period_defaults_and_floors() {
        let f = fixture(file(&[]), MockControl::new());
        assert_eq!(f.watcher.poll_period(), Duration::from_secs(5 * 60));
        f.store
            .update_settings(&Settings::default(), |s| s.poll_period_minutes = 0)
            .unwrap();
        assert_eq!(f.watcher.poll_period(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_stops_on_shutdown() {
        let f = fixture(file(&["nb-1"]), MockControl::new());
        let (tx, rx) = tokio::sync::watch::channel(false);
        let watcher = f.watcher.clone();
        let handle = tokio::spawn(async move { watcher.run(rx).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(f.store.get_idle_record("nb-1").unwrap().is_some());
    }
}
