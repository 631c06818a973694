//! Shutdown coordinator — turns a proposed decision into at most one stop.
//!
//! # Execution
//!
//! ```text
//! confirm   (one transaction: merge fresh sample, re-read record + decision)
//!   ├── resolved / controller disabled → Skipped
//!   ├── override active / idle < limit → Cancelled (stop never called)
//!   └── still idle                     → Confirmed
//! describe  → already down             → Executed (no stop call)
//! stop      (per-call timeout, backoff between attempts, re-confirm before each retry)
//!   ├── ok / not found / already stopped → Executed
//!   ├── transient                        → retry until max_attempts
//!   └── attempts exhausted               → Failed (surfaced, never dropped)
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use idlewatch_sampler::ActivitySample;
use idlewatch_state::{DecisionStatus, ShutdownDecision, StateResult, StateStore};

use crate::clock::Clock;
use crate::config::StopPolicy;
use crate::decision::DecisionConfig;
use crate::error::EngineResult;
use crate::gate;
use crate::instance::{InstanceControl, StopError};
use crate::tracker;

/// Outcome of one [`ShutdownCoordinator::execute`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// The instance is stopped. `attempts` is 0 when it already was.
    Executed { attempts: u32, already_down: bool },
    /// The final check found the instance in use or under override.
    Cancelled { reason: String },
    /// Transient errors outlasted the retry budget.
    Failed { attempts: u32, error: String },
    /// Nothing to do: already resolved or being executed elsewhere.
    Skipped { reason: String },
}

/// Verdict of the pre-stop check.
enum Gate {
    Proceed(ShutdownDecision),
    Cancelled(String),
    Skip(String),
}

/// Removes a decision key from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}

/// Executes shutdown decisions against the instance control API.
pub struct ShutdownCoordinator {
    store: StateStore,
    control: Arc<dyn InstanceControl>,
    clock: Arc<dyn Clock>,
    /// Decision keys currently being executed in this process.
    in_flight: Mutex<HashSet<String>>,
}

impl ShutdownCoordinator {
    pub fn new(store: StateStore, control: Arc<dyn InstanceControl>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            control,
            clock,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn control(&self) -> &Arc<dyn InstanceControl> {
        &self.control
    }

    fn claim(&self, key: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(key.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            key: key.to_string(),
        })
    }

    /// Execute `decision`.
    ///
    /// `fresh` is a sample taken just before the call; it is merged in the
    /// same transaction as the final check so a user who came back after the
    /// decision was proposed is seen. Store failures are returned as errors;
    /// stop API failures are folded into the [`ExecutionResult`].
    pub async fn execute(
        &self,
        decision: &ShutdownDecision,
        fresh: Option<&ActivitySample>,
        config: &DecisionConfig,
        policy: &StopPolicy,
    ) -> EngineResult<ExecutionResult> {
        let key = decision.table_key();
        let Some(_guard) = self.claim(&key) else {
            debug!(decision = %key, "decision already executing");
            return Ok(ExecutionResult::Skipped {
                reason: "already executing".to_string(),
            });
        };

        let instance = decision.instance_id.as_str();
        let mut current = match self.confirm(decision, fresh, config)? {
            Gate::Proceed(d) => d,
            Gate::Cancelled(reason) => return Ok(ExecutionResult::Cancelled { reason }),
            Gate::Skip(reason) => return Ok(ExecutionResult::Skipped { reason }),
        };

        match tokio::time::timeout(policy.call_timeout, self.control.describe(instance)).await {
            Ok(Ok(state)) if state.is_down() => {
                info!(instance, decision = %current.decision_id, ?state, "instance already down");
                self.finalize(&current, DecisionStatus::Executed, current.attempts, None)?;
                return Ok(ExecutionResult::Executed {
                    attempts: 0,
                    already_down: true,
                });
            }
            Ok(Ok(state)) => debug!(instance, ?state, "instance state before stop"),
            Ok(Err(e)) => debug!(instance, error = %e, "describe failed, stopping anyway"),
            Err(_) => debug!(instance, "describe timed out, stopping anyway"),
        }

        let mut last_error = String::new();
        for attempt in 1..=policy.max_attempts {
            if attempt > 1 {
                let delay = policy.backoff(attempt - 1);
                debug!(instance, attempt, ?delay, "backing off before retry");
                tokio::time::sleep(delay).await;

                current = match self.confirm(&current, None, config)? {
                    Gate::Proceed(d) => d,
                    Gate::Cancelled(reason) => return Ok(ExecutionResult::Cancelled { reason }),
                    Gate::Skip(reason) => return Ok(ExecutionResult::Skipped { reason }),
                };
            }

            let result = match tokio::time::timeout(policy.call_timeout, self.control.stop(instance))
                .await
            {
                Ok(r) => r,
                Err(_) => Err(StopError::Timeout(policy.call_timeout)),
            };

            match result {
                Ok(()) => {
                    info!(instance, decision = %current.decision_id, attempt, "instance stopped");
                    self.finalize(&current, DecisionStatus::Executed, attempt, None)?;
                    return Ok(ExecutionResult::Executed {
                        attempts: attempt,
                        already_down: false,
                    });
                }
                Err(e) if e.is_permanent() => {
                    info!(instance, decision = %current.decision_id, error = %e, "instance already down");
                    self.finalize(&current, DecisionStatus::Executed, attempt, Some(e.to_string()))?;
                    return Ok(ExecutionResult::Executed {
                        attempts: attempt,
                        already_down: true,
                    });
                }
                Err(e) => {
                    warn!(
                        instance,
                        decision = %current.decision_id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "stop attempt failed"
                    );
                    last_error = e.to_string();
                    current = self.record_attempt(&current, attempt, &last_error)?;
                }
            }
        }

        error!(
            instance,
            decision = %current.decision_id,
            attempts = policy.max_attempts,
            error = %last_error,
            "stop failed after retries"
        );
        self.finalize(
            &current,
            DecisionStatus::Failed,
            policy.max_attempts,
            Some(last_error.clone()),
        )?;
        Ok(ExecutionResult::Failed {
            attempts: policy.max_attempts,
            error: last_error,
        })
    }

    /// Atomic pre-stop check. Marks the decision Confirmed or Cancelled.
    fn confirm(
        &self,
        decision: &ShutdownDecision,
        fresh: Option<&ActivitySample>,
        config: &DecisionConfig,
    ) -> StateResult<Gate> {
        let now = self.clock.now();
        self.store.with_instance(&decision.instance_id, |txn| {
            if let Some(sample) = fresh {
                tracker::merge_in(txn, sample)?;
            }

            let Some(mut stored) = txn.decision(&decision.decision_id)? else {
                return Ok(Gate::Skip("decision no longer exists".to_string()));
            };
            if !stored.is_unresolved() {
                return Ok(Gate::Skip(format!("decision already {}", stored.status)));
            }
            if txn.settings()?.is_some_and(|s| !s.enabled) {
                return Ok(Gate::Skip("controller disabled".to_string()));
            }

            let cancel_reason = match txn.idle_record()? {
                None => Some("idle record missing".to_string()),
                Some(record) if gate::is_suppressed(&record, now) => {
                    Some("override active".to_string())
                }
                Some(record) if record.idle_secs(now) < config.threshold_secs() => Some(format!(
                    "activity resumed (idle {}s < {}s)",
                    record.idle_secs(now),
                    config.threshold_secs()
                )),
                Some(_) => None,
            };

            if let Some(reason) = cancel_reason {
                stored.reason = format!("{}; cancelled: {reason}", stored.reason);
                stored.resolve(DecisionStatus::Cancelled, now);
                txn.put_decision(&stored)?;
                info!(
                    instance = %stored.instance_id,
                    decision = %stored.decision_id,
                    %reason,
                    "shutdown cancelled before stop"
                );
                return Ok(Gate::Cancelled(reason));
            }

            if stored.status != DecisionStatus::Confirmed {
                stored.status = DecisionStatus::Confirmed;
                txn.put_decision(&stored)?;
            }
            Ok(Gate::Proceed(stored))
        })
    }

    fn record_attempt(
        &self,
        decision: &ShutdownDecision,
        attempt: u32,
        error: &str,
    ) -> StateResult<ShutdownDecision> {
        self.store.with_instance(&decision.instance_id, |txn| {
            let mut stored = txn
                .decision(&decision.decision_id)?
                .unwrap_or_else(|| decision.clone());
            stored.attempts = attempt;
            stored.last_error = Some(error.to_string());
            txn.put_decision(&stored)?;
            Ok(stored)
        })
    }

    fn finalize(
        &self,
        decision: &ShutdownDecision,
        status: DecisionStatus,
        attempts: u32,
        last_error: Option<String>,
    ) -> StateResult<()> {
        let now = self.clock.now();
        self.store.with_instance(&decision.instance_id, |txn| {
            let mut stored = txn
                .decision(&decision.decision_id)?
                .unwrap_or_else(|| decision.clone());
            if !stored.is_unresolved() && stored.status != status {
                // A concurrent pass resolved it while the call was in flight;
                // the outcome of the call is what actually happened.
                warn!(
                    instance = %stored.instance_id,
                    decision = %stored.decision_id,
                    was = %stored.status,
                    now = %status,
                    "overriding concurrently resolved decision"
                );
            }
            stored.attempts = attempts;
            if last_error.is_some() {
                stored.last_error = last_error;
            }
            stored.resolve(status, now);
            txn.put_decision(&stored)
        })
    }
}
