//! Decision engine — maps an idle record to a shutdown decision outcome.
//!
//! # Rules
//!
//! Evaluated in order:
//!
//! ```text
//! 1. now < override_until                         → None (suppressed)
//! 2. idle >= threshold and no unresolved decision → Propose
//! 3. idle <  threshold and an unresolved decision → Cancel
//! 4. otherwise                                    → None
//! ```
//!
//! The threshold bound is closed: idle exactly equal to the threshold counts.
//! [`decide`] is pure; it depends only on its arguments, so delayed or
//! duplicated passes reach the same outcome as a single on-time one.

use serde::Serialize;

use idlewatch_state::{IdleRecord, ShutdownDecision, Timestamp};

use crate::gate;

/// Per-instance parameters for [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionConfig {
    pub threshold_minutes: u64,
}

impl DecisionConfig {
    pub fn threshold_secs(&self) -> u64 {
        self.threshold_minutes.saturating_mul(60)
    }
}

/// What the pass should do with an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    None,
    Propose,
    Cancel,
}

/// Decide whether to propose, cancel, or leave the instance alone.
pub fn decide(
    record: &IdleRecord,
    config: &DecisionConfig,
    existing: Option<&ShutdownDecision>,
    now: Timestamp,
) -> DecisionOutcome {
    if gate::is_suppressed(record, now) {
        return DecisionOutcome::None;
    }

    let unresolved = existing.is_some_and(ShutdownDecision::is_unresolved);
    let timed_out = record.idle_secs(now) >= config.threshold_secs();

    match (timed_out, unresolved) {
        (true, false) => DecisionOutcome::Propose,
        (false, true) => DecisionOutcome::Cancel,
        _ => DecisionOutcome::None,
    }
}

/// Human-readable reason stored on a proposed decision.
pub fn propose_reason(record: &IdleRecord, config: &DecisionConfig, now: Timestamp) -> String {
    format!(
        "idle for {} min (threshold {} min)",
        record.idle_minutes(now),
        config.threshold_minutes
    )
}
