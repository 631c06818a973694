//! Domain types for the idlewatch state store.
//!
//! These types represent the persisted idle-tracking state of monitored
//! instances, the shutdown decisions taken for them, the runtime settings,
//! and the last error seen per instance. All types are serializable to/from
//! JSON for storage in redb tables. Timestamps are Unix epoch seconds.

use serde::{Deserialize, Serialize};

/// Identifier of a monitored compute instance.
pub type InstanceId = String;

/// Identifier of a shutdown decision, unique per instance.
pub type DecisionId = String;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

// ── Idle record ────────────────────────────────────────────────────

/// Durable idle-tracking state for one instance.
///
/// `idle_since` always equals `last_active_at`; both are kept so stored
/// records read naturally. The idle duration is never stored, it is
/// derived from `now` on every read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdleRecord {
    pub instance_id: InstanceId,
    /// Most recent activity observed for this instance.
    pub last_active_at: Timestamp,
    /// Start of the current idle period.
    pub idle_since: Timestamp,
    /// Idle shutdown is suppressed while `now < override_until`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_until: Option<Timestamp>,
}

impl IdleRecord {
    /// A fresh record whose idle period starts at `active_at`.
    pub fn new(instance_id: &str, active_at: Timestamp) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            last_active_at: active_at,
            idle_since: active_at,
            override_until: None,
        }
    }

    /// Seconds idle at `now`. Never negative.
    pub fn idle_secs(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.idle_since)
    }

    /// Whole minutes idle at `now`.
    pub fn idle_minutes(&self, now: Timestamp) -> u64 {
        self.idle_secs(now) / 60
    }
}

// ── Shutdown decision ──────────────────────────────────────────────

/// Lifecycle status of a shutdown decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Proposed,
    Confirmed,
    Cancelled,
    Executed,
    Failed,
}

impl DecisionStatus {
    /// Proposed and Confirmed decisions are still pending execution.
    pub fn is_unresolved(self) -> bool {
        matches!(self, DecisionStatus::Proposed | DecisionStatus::Confirmed)
    }
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionStatus::Proposed => "proposed",
            DecisionStatus::Confirmed => "confirmed",
            DecisionStatus::Cancelled => "cancelled",
            DecisionStatus::Executed => "executed",
            DecisionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A proposal to stop one instance because it has been idle too long.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShutdownDecision {
    pub instance_id: InstanceId,
    /// `{idle_since}-{sequence}`; stable for a given idle period.
    pub decision_id: DecisionId,
    pub decided_at: Timestamp,
    /// Idle period this decision was taken for.
    pub idle_since: Timestamp,
    pub reason: String,
    pub status: DecisionStatus,
    /// Stop calls issued so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
}

impl ShutdownDecision {
    /// Build a new proposed decision for the idle period starting at `idle_since`.
    pub fn propose(
        instance_id: &str,
        idle_since: Timestamp,
        sequence: u32,
        decided_at: Timestamp,
        reason: String,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            decision_id: format!("{idle_since}-{sequence}"),
            decided_at,
            idle_since,
            reason,
            status: DecisionStatus::Proposed,
            attempts: 0,
            last_error: None,
            resolved_at: None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.status.is_unresolved()
    }

    /// Move to a terminal status.
    pub fn resolve(&mut self, status: DecisionStatus, at: Timestamp) {
        debug_assert!(!status.is_unresolved());
        self.status = status;
        self.resolved_at = Some(at);
    }

    /// Build the composite key for the decisions tables.
    pub fn table_key(&self) -> String {
        decision_key(&self.instance_id, &self.decision_id)
    }
}

/// Composite key `{instance_id}:{decision_id}`.
pub fn decision_key(instance_id: &str, decision_id: &str) -> String {
    format!("{instance_id}:{decision_id}")
}

// ── Settings ──────────────────────────────────────────────────────

/// Runtime settings read fresh at the start of every pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Idle minutes after which an instance is stopped. Must be positive.
    pub threshold_minutes: u64,
    /// Expected period between passes.
    pub poll_period_minutes: u64,
    /// When false, passes keep tracking idleness but propose nothing.
    pub enabled: bool,
    /// Unix timestamp of the last change.
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threshold_minutes: 60,
            poll_period_minutes: 5,
            enabled: true,
            updated_at: 0,
        }
    }
}

// ── Instance errors ───────────────────────────────────────────────

/// Category of an error recorded against an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    SignalUnavailable,
    Persistence,
    StopApi,
    Policy,
}

/// The most recent error observed while processing an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceError {
    pub instance_id: InstanceId,
    pub kind: ErrorKind,
    pub message: String,
    pub at: Timestamp,
}
