//! redb table definitions for the idlewatch state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Decision keys follow `{instance_id}:{decision_id}` so per-instance prefix
//! scans stay cheap.

use redb::TableDefinition;

/// Idle records keyed by `{instance_id}`.
pub const IDLE_RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("idle_records");

/// Live shutdown decisions keyed by `{instance_id}:{decision_id}`.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decisions");

/// Resolved decisions moved out of the live table, same key layout.
pub const DECISION_ARCHIVE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("decision_archive");

/// Runtime settings, single row under [`SETTINGS_KEY`].
pub const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Most recent error per instance keyed by `{instance_id}`.
pub const INSTANCE_ERRORS: TableDefinition<&str, &[u8]> = TableDefinition::new("instance_errors");

pub const SETTINGS_KEY: &str = "global";
