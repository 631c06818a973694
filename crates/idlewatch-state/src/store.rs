//! StateStore — redb-backed state persistence for idlewatch.
//!
//! Provides typed operations over idle records, shutdown decisions, runtime
//! settings, and per-instance errors. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Multi-step updates for one instance go through [`StateStore::with_instance`],
//! which runs a closure inside a single write transaction. redb admits one
//! writer at a time, so overlapping passes serialize per key and a failed
//! step leaves nothing half-written.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(IDLE_RECORDS).map_err(map_err!(Table))?;
        txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        txn.open_table(DECISION_ARCHIVE).map_err(map_err!(Table))?;
        txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCE_ERRORS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Atomic per-instance updates ────────────────────────────────

    /// Run `f` inside one write transaction scoped to `instance_id`.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error aborts it
    /// and no write made through the [`InstanceTxn`] becomes visible.
    pub fn with_instance<T, E, F>(&self, instance_id: &str, f: F) -> Result<T, E>
    where
        E: From<StateError>,
        F: FnOnce(&InstanceTxn<'_>) -> Result<T, E>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let scoped = InstanceTxn {
            txn: &txn,
            instance_id,
        };
        match f(&scoped) {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(instance = %instance_id, error = %abort_err, "transaction abort failed");
                }
                Err(e)
            }
        }
    }

    // ── Idle records ───────────────────────────────────────────────

    /// Get the idle record for an instance.
    pub fn get_idle_record(&self, instance_id: &str) -> StateResult<Option<IdleRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IDLE_RECORDS).map_err(map_err!(Table))?;
        match table.get(instance_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: IdleRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all idle records.
    pub fn list_idle_records(&self) -> StateResult<Vec<IdleRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IDLE_RECORDS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: IdleRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Remove every live trace of a deprovisioned instance.
    ///
    /// Deletes the idle record, live decisions, and recorded error. Archived
    /// decisions are kept for audit. Returns true if an idle record existed.
    pub fn delete_instance(&self, instance_id: &str) -> StateResult<bool> {
        let prefix = format!("{instance_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut records = txn.open_table(IDLE_RECORDS).map_err(map_err!(Table))?;
            existed = records.remove(instance_id).map_err(map_err!(Write))?.is_some();
        }
        {
            let mut decisions = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in decisions.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    keys.push(key.value().to_string());
                }
            }
            for key in &keys {
                decisions.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        {
            let mut errors = txn.open_table(INSTANCE_ERRORS).map_err(map_err!(Table))?;
            errors.remove(instance_id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance = %instance_id, existed, "instance state deleted");
        Ok(existed)
    }

    // ── Decisions ──────────────────────────────────────────────────

    /// Get one live decision.
    pub fn get_decision(
        &self,
        instance_id: &str,
        decision_id: &str,
    ) -> StateResult<Option<ShutdownDecision>> {
        let key = decision_key(instance_id, decision_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let decision: ShutdownDecision =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(decision))
            }
            None => Ok(None),
        }
    }

    /// List live decisions for an instance, oldest first.
    pub fn list_decisions_for_instance(
        &self,
        instance_id: &str,
    ) -> StateResult<Vec<ShutdownDecision>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        scan_decisions(&table, instance_id)
    }

    /// List archived decisions for an instance, oldest first.
    pub fn list_archived_for_instance(
        &self,
        instance_id: &str,
    ) -> StateResult<Vec<ShutdownDecision>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DECISION_ARCHIVE).map_err(map_err!(Table))?;
        scan_decisions(&table, instance_id)
    }

    /// The most recent decision for an instance, live or archived.
    pub fn latest_decision(&self, instance_id: &str) -> StateResult<Option<ShutdownDecision>> {
        if let Some(latest) = self.list_decisions_for_instance(instance_id)?.pop() {
            return Ok(Some(latest));
        }
        Ok(self.list_archived_for_instance(instance_id)?.pop())
    }

    /// Move resolved decisions resolved at or before `cutoff` into the archive.
    ///
    /// Returns the number of decisions archived.
    pub fn archive_resolved(&self, cutoff: Timestamp) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut moved: Vec<(String, Vec<u8>)> = Vec::new();
        {
            let table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let decision: ShutdownDecision =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if let Some(resolved_at) = decision.resolved_at
                    && !decision.is_unresolved()
                    && resolved_at <= cutoff
                {
                    moved.push((key.value().to_string(), value.value().to_vec()));
                }
            }
        }
        {
            let mut live = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
            let mut archive = txn.open_table(DECISION_ARCHIVE).map_err(map_err!(Table))?;
            for (key, value) in &moved {
                archive
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                live.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        let count = moved.len() as u32;
        if count > 0 {
            debug!(count, cutoff, "resolved decisions archived");
        }
        Ok(count)
    }

    // ── Settings ───────────────────────────────────────────────────

    /// Get the runtime settings, if they have been written.
    pub fn get_settings(&self) -> StateResult<Option<Settings>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        match table.get(SETTINGS_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let settings: Settings =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace the runtime settings.
    pub fn put_settings(&self, settings: &Settings) -> StateResult<()> {
        let value = serde_json::to_vec(settings).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
            table
                .insert(SETTINGS_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(?settings, "settings stored");
        Ok(())
    }

    /// Read the settings, writing `defaults` first if none exist yet.
    pub fn settings_or_seed(&self, defaults: &Settings) -> StateResult<Settings> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let settings;
        {
            let mut table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
            let existing = match table.get(SETTINGS_KEY).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice::<Settings>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            settings = match existing {
                Some(s) => s,
                None => {
                    let value = serde_json::to_vec(defaults).map_err(map_err!(Serialize))?;
                    table
                        .insert(SETTINGS_KEY, value.as_slice())
                        .map_err(map_err!(Write))?;
                    debug!(?defaults, "settings seeded");
                    defaults.clone()
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(settings)
    }

    /// Atomically read-modify-write the settings.
    pub fn update_settings<F>(&self, defaults: &Settings, f: F) -> StateResult<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut settings = {
            let table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
            match table.get(SETTINGS_KEY).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice::<Settings>(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => defaults.clone(),
            }
        };
        f(&mut settings);
        let value = serde_json::to_vec(&settings).map_err(map_err!(Serialize))?;
        {
            let mut table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
            table
                .insert(SETTINGS_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(settings)
    }

    // ── Instance errors ────────────────────────────────────────────

    /// Record the latest error for an instance, replacing any previous one.
    pub fn record_error(&self, error: &InstanceError) -> StateResult<()> {
        let value = serde_json::to_vec(error).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCE_ERRORS).map_err(map_err!(Table))?;
            table
                .insert(error.instance_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the latest recorded error for an instance.
    pub fn get_error(&self, instance_id: &str) -> StateResult<Option<InstanceError>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCE_ERRORS).map_err(map_err!(Table))?;
        match table.get(instance_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let error: InstanceError =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(error))
            }
            None => Ok(None),
        }
    }
}

/// Write-transaction view restricted to one instance's keys.
///
/// Obtained through [`StateStore::with_instance`]. Every method opens the
/// table it needs for the duration of the call, so calls compose freely
/// inside one closure.
pub struct InstanceTxn<'a> {
    txn: &'a WriteTransaction,
    instance_id: &'a str,
}

impl InstanceTxn<'_> {
    pub fn instance_id(&self) -> &str {
        self.instance_id
    }

    /// Current idle record, as seen by this transaction.
    pub fn idle_record(&self) -> StateResult<Option<IdleRecord>> {
        let table = self.txn.open_table(IDLE_RECORDS).map_err(map_err!(Table))?;
        match table.get(self.instance_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: IdleRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace the idle record.
    pub fn put_idle_record(&self, record: &IdleRecord) -> StateResult<()> {
        if record.instance_id != self.instance_id {
            return Err(StateError::Write(format!(
                "record for {} written through transaction for {}",
                record.instance_id, self.instance_id
            )));
        }
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(IDLE_RECORDS).map_err(map_err!(Table))?;
        table
            .insert(self.instance_id, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Live decisions for this instance, oldest first.
    pub fn decisions(&self) -> StateResult<Vec<ShutdownDecision>> {
        let table = self.txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        scan_decisions(&table, self.instance_id)
    }

    /// One live decision by id.
    pub fn decision(&self, decision_id: &str) -> StateResult<Option<ShutdownDecision>> {
        let key = decision_key(self.instance_id, decision_id);
        let table = self.txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let decision: ShutdownDecision =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(decision))
            }
            None => Ok(None),
        }
    }

    /// The single Proposed or Confirmed decision, if any.
    pub fn unresolved_decision(&self) -> StateResult<Option<ShutdownDecision>> {
        Ok(self.decisions()?.into_iter().find(|d| d.is_unresolved()))
    }

    /// Live and archived decisions taken for the idle period `idle_since`.
    pub fn period_decisions(&self, idle_since: Timestamp) -> StateResult<Vec<ShutdownDecision>> {
        let mut all = {
            let table = self
                .txn
                .open_table(DECISION_ARCHIVE)
                .map_err(map_err!(Table))?;
            scan_decisions(&table, self.instance_id)?
        };
        all.extend(self.decisions()?);
        all.retain(|d| d.idle_since == idle_since);
        Ok(all)
    }

    /// Next sequence number for a decision on the idle period `idle_since`.
    pub fn next_sequence(&self, idle_since: Timestamp) -> StateResult<u32> {
        Ok(self.period_decisions(idle_since)?.len() as u32 + 1)
    }

    /// Insert or replace a decision.
    ///
    /// Refuses to create a second unresolved decision for the instance.
    pub fn put_decision(&self, decision: &ShutdownDecision) -> StateResult<()> {
        if decision.instance_id != self.instance_id {
            return Err(StateError::Write(format!(
                "decision for {} written through transaction for {}",
                decision.instance_id, self.instance_id
            )));
        }
        if decision.is_unresolved()
            && let Some(existing) = self.unresolved_decision()?
            && existing.decision_id != decision.decision_id
        {
            return Err(StateError::UnresolvedDecisionExists {
                instance: self.instance_id.to_string(),
                existing: existing.decision_id,
            });
        }
        let key = decision.table_key();
        let value = serde_json::to_vec(decision).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Runtime settings as seen by this transaction.
    pub fn settings(&self) -> StateResult<Option<Settings>> {
        let table = self.txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        match table.get(SETTINGS_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let settings: Settings =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }
}

/// Collect and sort the decisions under `{instance_id}:` in `table`.
fn scan_decisions<T>(table: &T, instance_id: &str) -> StateResult<Vec<ShutdownDecision>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let prefix = format!("{instance_id}:");
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(&prefix) {
            let decision: ShutdownDecision =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(decision);
        }
    }
    results.sort_by(|a, b| {
        a.decided_at
            .cmp(&b.decided_at)
            .then_with(|| a.decision_id.cmp(&b.decision_id))
    });
    Ok(results)
}
