//! Idle state tracker — folds activity samples into durable idle records.
//!
//! ```text
//! last_active' = max(last_active, sample.most_recent)
//! idle_since'  = last_active'   if it advanced
//!              = idle_since     otherwise
//! idle         = now - idle_since'
//! ```
//!
//! The tracker is the only writer of [`IdleRecord`]s. Records live in the
//! state store keyed by instance id, so restarting the controller resumes
//! the idle period where it was instead of starting a new one.

use tracing::debug;

use idlewatch_sampler::ActivitySample;
use idlewatch_state::{IdleRecord, InstanceTxn, StateError, StateResult, StateStore, Timestamp};

/// Result of merging one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merge {
    pub record: IdleRecord,
    /// True if this sample created the record.
    pub created: bool,
    /// True if new activity reset the idle period.
    pub advanced: bool,
}

/// Merge a sample into an existing record.
pub fn merge(record: &IdleRecord, sample: &ActivitySample, now: Timestamp) -> IdleRecord {
    let mut next = record.clone();
    if let Some(seen) = sample.most_recent().map(|t| t.min(now))
        && seen > record.last_active_at
    {
        next.last_active_at = seen;
        next.idle_since = seen;
    }
    next
}

/// Record for an instance seen for the first time.
///
/// Without any activity signal the idle period starts at the observation
/// itself.
pub fn initial(sample: &ActivitySample) -> IdleRecord {
    let at = sample.most_recent().unwrap_or(sample.observed_at);
    IdleRecord::new(&sample.instance_id, at)
}

/// Read, merge, and write the instance's record inside `txn`.
pub fn merge_in(txn: &InstanceTxn<'_>, sample: &ActivitySample) -> StateResult<Merge> {
    if sample.instance_id != txn.instance_id() {
        return Err(StateError::Write(format!(
            "sample for {} merged through transaction for {}",
            sample.instance_id,
            txn.instance_id()
        )));
    }

    let merged = match txn.idle_record()? {
        Some(current) => {
            let next = merge(&current, sample, sample.observed_at);
            let advanced = next.idle_since != current.idle_since;
            if next != current {
                txn.put_idle_record(&next)?;
            }
            Merge {
                record: next,
                created: false,
                advanced,
            }
        }
        None => {
            let record = initial(sample);
            txn.put_idle_record(&record)?;
            Merge {
                record,
                created: true,
                advanced: false,
            }
        }
    };

    if merged.created || merged.advanced {
        debug!(
            instance = %sample.instance_id,
            idle_since = merged.record.idle_since,
            created = merged.created,
            "idle period (re)started"
        );
    }
    Ok(merged)
}

/// Store-backed tracker operations that stand on their own.
#[derive(Clone)]
pub struct IdleTracker {
    store: StateStore,
}

impl IdleTracker {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Merge one sample in its own transaction.
    pub fn observe(&self, sample: &ActivitySample) -> StateResult<Merge> {
        self.store
            .with_instance(&sample.instance_id, |txn| merge_in(txn, sample))
    }

    /// Suppress idle shutdown for `instance_id` until `until`.
    ///
    /// An instance not seen before gets a record whose idle period starts now.
    pub fn set_override(
        &self,
        instance_id: &str,
        until: Timestamp,
        now: Timestamp,
    ) -> StateResult<IdleRecord> {
        self.store.with_instance(instance_id, |txn| {
            let mut record = txn
                .idle_record()?
                .unwrap_or_else(|| IdleRecord::new(instance_id, now));
            record.override_until = Some(until);
            txn.put_idle_record(&record)?;
            Ok(record)
        })
    }

    /// Remove any override. Returns the updated record if one exists.
    pub fn clear_override(&self, instance_id: &str) -> StateResult<Option<IdleRecord>> {
        self.store.with_instance(instance_id, |txn| {
            let Some(mut record) = txn.idle_record()? else {
                return Ok(None);
            };
            if record.override_until.take().is_some() {
                txn.put_idle_record(&record)?;
            }
            Ok(Some(record))
        })
    }
}
