//! Manual control surface — the operator's knobs.
//!
//! Every operation goes through the state store, so a change made here is
//! picked up by the next pass without a restart.

use serde::Serialize;
use tracing::info;

use idlewatch_state::{IdleRecord, InstanceError, Settings, ShutdownDecision, Timestamp};

use crate::config::WatchFile;
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::gate;
use crate::pass::{PassReport, Watcher};
use crate::tracker::IdleTracker;

/// Everything known about one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    /// Whether the instance is in the current config file.
    pub configured: bool,
    pub threshold_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<IdleRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_remaining_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<ShutdownDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<InstanceError>,
}

pub struct ControlSurface {
    watcher: Watcher,
    tracker: IdleTracker,
}

impl ControlSurface {
    pub fn new(watcher: Watcher) -> Self {
        let tracker = IdleTracker::new(watcher.store().clone());
        Self { watcher, tracker }
    }

    fn load(&self) -> EngineResult<WatchFile> {
        Ok(self.watcher.config_source().load()?)
    }

    fn now(&self) -> Timestamp {
        self.watcher.clock().now()
    }

    fn update(&self, f: impl FnOnce(&mut Settings)) -> EngineResult<Settings> {
        let defaults = self.load()?.watch.seed_settings();
        let now = self.now();
        let settings = self.watcher.store().update_settings(&defaults, |s| {
            f(s);
            s.updated_at = now;
        })?;
        Ok(settings)
    }

    pub fn settings(&self) -> EngineResult<Settings> {
        let defaults = self.load()?.watch.seed_settings();
        Ok(self.watcher.store().settings_or_seed(&defaults)?)
    }

    pub fn enable(&self) -> EngineResult<Settings> {
        let settings = self.update(|s| s.enabled = true)?;
        info!("idle shutdown enabled");
        Ok(settings)
    }

    /// Stop proposing shutdowns. Idleness keeps being tracked.
    pub fn disable(&self) -> EngineResult<Settings> {
        let settings = self.update(|s| s.enabled = false)?;
        info!("idle shutdown disabled");
        Ok(settings)
    }

    pub fn set_threshold(&self, minutes: u64) -> EngineResult<Settings> {
        if minutes == 0 {
            return Err(ConfigError::InvalidThreshold {
                scope: "settings".to_string(),
                minutes,
            }
            .into());
        }
        let settings = self.update(|s| s.threshold_minutes = minutes)?;
        info!(threshold_minutes = minutes, "threshold updated");
        Ok(settings)
    }

    /// Run a pass now, outside the regular schedule.
    pub async fn trigger_now(&self) -> EngineResult<PassReport> {
        info!("manual pass triggered");
        self.watcher.run_pass().await
    }

    pub fn status(&self, instance_id: &str) -> EngineResult<InstanceStatus> {
        let file = self.load()?;
        let settings = self.settings()?;
        let store = self.watcher.store();
        let record = store.get_idle_record(instance_id)?;
        let configured = file.instance(instance_id);

        if configured.is_none() && record.is_none() {
            return Err(EngineError::UnknownInstance(instance_id.to_string()));
        }

        let now = self.now();
        Ok(InstanceStatus {
            instance_id: instance_id.to_string(),
            configured: configured.is_some(),
            threshold_minutes: configured
                .map(|c| c.threshold_minutes.unwrap_or(settings.threshold_minutes)),
            idle_secs: record.as_ref().map(|r| r.idle_secs(now)),
            override_remaining_secs: record.as_ref().and_then(|r| gate::remaining_secs(r, now)),
            record,
            last_decision: store.latest_decision(instance_id)?,
            last_error: store.get_error(instance_id)?,
        })
    }

    /// Status of every configured or tracked instance, sorted by id.
    pub fn list_status(&self) -> EngineResult<Vec<InstanceStatus>> {
        let file = self.load()?;
        let mut ids: Vec<String> = file.instances.iter().map(|i| i.id.clone()).collect();
        for record in self.watcher.store().list_idle_records()? {
            if !ids.contains(&record.instance_id) {
                ids.push(record.instance_id);
            }
        }
        ids.sort();
        ids.iter().map(|id| self.status(id)).collect()
    }

    /// Suppress idle shutdown of `instance_id` for the next `minutes`.
    pub fn set_override(&self, instance_id: &str, minutes: u64) -> EngineResult<IdleRecord> {
        let now = self.now();
        let until = gate::window_end(now, minutes);
        let record = self.tracker.set_override(instance_id, until, now)?;
        info!(instance = %instance_id, until, "override set");
        Ok(record)
    }

    pub fn clear_override(&self, instance_id: &str) -> EngineResult<IdleRecord> {
        let record = self
            .tracker
            .clear_override(instance_id)?
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;
        info!(instance = %instance_id, "override cleared");
        Ok(record)
    }

    /// Drop all live state of a deprovisioned instance.
    pub fn forget(&self, instance_id: &str) -> EngineResult<bool> {
        let existed = self.watcher.store().delete_instance(instance_id)?;
        info!(instance = %instance_id, existed, "instance forgotten");
        Ok(existed)
    }
}
