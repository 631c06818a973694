//! idlewatch.toml configuration.
//!
//! The file is re-read at the start of every pass, so edits to the instance
//! list, sources, or stop policy apply without a restart. Runtime settings
//! (threshold, poll period, enabled) live in the state store; the file's
//! `[watch]` table only seeds them the first time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use idlewatch_sampler::SourceConfig;
use idlewatch_state::Settings;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchFile {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub stop: StopConfig,
    #[serde(default)]
    pub control: Option<CommandConfig>,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    pub threshold_minutes: u64,
    pub poll_period_minutes: u64,
    pub enabled: bool,
    /// Instances evaluated concurrently within one pass.
    pub worker_limit: usize,
    /// How long resolved decisions stay in the live table (e.g. "24h").
    pub decision_retention: String,
    /// Failed decisions tolerated per idle period before proposals stop.
    pub max_decision_failures: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            threshold_minutes: 60,
            poll_period_minutes: 5,
            enabled: true,
            worker_limit: 8,
            decision_retention: "24h".to_string(),
            max_decision_failures: 3,
        }
    }
}

impl WatchConfig {
    /// Settings used to seed the store on first use.
    pub fn seed_settings(&self) -> Settings {
        Settings {
            threshold_minutes: self.threshold_minutes,
            poll_period_minutes: self.poll_period_minutes,
            enabled: self.enabled,
            updated_at: 0,
        }
    }

    pub fn retention(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.decision_retention)
    }
}

/// Retry and timeout policy for stop calls, as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StopConfig {
    pub max_attempts: u32,
    pub base_backoff: String,
    pub max_backoff: String,
    pub call_timeout: String,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: "2s".to_string(),
            max_backoff: "60s".to_string(),
            call_timeout: "30s".to_string(),
        }
    }
}

impl StopConfig {
    /// A zero `call_timeout` is rejected; every call would time out.
    pub fn policy(&self) -> Result<StopPolicy, ConfigError> {
        let call_timeout = parse_duration(&self.call_timeout)?;
        if call_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration(self.call_timeout.clone()));
        }
        Ok(StopPolicy {
            max_attempts: self.max_attempts.max(1),
            base_backoff: parse_duration(&self.base_backoff)?,
            max_backoff: parse_duration(&self.max_backoff)?,
            call_timeout,
        })
    }
}

/// Parsed stop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl StopPolicy {
    /// Delay before retry number `attempt` (1-based): base doubled per
    /// failure, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Command templates for [`crate::command::CommandControl`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandConfig {
    /// argv with `{instance}` placeholders.
    pub stop_command: Vec<String>,
    pub describe_command: Vec<String>,
}

/// One monitored instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    pub id: String,
    /// Overrides the global threshold for this instance.
    #[serde(default)]
    pub threshold_minutes: Option<u64>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl InstanceConfig {
    /// Threshold that applies to this instance, validated.
    pub fn effective_threshold(&self, settings: &Settings) -> Result<u64, ConfigError> {
        let (minutes, scope) = match self.threshold_minutes {
            Some(m) => (m, format!("instance {}", self.id)),
            None => (settings.threshold_minutes, "settings".to_string()),
        };
        if minutes == 0 {
            return Err(ConfigError::InvalidThreshold { scope, minutes });
        }
        Ok(minutes)
    }

    /// Instance-level checks; a failure skips only this instance.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::InvalidInstance {
                id: self.id.clone(),
                reason: "no activity sources configured".to_string(),
            });
        }
        if let Some(0) = self.threshold_minutes {
            return Err(ConfigError::InvalidThreshold {
                scope: format!("instance {}", self.id),
                minutes: 0,
            });
        }
        Ok(())
    }
}

impl WatchFile {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: WatchFile = toml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    /// File-level checks; a failure aborts the whole pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for inst in &self.instances {
            if inst.id.is_empty() || inst.id.contains(':') {
                return Err(ConfigError::InvalidInstance {
                    id: inst.id.clone(),
                    reason: "ids must be non-empty and must not contain ':'".to_string(),
                });
            }
            if !seen.insert(inst.id.as_str()) {
                return Err(ConfigError::InvalidInstance {
                    id: inst.id.clone(),
                    reason: "duplicate instance id".to_string(),
                });
            }
        }
        self.stop.policy()?;
        self.watch.retention()?;
        Ok(())
    }

    pub fn instance(&self, id: &str) -> Option<&InstanceConfig> {
        self.instances.iter().find(|i| i.id == id)
    }
}

/// Where a pass gets its configuration from.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<WatchFile, ConfigError>;
}

/// Re-reads a TOML file on every load.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<WatchFile, ConfigError> {
        WatchFile::from_file(&self.path)
    }
}

/// A fixed in-memory configuration.
impl ConfigSource for WatchFile {
    fn load(&self) -> Result<WatchFile, ConfigError> {
        Ok(self.clone())
    }
}

/// Parse a duration string like "30s", "500ms", "5m", "24h".
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let trimmed = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());
    if let Some(ms) = trimmed.strip_suffix("ms") {
        ms.parse::<u64>().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(secs) = trimmed.strip_suffix('s') {
        secs.parse::<u64>().map(Duration::from_secs).map_err(|_| invalid())
    } else if let Some(mins) = trimmed.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    } else if let Some(hours) = trimmed.strip_suffix('h') {
        hours
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    } else {
        trimmed
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| invalid())
    }
}
