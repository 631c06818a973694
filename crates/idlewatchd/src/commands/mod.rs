pub mod control;
pub mod pass;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;

use idlewatch_engine::{
    CommandControl, ControlFuture, ControlSurface, FileConfigSource, InstanceControl,
    InstanceState, StopError, SystemClock, WatchFile, Watcher,
};
use idlewatch_state::StateStore;

const DB_FILE: &str = "idlewatch.redb";

/// Global options shared by every subcommand.
pub struct Context {
    pub config: PathBuf,
    pub data_dir: PathBuf,
    pub json: bool,
}

impl Context {
    fn open_store(&self) -> anyhow::Result<StateStore> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating data dir {}", self.data_dir.display()))?;
        let path = self.data_dir.join(DB_FILE);
        let store = StateStore::open(&path)
            .with_context(|| format!("opening state store {}", path.display()))?;
        tracing::debug!(path = ?path, "state store opened");
        Ok(store)
    }

    fn load_config(&self) -> anyhow::Result<WatchFile> {
        WatchFile::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))
    }

    /// Build a watcher. With `require_control`, a missing `[control]`
    /// section is an error instead of a control that refuses every call.
    fn watcher(&self, require_control: bool) -> anyhow::Result<Watcher> {
        let file = self.load_config()?;
        let control: Arc<dyn InstanceControl> = match &file.control {
            Some(cfg) => Arc::new(CommandControl::new(cfg)),
            None if require_control => anyhow::bail!(
                "{} has no [control] section; cannot stop instances",
                self.config.display()
            ),
            None => Arc::new(Unconfigured),
        };
        Ok(Watcher::new(
            self.open_store()?,
            Arc::new(FileConfigSource::new(self.config.clone())),
            control,
            Arc::new(SystemClock),
        ))
    }

    fn surface(&self) -> anyhow::Result<ControlSurface> {
        Ok(ControlSurface::new(self.watcher(false)?))
    }

    /// Print `value` as JSON, or run `text` for the human form.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text(value);
        }
        Ok(())
    }
}

/// Stand-in control for commands that never stop anything.
struct Unconfigured;

impl InstanceControl for Unconfigured {
    fn stop<'a>(&'a self, _instance_id: &'a str) -> ControlFuture<'a, ()> {
        Box::pin(async { Err(StopError::Other("no [control] configured".to_string())) })
    }

    fn describe<'a>(&'a self, _instance_id: &'a str) -> ControlFuture<'a, InstanceState> {
        Box::pin(async { Err(StopError::Other("no [control] configured".to_string())) })
    }
}

/// "1h 05m" style rendering of a number of seconds.
pub fn human_secs(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_secs_picks_largest_units() {
        assert_eq!(human_secs(42), "42s");
        assert_eq!(human_secs(125), "2m 05s");
        assert_eq!(human_secs(3_900), "1h 05m");
    }

    #[test]
    fn pass_requires_control_section() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("idlewatch.toml");
        std::fs::write(&config, "[watch]\nthreshold_minutes = 30\n").unwrap();
        let ctx = Context {
            config,
            data_dir: dir.path().join("data"),
            json: false,
        };

        assert!(ctx.watcher(true).is_err());
        assert!(ctx.watcher(false).is_ok());
        assert!(dir.path().join("data").join(DB_FILE).exists());
    }

    #[test]
    fn missing_config_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            config: dir.path().join("absent.toml"),
            data_dir: dir.path().join("data"),
            json: false,
        };
        let err = ctx.surface().err().unwrap();
        assert!(format!("{err:#}").contains("absent.toml"));
    }
}
