//! idlewatch-engine — idle detection and cost-control shutdown.
//!
//! Tracks how long each monitored instance has gone without user activity
//! and stops it once a configurable threshold is reached, without ever
//! stopping an instance that is in use.
//!
//! # Architecture
//!
//! ```text
//!            ┌────────────┐
//!  sources ─▶│  Sampler   │ ActivitySample
//!            └─────┬──────┘
//!                  ▼
//!            ┌────────────┐   IdleRecord    ┌────────────┐
//!            │  tracker   │───────────────▶ │ StateStore │ (redb)
//!            └─────┬──────┘                 └─────▲──────┘
//!                  ▼                              │
//!            ┌────────────┐  ShutdownDecision     │
//!            │  decision  │───────────────────────┤
//!            └─────┬──────┘                       │
//!                  ▼                              │
//!            ┌─────────────┐ confirm / resolve    │
//!            │ coordinator │──────────────────────┘
//!            └─────┬───────┘
//!                  ▼
//!          InstanceControl::stop
//! ```
//!
//! A [`Watcher`] runs one pass over every configured instance; the
//! [`ControlSurface`] exposes the operator knobs (enable, disable,
//! threshold, overrides, status).

pub mod clock;
pub mod command;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod decision;
pub mod error;
pub mod gate;
pub mod instance;
pub mod pass;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::CommandControl;
pub use config::{
    parse_duration, CommandConfig, ConfigSource, FileConfigSource, InstanceConfig, StopConfig,
    StopPolicy, WatchConfig, WatchFile,
};
pub use control::{ControlSurface, InstanceStatus};
pub use coordinator::{ExecutionResult, ShutdownCoordinator};
pub use decision::{decide, DecisionConfig, DecisionOutcome};
pub use error::{ConfigError, EngineError, EngineResult};
pub use instance::{ControlFuture, InstanceControl, InstanceState, StopError};
pub use pass::{InstanceReport, PassReport, SamplerFn, Watcher};
pub use tracker::IdleTracker;
