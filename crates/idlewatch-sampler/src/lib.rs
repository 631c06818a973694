//! idlewatch-sampler — activity sampling for monitored instances.
//!
//! Normalizes heterogeneous "is a user active" evidence behind one
//! capability, [`ActivitySource`], which reports the most recent activity
//! timestamp or nothing. A [`Sampler`] asks every source of an instance once
//! per tick and combines the answers with a single rule:
//!
//! ```text
//! most_recent = max(reported timestamps), each clamped to now
//! ```
//!
//! Sources that report nothing contribute nothing. Sources that fail are
//! recorded as unavailable and likewise contribute nothing. When no source
//! reports a timestamp, the sample carries no activity signal.
//!
//! # Sources
//!
//! | Type | Evidence |
//! |---|---|
//! | `files` | newest file mtime under watched paths |
//! | `kernels` | notebook kernel execution state / `last_activity` |
//! | `requests` | newest timestamp in a request log |

pub mod config;
pub mod error;
pub mod files;
pub mod kernels;
pub mod requests;
pub mod sample;

pub use config::{build_sampler, SourceConfig};
pub use error::SignalError;
pub use sample::{
    parse_timestamp, ActivitySample, ActivitySource, Sampler, Signal, SignalFuture, Timestamp,
    UnavailableSource,
};
