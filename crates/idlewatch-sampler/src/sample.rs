//! Activity samples and the rule that combines signal sources.
//!
//! Every source answers one question: "when did you last see activity?"
//! with a timestamp or nothing. The sampler asks each configured source
//! once per tick, clamps future timestamps to the local clock, and keeps
//! the maximum.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::SignalError;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Boxed future returned by [`ActivitySource::latest_activity`].
pub type SignalFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Timestamp>, SignalError>> + Send + 'a>>;

/// One kind of activity evidence for an instance.
pub trait ActivitySource: Send + Sync {
    /// Short name used in logs and samples (e.g. `files`, `kernels`).
    fn name(&self) -> &str;

    /// Most recent activity this source knows about, or `None` if it has
    /// nothing to report (no kernels running, nothing recorded yet).
    fn latest_activity(&self, now: Timestamp) -> SignalFuture<'_>;
}

/// What one source reported during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub source: String,
    pub at: Option<Timestamp>,
}

/// A source that could not be read during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailableSource {
    pub source: String,
    pub reason: String,
}

/// Activity observed for one instance at one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitySample {
    pub instance_id: String,
    /// Local clock at sampling time.
    pub observed_at: Timestamp,
    pub signals: Vec<Signal>,
    pub unavailable: Vec<UnavailableSource>,
}

impl ActivitySample {
    /// A sample with no signals, as produced when every source is absent.
    pub fn empty(instance_id: &str, observed_at: Timestamp) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            observed_at,
            signals: Vec::new(),
            unavailable: Vec::new(),
        }
    }

    /// Add a reported signal, clamping it to `observed_at`.
    pub fn with_signal(mut self, source: &str, at: Option<Timestamp>) -> Self {
        self.push_signal(source, at);
        self
    }

    /// In-place form of [`ActivitySample::with_signal`].
    pub fn push_signal(&mut self, source: &str, at: Option<Timestamp>) {
        self.signals.push(Signal {
            source: source.to_string(),
            at: at.map(|t| t.min(self.observed_at)),
        });
    }

    /// Newest activity across all sources that reported one.
    pub fn most_recent(&self) -> Option<Timestamp> {
        self.signals
            .iter()
            .filter_map(|s| s.at)
            .max()
            .map(|t| t.min(self.observed_at))
    }

    /// Whether any source reported activity at all.
    pub fn has_signal(&self) -> bool {
        self.most_recent().is_some()
    }
}

/// Samples one instance across its configured sources.
#[derive(Clone)]
pub struct Sampler {
    sources: Vec<Arc<dyn ActivitySource>>,
}

impl Sampler {
    pub fn new(sources: Vec<Arc<dyn ActivitySource>>) -> Self {
        Self { sources }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Query every source once and combine the results.
    ///
    /// Failing sources are logged and listed in
    /// [`ActivitySample::unavailable`]; the rest still contribute.
    pub async fn sample(&self, instance_id: &str, now: Timestamp) -> ActivitySample {
        let mut sample = ActivitySample::empty(instance_id, now);

        for source in &self.sources {
            match source.latest_activity(now).await {
                Ok(at) => {
                    if let Some(t) = at
                        && t > now
                    {
                        debug!(
                            instance = %instance_id,
                            source = source.name(),
                            reported = t,
                            now,
                            "clamping future activity timestamp"
                        );
                    }
                    sample.push_signal(source.name(), at);
                }
                Err(e) => {
                    warn!(
                        instance = %instance_id,
                        source = source.name(),
                        error = %e,
                        "activity source unavailable"
                    );
                    sample.unavailable.push(UnavailableSource {
                        source: source.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!(
            instance = %instance_id,
            most_recent = ?sample.most_recent(),
            unavailable = sample.unavailable.len(),
            "instance sampled"
        );
        sample
    }
}

/// Parse a recorded timestamp: epoch seconds, epoch milliseconds, or RFC 3339.
pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        let value = s.parse::<u64>().ok()?;
        // Thirteen digits and up is milliseconds.
        return Some(if value >= 1_000_000_000_000 {
            value / 1000
        } else {
            value
        });
    }
    let parsed = chrono::DateTime::parse_from_rfc3339(s).ok()?;
    u64::try_from(parsed.timestamp()).ok()
}
