//! Filesystem activity: newest modification time under watched paths.

use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::SignalError;
use crate::sample::{ActivitySource, SignalFuture, Timestamp};

/// Reports the newest file mtime under a set of roots.
#[derive(Debug, Clone)]
pub struct FileActivitySource {
    roots: Vec<PathBuf>,
    skip_hidden: bool,
    max_depth: Option<usize>,
}

impl FileActivitySource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            skip_hidden: true,
            max_depth: None,
        }
    }

    /// Include dot-files and dot-directories (checkpoints, caches).
    pub fn include_hidden(mut self, include: bool) -> Self {
        self.skip_hidden = !include;
        self
    }

    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    /// Missing roots are skipped. The source is unavailable only when
    /// none of its roots exist.
    fn scan(&self) -> Result<Option<Timestamp>, SignalError> {
        let mut newest: Option<Timestamp> = None;
        let mut missing = Vec::new();

        for root in &self.roots {
            if !root.exists() {
                warn!(path = %root.display(), "watched path does not exist");
                missing.push(root.display().to_string());
                continue;
            }

            let mut walker = WalkDir::new(root).follow_links(false);
            if let Some(depth) = self.max_depth {
                walker = walker.max_depth(depth);
            }

            let skip_hidden = self.skip_hidden;
            let entries = walker.into_iter().filter_entry(move |e| {
                e.depth() == 0
                    || !skip_hidden
                    || !e.file_name().to_string_lossy().starts_with('.')
            });

            for entry in entries {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        // Files vanishing mid-walk are routine.
                        debug!(error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs());
                if let Some(t) = modified {
                    newest = Some(newest.map_or(t, |n| n.max(t)));
                }
            }
        }

        if !missing.is_empty() && missing.len() == self.roots.len() {
            return Err(SignalError::Unavailable(format!(
                "watched paths do not exist: {}",
                missing.join(", ")
            )));
        }
        Ok(newest)
    }
}

impl ActivitySource for FileActivitySource {
    fn name(&self) -> &str {
        "files"
    }

    fn latest_activity(&self, _now: Timestamp) -> SignalFuture<'_> {
        let this = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || this.scan())
                .await
                .map_err(|e| SignalError::Unavailable(format!("file scan task failed: {e}")))?
        })
    }
}
