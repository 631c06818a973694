//! Declarative source configuration, as written in `idlewatch.toml`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::files::FileActivitySource;
use crate::kernels::KernelActivitySource;
use crate::requests::RequestLogSource;
use crate::sample::{ActivitySource, Sampler};

/// One activity source attached to an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Newest file modification under `paths`.
    Files {
        paths: Vec<PathBuf>,
        #[serde(default)]
        include_hidden: bool,
        #[serde(default)]
        max_depth: Option<usize>,
    },
    /// Kernel listing of a notebook server at `address` (`host:port`).
    Kernels {
        address: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Request log with one timestamp per line.
    Requests { path: PathBuf },
}

impl SourceConfig {
    /// Instantiate the configured source.
    pub fn build(&self) -> Arc<dyn ActivitySource> {
        match self {
            SourceConfig::Files {
                paths,
                include_hidden,
                max_depth,
            } => Arc::new(
                FileActivitySource::new(paths.clone())
                    .include_hidden(*include_hidden)
                    .with_max_depth(*max_depth),
            ),
            SourceConfig::Kernels {
                address,
                path,
                token,
                timeout_ms,
            } => {
                let mut source = KernelActivitySource::new(address).with_token(token.clone());
                if let Some(path) = path {
                    source = source.with_path(path);
                }
                if let Some(ms) = timeout_ms {
                    source = source.with_timeout(Duration::from_millis(*ms));
                }
                Arc::new(source)
            }
            SourceConfig::Requests { path } => Arc::new(RequestLogSource::new(path.clone())),
        }
    }
}

/// Build a sampler over every configured source.
pub fn build_sampler(sources: &[SourceConfig]) -> Sampler {
    Sampler::new(sources.iter().map(SourceConfig::build).collect())
}
