//! Signal source error types.

use thiserror::Error;

/// Errors a signal source can report instead of a timestamp.
///
/// Any of these makes the source count as absent for the current tick; the
/// sampler never turns a failure into an idle or active verdict.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Parse(String),
}
