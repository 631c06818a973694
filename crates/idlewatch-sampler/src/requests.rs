//! Recorded request timestamps, one per line in a log file.

use std::path::PathBuf;

use crate::error::SignalError;
use crate::sample::{parse_timestamp, ActivitySource, SignalFuture, Timestamp};

/// Reads a request log and reports the newest parseable timestamp.
///
/// Each line holds one timestamp (epoch seconds, epoch milliseconds, or
/// RFC 3339); anything after the first whitespace is ignored so access-log
/// style lines work too. A missing file means nothing was recorded yet.
#[derive(Debug, Clone)]
pub struct RequestLogSource {
    path: PathBuf,
}

impl RequestLogSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ActivitySource for RequestLogSource {
    fn name(&self) -> &str {
        "requests"
    }

    fn latest_activity(&self, _now: Timestamp) -> SignalFuture<'_> {
        Box::pin(async move {
            let content = match tokio::fs::read_to_string(&self.path).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(SignalError::Io(e)),
            };
            Ok(newest_in(&content))
        })
    }
}

fn newest_in(content: &str) -> Option<Timestamp> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(parse_timestamp)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_line_wins_regardless_of_order() {
        let log = "1700000300 GET /api\n1700000100 GET /\n2023-11-14T22:20:00Z POST /x\n";
        assert_eq!(newest_in(log), Some(1_700_000_400));
    }

    #[test]
    fn garbage_lines_are_ignored() {
        assert_eq!(newest_in("oops\n\n1700000000\n"), Some(1_700_000_000));
        assert_eq!(newest_in("nothing here\n"), None);
    }

    #[tokio::test]
    async fn missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let source = RequestLogSource::new(dir.path().join("requests.log"));
        assert_eq!(source.latest_activity(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.log");
        std::fs::write(&path, "1700000000\n1700000060\n").unwrap();

        let source = RequestLogSource::new(path);
        assert_eq!(source.latest_activity(0).await.unwrap(), Some(1_700_000_060));
    }
}
