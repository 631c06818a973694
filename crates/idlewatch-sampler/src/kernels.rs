//! Kernel activity from a Jupyter-style server.
//!
//! Queries `GET {path}` (default `/api/kernels`) on the notebook server and
//! reads each kernel's `execution_state` and `last_activity`. A kernel that
//! is currently executing counts as activity right now; otherwise the newest
//! `last_activity` wins. An empty kernel list is absent, not idle.

use std::time::Duration;

use http_body_util::BodyExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::SignalError;
use crate::sample::{parse_timestamp, ActivitySource, SignalFuture, Timestamp};

/// Execution states that mean the kernel is doing work for a user.
const BUSY_STATES: &[&str] = &["busy", "starting"];

#[derive(Debug, Deserialize)]
struct KernelInfo {
    #[serde(default)]
    execution_state: Option<String>,
    #[serde(default)]
    last_activity: Option<String>,
}

/// Polls the kernel listing of a notebook server.
#[derive(Debug, Clone)]
pub struct KernelActivitySource {
    /// `host:port` of the notebook server.
    address: String,
    path: String,
    token: Option<String>,
    timeout: Duration,
}

impl KernelActivitySource {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            path: "/api/kernels".to_string(),
            token: None,
            timeout: Duration::from_secs(2),
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch(&self) -> Result<bytes::Bytes, SignalError> {
        let uri = format!("http://{}{}", self.address, self.path);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| SignalError::Unavailable(format!("connect {uri}: {e}")))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| SignalError::Unavailable(format!("handshake {uri}: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", &self.address)
            .header("user-agent", "idlewatch-sampler/0.1")
            .header("accept", "application/json");
        if let Some(token) = &self.token {
            builder = builder.header("authorization", format!("token {token}"));
        }
        let req = builder
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| SignalError::Unavailable(format!("build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| SignalError::Unavailable(format!("request {uri}: {e}")))?;

        if !resp.status().is_success() {
            return Err(SignalError::Unavailable(format!(
                "{uri} returned {}",
                resp.status()
            )));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| SignalError::Unavailable(format!("read body {uri}: {e}")))?;
        Ok(body.to_bytes())
    }
}

impl ActivitySource for KernelActivitySource {
    fn name(&self) -> &str {
        "kernels"
    }

    fn latest_activity(&self, now: Timestamp) -> SignalFuture<'_> {
        Box::pin(async move {
            let body = tokio::time::timeout(self.timeout, self.fetch())
                .await
                .map_err(|_| SignalError::Timeout(self.timeout))??;
            let kernels: Vec<KernelInfo> =
                serde_json::from_slice(&body).map_err(|e| SignalError::Parse(e.to_string()))?;
            debug!(address = %self.address, kernels = kernels.len(), "kernel listing fetched");
            Ok(latest_from_kernels(&kernels, now))
        })
    }
}

fn latest_from_kernels(kernels: &[KernelInfo], now: Timestamp) -> Option<Timestamp> {
    let busy = kernels.iter().any(|k| {
        k.execution_state
            .as_deref()
            .is_some_and(|s| BUSY_STATES.contains(&s))
    });
    if busy {
        return Some(now);
    }
    kernels
        .iter()
        .filter_map(|k| k.last_activity.as_deref())
        .filter_map(parse_timestamp)
        .max()
}
