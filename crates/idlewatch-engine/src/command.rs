//! Instance control through external commands.
//!
//! Each call runs an argv template with `{instance}` replaced by the
//! instance id, e.g. `["aws", "sagemaker", "stop-notebook-instance",
//! "--notebook-instance-name", "{instance}"]`. A zero exit status is
//! success; otherwise stderr is classified into a [`StopError`] so the
//! coordinator can tell throttling from a missing instance.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::config::CommandConfig;
use crate::instance::{ControlFuture, InstanceControl, InstanceState, StopError};

const PLACEHOLDER: &str = "{instance}";

#[derive(Debug, Clone)]
pub struct CommandControl {
    stop: Vec<String>,
    describe: Vec<String>,
}

impl CommandControl {
    pub fn new(config: &CommandConfig) -> Self {
        Self {
            stop: config.stop_command.clone(),
            describe: config.describe_command.clone(),
        }
    }

    async fn run(&self, template: &[String], instance_id: &str) -> Result<String, StopError> {
        let argv = render(template, instance_id);
        let Some((program, args)) = argv.split_first() else {
            return Err(StopError::Other("empty command template".to_string()));
        };

        debug!(instance = instance_id, program = %program, "running control command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StopError::Unavailable(format!("failed to run {program}: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("{program} exited with {}", output.status.code().unwrap_or(-1))
        } else {
            stderr
        };
        Err(classify(&message))
    }
}

impl InstanceControl for CommandControl {
    fn stop<'a>(&'a self, instance_id: &'a str) -> ControlFuture<'a, ()> {
        Box::pin(async move { self.run(&self.stop, instance_id).await.map(|_| ()) })
    }

    fn describe<'a>(&'a self, instance_id: &'a str) -> ControlFuture<'a, InstanceState> {
        Box::pin(async move {
            match self.run(&self.describe, instance_id).await {
                Ok(stdout) => Ok(InstanceState::from_status(&stdout)),
                Err(StopError::NotFound(_)) => Ok(InstanceState::NotFound),
                Err(e) => Err(e),
            }
        })
    }
}

fn render(template: &[String], instance_id: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace(PLACEHOLDER, instance_id))
        .collect()
}

/// Map provider error text onto a [`StopError`].
pub fn classify(message: &str) -> StopError {
    let lower = message.to_ascii_lowercase();
    let msg = message.to_string();
    if lower.contains("throttl")
        || lower.contains("requestlimitexceeded")
        || lower.contains("rate exceeded")
    {
        StopError::Throttled(msg)
    } else if lower.contains("serviceunavailable")
        || lower.contains("service unavailable")
        || lower.contains("internalfailure")
        || lower.contains("internal error")
    {
        StopError::Unavailable(msg)
    } else if lower.contains("already stopped") || lower.contains("not in inservice") {
        StopError::AlreadyStopped(msg)
    } else if lower.contains("not found")
        || lower.contains("notfound")
        || lower.contains("recordnotfound")
        || lower.contains("does not exist")
    {
        StopError::NotFound(msg)
    } else {
        StopError::Other(msg)
    }
}
