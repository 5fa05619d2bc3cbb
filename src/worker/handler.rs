use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use uuid::Uuid;

/// Why an execution attempt failed, and whether it may consume another
/// attempt.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Executes the user payload of a claimed job.
///
/// The orchestrator treats the payload as opaque bytes; the handler is the
/// single place where its meaning lives, so embedders plug their own
/// implementation in here.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job_id: Uuid, payload: &[u8]) -> Result<(), HandlerError>;
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Interprets payloads of the form `{"command": "..."}` and runs them under
/// `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellHandler;

impl ShellHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for ShellHandler {
    async fn execute(&self, job_id: Uuid, payload: &[u8]) -> Result<(), HandlerError> {
        let parsed: CommandPayload = serde_json::from_slice(payload)
            .map_err(|_| HandlerError::fatal("payload is not a command object"))?;

        tracing::info!(job_id = %job_id, command = %parsed.command, "executing command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&parsed.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| HandlerError::retryable(format!("spawn failed: {error}")))?;

        if output.status.success() {
            tracing::info!(job_id = %job_id, "command completed");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.is_empty() {
            format!("exit code: {:?}", output.status.code())
        } else {
            stderr.trim_end().to_string()
        };

        tracing::info!(
            job_id = %job_id,
            exit_code = ?output.status.code(),
            "command failed"
        );

        Err(HandlerError::fatal(message))
    }
}
