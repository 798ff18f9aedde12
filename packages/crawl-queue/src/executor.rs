use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CrawlerError, Result};
use crate::traits::JobExecutor;
use crate::types::{ExecutionResult, JobParameters, QueueEntry};

/// Payload written to the command's stdin.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutorRequest<'a> {
    qid: i64,
    page_id: i64,
    configuration: &'a str,
    parameters: JobParameters,
}

/// Runs a shell command per job.
///
/// The entry goes to stdin as JSON and stdout is parsed as the JSON
/// content of the result. A non-zero exit, a timeout or unparsable output
/// all produce a failed result rather than an error.
#[derive(Debug, Clone)]
pub struct CommandJobExecutor {
    command: String,
    timeout: Duration,
}

impl CommandJobExecutor {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl JobExecutor for CommandJobExecutor {
    async fn execute(&self, entry: &QueueEntry) -> Result<ExecutionResult> {
        let request = ExecutorRequest {
            qid: entry.qid,
            page_id: entry.page_id,
            configuration: &entry.configuration,
            parameters: entry.job_parameters()?,
        };
        let payload = serde_json::to_vec(&request)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CrawlerError::Executor(format!("failed to spawn `{}`: {}", self.command, e)))?;

        // Writing stdin counts against the timeout
        let qid = entry.qid;
        let stdin = child.stdin.take();
        let run = async move {
            if let Some(mut stdin) = stdin {
                // Commands are free to ignore their input
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(qid, error = %e, "Executor did not read stdin");
                }
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(output) => output?,
            Err(_) => {
                return Ok(ExecutionResult::failure(format!(
                    "timed out after {:?}",
                    self.timeout
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(ExecutionResult {
                content: None,
                metadata: json!({
                    "error": format!("command exited with {}", output.status),
                    "exitCode": output.status.code(),
                    "stderr": stderr.trim(),
                }),
            });
        }

        match serde_json::from_slice(&output.stdout) {
            Ok(content) => Ok(ExecutionResult {
                content: Some(content),
                metadata: json!({ "exitCode": 0 }),
            }),
            Err(e) => Ok(ExecutionResult::failure(format!("invalid JSON output: {}", e))),
        }
    }
}
