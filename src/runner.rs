//! Runner interface and the subprocess hook adapter.
//!
//! A runner performs exactly one attempt of a workflow against the portal
//! and classifies its own failures. It never retries internally; the retry
//! controller owns that.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::model::{ExchangeId, WorkflowRequest};
use crate::retry::ClassifiedError;
use crate::workflow::WorkflowRegistry;

/// Exit status a hook uses to ask for another attempt (`EX_TEMPFAIL`).
pub const EXIT_TEMPFAIL: i32 = 75;

/// Which attempt of which execution is running.
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    pub exchange_id: ExchangeId,
    /// 1-based.
    pub number: u32,
}

/// Performs one attempt of a workflow.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        request: &WorkflowRequest,
        attempt: Attempt,
    ) -> Result<serde_json::Value, ClassifiedError>;
}

/// Runs each attempt as an external executable in a scratch directory.
///
/// The hook reads `request.json`, writes `result.json` on success and exits
/// 0. Exiting with [`EXIT_TEMPFAIL`] marks the failure retriable; any other
/// non-zero exit is terminal. Timeouts and spawn failures are retriable.
pub struct HookRunner {
    registry: Arc<WorkflowRegistry>,
    work_dir: PathBuf,
}

impl HookRunner {
    pub fn new(registry: Arc<WorkflowRegistry>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            work_dir: work_dir.into(),
        }
    }

    async fn prepare(&self, request: &WorkflowRequest, attempt: Attempt) -> std::io::Result<PathBuf> {
        let dir = self
            .work_dir
            .join(format!("{}-{}", attempt.exchange_id, attempt.number));
        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::to_vec_pretty(request)?;
        tokio::fs::write(dir.join("request.json"), body).await?;
        Ok(dir)
    }

    async fn execute(
        &self,
        command: &Path,
        dir: &Path,
        request: &WorkflowRequest,
        attempt: Attempt,
        timeout: std::time::Duration,
    ) -> Result<serde_json::Value, ClassifiedError> {
        // Relative commands resolve against the process CWD, not the
        // scratch dir the child runs in.
        let abs_command = if command.is_relative() {
            std::env::current_dir()
                .map_err(|e| ClassifiedError::retriable(format!("cannot resolve cwd: {e}")))?
                .join(command)
        } else {
            command.to_path_buf()
        };

        debug!(
            exchange_id = %attempt.exchange_id,
            attempt = attempt.number,
            command = %abs_command.display(),
            "running hook"
        );

        let mut hook = Command::new(&abs_command);
        hook
            .current_dir(dir)
            .env("PORTALFLOW_WORK_DIR", dir)
            .env("PORTALFLOW_EXCHANGE_ID", attempt.exchange_id.to_string())
            .env("PORTALFLOW_KIND", request.kind().as_str())
            .env("PORTALFLOW_ATTEMPT", attempt.number.to_string())
            .env("PORTALFLOW_TAXPAYER_ID", &request.credentials.taxpayer_id);
        // Re-admitted and swept records come back from the store without it.
        if let Some(secret) = &request.credentials.secret_ref {
            hook.env("PORTALFLOW_SECRET_REF", secret.expose());
        }
        let child = hook
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Err(_) => {
                return Err(ClassifiedError::retriable(format!(
                    "hook timed out after {}s",
                    timeout.as_secs()
                )));
            }
            Ok(Err(e)) => {
                return Err(ClassifiedError::retriable(format!("cannot spawn hook: {e}")));
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            let message = format!("hook exited with status {code}: {reason}");
            return Err(if code == EXIT_TEMPFAIL {
                ClassifiedError::retriable(message)
            } else {
                ClassifiedError::terminal(message)
            });
        }

        let raw = tokio::fs::read_to_string(dir.join("result.json"))
            .await
            .map_err(|e| ClassifiedError::terminal(format!("missing result.json: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| ClassifiedError::terminal(format!("bad result.json: {e}")))
    }
}

#[async_trait]
impl Runner for HookRunner {
    async fn run(
        &self,
        request: &WorkflowRequest,
        attempt: Attempt,
    ) -> Result<serde_json::Value, ClassifiedError> {
        let kind = request.kind();
        let Some(spec) = self.registry.get(kind) else {
            return Err(ClassifiedError::terminal(format!(
                "no workflow configured for kind {kind}"
            )));
        };

        let start = Instant::now();
        let dir = self
            .prepare(request, attempt)
            .await
            .map_err(|e| ClassifiedError::retriable(format!("cannot prepare work dir: {e}")))?;

        let result = self
            .execute(&spec.command, &dir, request, attempt, spec.timeout())
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(exchange_id = %attempt.exchange_id, attempt = attempt.number, duration_ms, "hook succeeded"),
            Err(e) => warn!(exchange_id = %attempt.exchange_id, attempt = attempt.number, duration_ms, error = %e, "hook failed"),
        }

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(dir = %dir.display(), "cleanup error: {e}");
        }
        result
    }
}
