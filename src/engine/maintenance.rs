//! Operations run on demand or on a schedule by an external caller:
//! re-admitting failed executions, recovering stuck ones and dropping
//! records past their retention deadline.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::orchestrator::{Orchestrator, SubmitResult};
use crate::error::{Error, Result};
use crate::model::{ErrorDetail, ExecutionRecord, RecordPatch, Status};
use crate::retry::FailureClass;

/// Outcome of one `retry_failed` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Failed records without a re-admission yet.
    pub found: usize,
    /// Re-admitted and scheduled.
    pub retried: usize,
    /// Left alone: terminal error class, out of retries, or fingerprint busy.
    pub skipped: usize,
}

impl Orchestrator {
    /// Re-admit every failed execution that is still worth retrying.
    ///
    /// Each re-admission is a new record linked through `retry_of` and shares
    /// the original fingerprint; the failed record itself is never touched.
    /// Running this twice does not double-admit.
    pub async fn retry_failed(&self, max_retries: u32) -> Result<RetryReport> {
        let candidates = self.store().list_retry_candidates().await?;
        let mut report = RetryReport {
            found: candidates.len(),
            ..RetryReport::default()
        };

        for failed in candidates {
            let retriable = failed
                .error
                .as_ref()
                .is_some_and(|e| e.class == FailureClass::Retriable);
            if !retriable || failed.retry_count >= max_retries {
                report.skipped += 1;
                continue;
            }

            let readmission = ExecutionRecord::readmission_of(&failed);
            match self.admit(readmission).await? {
                SubmitResult::Admitted(admission) => {
                    info!(
                        exchange_id = %admission.exchange_id,
                        retry_of = %failed.exchange_id,
                        retry_count = failed.retry_count + 1,
                        "failed execution re-admitted"
                    );
                    report.retried += 1;
                }
                SubmitResult::Duplicate(admission) => {
                    info!(
                        failed = %failed.exchange_id,
                        holder = %admission.exchange_id,
                        "re-admission skipped, fingerprint busy"
                    );
                    report.skipped += 1;
                }
            }
        }

        info!(
            found = report.found,
            retried = report.retried,
            skipped = report.skipped,
            "retry pass finished"
        );
        Ok(report)
    }

    /// Force-fail live records that have not been updated for `older_than`,
    /// release their fingerprints and publish failure events. Returns how
    /// many records were swept.
    pub async fn sweep_stale(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Config(format!("stale timeout out of range: {e}")))?;
        let cutoff = Utc::now() - age;
        let stale = self.store().list_stale(cutoff).await?;

        let mut swept = 0;
        for record in stale {
            let detail = ErrorDetail {
                class: FailureClass::Retriable,
                message: format!(
                    "no progress since {} while {}",
                    record.updated_at.to_rfc3339(),
                    record.status
                ),
                attempts: 0,
            };
            let now = Utc::now();
            let patch = RecordPatch::default()
                .error(detail)
                .completed_at(now)
                .retain_until(self.retain_until(&record, now));

            match self
                .store()
                .transition(record.exchange_id, &Status::LIVE, Status::Failed, patch)
                .await
            {
                Ok(()) => {
                    warn!(
                        exchange_id = %record.exchange_id,
                        kind = %record.kind,
                        last_update = %record.updated_at,
                        "stale execution force-failed"
                    );
                    self.finish(&record).await;
                    swept += 1;
                }
                // Reached a terminal status between listing and now.
                Err(Error::StaleTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(swept)
    }

    /// Delete terminal records whose retention deadline has passed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = self.store().purge_terminal(Utc::now()).await?;
        if purged > 0 {
            info!(purged, "expired executions purged");
        }
        Ok(purged)
    }
}
