//! The orchestrator: admits requests and owns each admitted execution
//! end-to-end.
//!
//! `submit` only makes the admission decision and returns. Each admitted
//! record gets its own task that drives it `pending -> running -> terminal`,
//! releases the dedup entry and publishes the terminal event. Only that task
//! ever transitions its record, so a `StaleTransition` seen here means a
//! second writer exists and is logged as an internal consistency error.
//! Any other store error is treated as transient and retried under the
//! store policy before the task gives up on the record.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{Instrument as _, Span, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{EventPublisher, TerminalEvent};
use crate::fingerprint::fingerprint;
use crate::model::{
    Admission, AdmissionStatus, ErrorDetail, ExchangeId, ExecutionRecord, RecordPatch, Status,
    WorkflowRequest,
};
use crate::retry::{self, ByTag, ClassifiedError, FailureClass, RetryPolicy};
use crate::runner::{Attempt, Runner};
use crate::store::ExecutionStore;
use crate::telemetry::execution::{record_state_transition, start_execution_span};
use crate::telemetry::metrics;
use crate::workflow::WorkflowRegistry;

/// Operational knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum time a terminal record is kept. Records whose entries
    /// expire later are kept until the latest expiration date.
    pub retention: Duration,
    /// Policy wrapped around event publication.
    pub publish_policy: RetryPolicy,
    /// Policy wrapped around store calls made by execution tasks.
    pub store_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(5 * 60),
            publish_policy: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 200,
                multiplier: 2.0,
                max_delay_ms: 2_000,
            },
            store_policy: RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 100,
                multiplier: 2.0,
                max_delay_ms: 5_000,
            },
        }
    }
}

/// What happened when a request was submitted.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitResult {
    /// New execution reserved and scheduled.
    Admitted(Admission),
    /// A live execution already holds the fingerprint; nothing was started.
    Duplicate(Admission),
}

impl SubmitResult {
    pub fn admission(&self) -> &Admission {
        match self {
            SubmitResult::Admitted(a) | SubmitResult::Duplicate(a) => a,
        }
    }

    pub fn exchange_id(&self) -> ExchangeId {
        self.admission().exchange_id
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, SubmitResult::Duplicate(_))
    }
}

/// The orchestration engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn ExecutionStore>,
    runner: Arc<dyn Runner>,
    publisher: Arc<dyn EventPublisher>,
    registry: Arc<WorkflowRegistry>,
    pub(crate) config: EngineConfig,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// Decrements the in-flight count when an execution task ends, even by panic.
struct InFlight {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        runner: Arc<dyn Runner>,
        publisher: Arc<dyn EventPublisher>,
        registry: Arc<WorkflowRegistry>,
    ) -> Self {
        Self {
            store,
            runner,
            publisher,
            registry,
            config: EngineConfig::default(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn store(&self) -> &dyn ExecutionStore {
        self.store.as_ref()
    }

    /// Submit a request. Validates, fingerprints and reserves; never waits
    /// for the workflow itself.
    pub async fn submit(&self, request: WorkflowRequest) -> Result<SubmitResult> {
        let kind = request.kind();
        if let Err(e) = request.validate() {
            metrics::submissions().add(
                1,
                &[
                    KeyValue::new("kind", kind.as_str()),
                    KeyValue::new("result", "invalid"),
                ],
            );
            return Err(e);
        }

        let fp = fingerprint(&request);
        debug!(kind = %kind, fingerprint = %fp, "request fingerprinted");
        self.admit(ExecutionRecord::pending(request, fp)).await
    }

    /// Reserve `record` and, if it wins, schedule its execution.
    pub(crate) async fn admit(&self, record: ExecutionRecord) -> Result<SubmitResult> {
        let kind = record.kind;
        let fp = record.fingerprint.clone();
        let created_at = record.created_at;

        let mut stored = record.clone();
        stored.request = record.request.without_secret();

        let result = match self.store.reserve(&fp, stored).await {
            Ok(exchange_id) => {
                info!(%exchange_id, kind = %kind, fingerprint = %fp, "execution admitted");
                self.spawn_execution(record);
                Ok(SubmitResult::Admitted(Admission {
                    exchange_id,
                    status: AdmissionStatus::Pending,
                    created_at,
                }))
            }
            Err(Error::Duplicate(existing)) => {
                info!(exchange_id = %existing, kind = %kind, fingerprint = %fp, "duplicate submission");
                match self.store_call(|_| self.store.get(existing)).await {
                    Ok(Some(live)) => Ok(SubmitResult::Duplicate(Admission {
                        exchange_id: existing,
                        status: AdmissionStatus::Rejected,
                        created_at: live.created_at,
                    })),
                    Ok(None) => {
                        warn!(exchange_id = %existing, "dedup entry points at a missing record");
                        Err(Error::NotFound(existing.to_string()))
                    }
                    Err(e) => {
                        warn!(exchange_id = %existing, "cannot read duplicate holder: {e}");
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };

        let label = match &result {
            Ok(SubmitResult::Admitted(_)) => "admitted",
            Ok(SubmitResult::Duplicate(_)) => "duplicate",
            Err(_) => "error",
        };
        metrics::submissions().add(
            1,
            &[
                KeyValue::new("kind", kind.as_str()),
                KeyValue::new("result", label),
            ],
        );
        result
    }

    /// Point read of an execution record.
    pub async fn status(&self, exchange_id: ExchangeId) -> Result<Option<ExecutionRecord>> {
        self.store.get(exchange_id).await
    }

    /// Number of execution tasks currently running in this process.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once no execution task is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Poll until the record is terminal or `timeout` elapses.
    pub async fn wait_for(
        &self,
        exchange_id: ExchangeId,
        poll: Duration,
        timeout: Duration,
    ) -> Result<ExecutionRecord> {
        // An unrepresentable deadline means wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let record = self
                .store
                .get(exchange_id)
                .await?
                .ok_or_else(|| Error::NotFound(exchange_id.to_string()))?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(Error::Other(format!(
                    "execution {exchange_id} still {} after {}s",
                    record.status,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn spawn_execution(&self, record: ExecutionRecord) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight {
            count: Arc::clone(&self.in_flight),
            idle: Arc::clone(&self.idle),
        };
        let this = self.clone();
        let span = start_execution_span(record.kind, record.exchange_id);
        let task_span = span.clone();

        tokio::spawn(
            async move {
                let _guard = guard;
                this.execute(record, &task_span).await;
            }
            .instrument(span),
        );
    }

    /// Drive one record to a terminal status. Owns the record for its
    /// whole life; nothing here is returned to the submitter.
    async fn execute(&self, record: ExecutionRecord, span: &Span) {
        let exchange_id = record.exchange_id;
        let started = Instant::now();

        if let Err(e) = self
            .write_transition(exchange_id, &[Status::Pending], Status::Running, RecordPatch::default())
            .await
        {
            abandon(exchange_id, Status::Pending, Status::Running, &e);
            return;
        }
        record_state_transition(span, Status::Pending, Status::Running);

        let policy = self.registry.policy(record.kind);
        let base_retries = record.retry_count;
        let outcome = retry::execute_with_retry(&policy, &ByTag, |n| {
            self.attempt(&record, n, base_retries)
        })
        .await;

        let now = Utc::now();
        let (to, patch) = match outcome {
            Ok(done) => (
                Status::Completed,
                RecordPatch::default()
                    .result(done.value)
                    .retry_count(base_retries + done.attempts - 1)
                    .completed_at(now)
                    .retain_until(self.retain_until(&record, now)),
            ),
            Err(failure) => {
                warn!(
                    %exchange_id,
                    attempts = failure.attempts,
                    class = %failure.class,
                    error = %failure.error.message,
                    "execution failed"
                );
                (
                    Status::Failed,
                    RecordPatch::default()
                        .error(ErrorDetail {
                            class: failure.class,
                            message: failure.error.message,
                            attempts: failure.attempts,
                        })
                        .retry_count(base_retries + failure.attempts - 1)
                        .completed_at(now)
                        .retain_until(self.retain_until(&record, now)),
                )
            }
        };

        if let Err(e) = self
            .write_transition(exchange_id, &Status::LIVE, to, patch)
            .await
        {
            abandon(exchange_id, Status::Running, to, &e);
            return;
        }
        record_state_transition(span, Status::Running, to);
        metrics::execution_duration_ms().record(
            started.elapsed().as_millis() as f64,
            &[
                KeyValue::new("kind", record.kind.as_str()),
                KeyValue::new("status", to.as_str()),
            ],
        );

        self.finish(&record).await;
    }

    /// One runner attempt. Attempts after the first persist the running
    /// retry count before calling out.
    async fn attempt(
        &self,
        record: &ExecutionRecord,
        number: u32,
        base_retries: u32,
    ) -> std::result::Result<serde_json::Value, ClassifiedError> {
        let exchange_id = record.exchange_id;
        if number > 1 {
            let patch = RecordPatch::default().retry_count(base_retries + number - 1);
            match self
                .write_transition(exchange_id, &[Status::Running], Status::Running, patch)
                .await
            {
                Ok(()) => {}
                Err(e @ Error::StaleTransition { .. }) => {
                    abandon(exchange_id, Status::Running, Status::Running, &e);
                    // Someone else moved the record; further attempts would
                    // act on an execution we no longer own.
                    return Err(ClassifiedError::terminal(format!(
                        "execution no longer owned: {e}"
                    )));
                }
                // The count is bookkeeping; the final write carries it anyway.
                Err(e) => warn!(%exchange_id, attempt = number, "retry count not persisted: {e}"),
            }
        }

        let result = self
            .runner
            .run(
                &record.request,
                Attempt {
                    exchange_id,
                    number,
                },
            )
            .await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_retriable() => "retriable",
            Err(_) => "terminal",
        };
        metrics::runner_attempts().add(
            1,
            &[
                KeyValue::new("kind", record.kind.as_str()),
                KeyValue::new("outcome", outcome),
            ],
        );
        result
    }

    /// Post-terminal steps: free the fingerprint, then notify.
    pub(crate) async fn finish(&self, record: &ExecutionRecord) {
        let exchange_id = record.exchange_id;
        if let Err(e) = self
            .store_call(|_| self.store.release_dedup(&record.fingerprint, exchange_id))
            .await
        {
            // The entry's TTL bounds how long the fingerprint stays blocked.
            warn!(%exchange_id, fingerprint = %record.fingerprint, "dedup release failed: {e}");
        }

        let snapshot = match self.store_call(|_| self.store.get(exchange_id)).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                error!(%exchange_id, "terminal record vanished before publish");
                return;
            }
            Err(e) => {
                error!(%exchange_id, "cannot read terminal record for publish: {e}");
                return;
            }
        };
        self.publish(TerminalEvent::from_record(snapshot)).await;
    }

    /// Conditional transition with transient store errors retried. A stale
    /// answer to a retry is checked against the record: if our own earlier
    /// write landed before the error surfaced, the move already happened.
    async fn write_transition(
        &self,
        exchange_id: ExchangeId,
        from: &[Status],
        to: Status,
        patch: RecordPatch,
    ) -> Result<()> {
        let mut retried = false;
        let outcome = self
            .store_call(|n| {
                retried = n > 1;
                self.store.transition(exchange_id, from, to, patch.clone())
            })
            .await;

        match outcome {
            Err(Error::StaleTransition { .. }) if retried && to.is_terminal() => {
                match self.store_call(|_| self.store.get(exchange_id)).await? {
                    Some(current) if current.status == to => Ok(()),
                    _ => outcome,
                }
            }
            _ => outcome,
        }
    }

    /// Run a store operation under the store policy. Stale transitions,
    /// duplicates and lookups that found nothing are answers, not faults.
    async fn store_call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let classify = |e: &Error| match e {
            Error::StaleTransition { .. }
            | Error::Duplicate(_)
            | Error::NotFound(_)
            | Error::Validation(_)
            | Error::Config(_)
            | Error::Serialization(_) => FailureClass::Terminal,
            _ => FailureClass::Retriable,
        };
        retry::execute_with_retry(&self.config.store_policy, &classify, operation)
            .await
            .map(|done| done.value)
            .map_err(|failure| failure.error)
    }

    /// Retention deadline for a record finishing at `completed_at`: the
    /// latest entry expiration, but never sooner than the configured floor.
    pub(crate) fn retain_until(
        &self,
        record: &ExecutionRecord,
        completed_at: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let floor = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|d| completed_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        record
            .request
            .latest_expiration()
            .map(|date| date.and_time(NaiveTime::MIN).and_utc())
            .map_or(floor, |expiry| expiry.max(floor))
    }

    /// Best-effort, at-least-once delivery. Failure is logged and dropped.
    async fn publish(&self, event: TerminalEvent) {
        let always_retry = |_: &Error| FailureClass::Retriable;
        let outcome = retry::execute_with_retry(&self.config.publish_policy, &always_retry, |_| {
            self.publisher.publish(&event)
        })
        .await;

        match outcome {
            Ok(_) => {
                metrics::events_published().add(1, &[KeyValue::new("result", "ok")]);
            }
            Err(failure) => {
                metrics::events_published().add(1, &[KeyValue::new("result", "failed")]);
                error!(
                    exchange_id = %event.exchange_id,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "terminal event dropped"
                );
            }
        }
    }
}

/// The task stops driving the record. A stale transition means a second
/// writer; anything else means the store stayed unreachable, and the record
/// is left live for the stale sweep.
fn abandon(exchange_id: ExchangeId, from: Status, to: Status, e: &Error) {
    if matches!(e, Error::StaleTransition { .. }) {
        error!(
            %exchange_id,
            from = from.as_str(),
            to = to.as_str(),
            error = %e,
            "internal consistency violation: record moved under its owner"
        );
    } else {
        error!(
            %exchange_id,
            from = from.as_str(),
            to = to.as_str(),
            error = %e,
            "store unavailable, execution abandoned until swept"
        );
    }
}
