//! Shared fixtures: request builders, a scripted runner, a recording
//! publisher and a store that fails on demand.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use portalflow::engine::{EngineConfig, Orchestrator};
use portalflow::error::{Error, Result};
use portalflow::event::{EventPublisher, TerminalEvent};
use portalflow::model::*;
use portalflow::retry::{ClassifiedError, RetryPolicy};
use portalflow::runner::{Attempt, Runner};
use portalflow::fingerprint::Fingerprint;
use portalflow::store::{ExecutionStore, MemoryStore};
use portalflow::workflow::{WorkflowRegistry, WorkflowSpec};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::Semaphore;

pub const TAXPAYER: &str = "20123456789";

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn credentials() -> CredentialRef {
    CredentialRef {
        taxpayer_id: TAXPAYER.to_string(),
        secret_ref: Some(SecretRef::from("vault://taxpayers/20123456789")),
    }
}

pub fn declaration_entry(concept: &str, amount: &str) -> DeclarationEntry {
    DeclarationEntry {
        payment_method: PaymentMethod::Qr,
        expiration_date: date(2025, 7, 15),
        form_number: "1571".to_string(),
        payment_type_code: "19".to_string(),
        taxpayer_id: TAXPAYER.to_string(),
        concept: concept.to_string(),
        sub_concept: "19".to_string(),
        fiscal_period: "202506".to_string(),
        amount: Decimal::from_str(amount).unwrap(),
        tax_code: "30".to_string(),
    }
}

pub fn debt_entry(from: &str, to: &str) -> DebtCalculationEntry {
    DebtCalculationEntry {
        period_from: from.parse().unwrap(),
        period_to: to.parse().unwrap(),
        calculation_date: date(2025, 6, 1),
        expiration_date: date(2025, 6, 30),
        payment_method: PaymentMethod::Link,
        taxpayer_type: None,
        tax_type: Some("IVA".to_string()),
        include_interest: false,
    }
}

pub fn declaration(entries: Vec<DeclarationEntry>) -> WorkflowRequest {
    WorkflowRequest::new(credentials(), WorkflowPayload::Declaration(entries))
}

pub fn debt_calculation(entries: Vec<DebtCalculationEntry>) -> WorkflowRequest {
    WorkflowRequest::new(credentials(), WorkflowPayload::DebtCalculation(entries))
}

/// A declaration request that differs from others by `concept`.
pub fn request(concept: &str) -> WorkflowRequest {
    declaration(vec![declaration_entry(concept, "105.00")])
}

// ---------------------------------------------------------------------------
// Scripted runner
// ---------------------------------------------------------------------------

/// Plays back queued outcomes, then succeeds. When gated, each attempt waits
/// for a permit before returning.
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<std::result::Result<serde_json::Value, ClassifiedError>>>,
    calls: AtomicUsize,
    secrets: Mutex<Vec<Option<String>>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedRunner {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn with_script(
        outcomes: impl IntoIterator<Item = std::result::Result<serde_json::Value, ClassifiedError>>,
    ) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Attempts block until a permit is added to the returned semaphore.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let runner = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (runner, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The secret reference each attempt was handed.
    pub fn secrets_seen(&self) -> Vec<Option<String>> {
        self.secrets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(
        &self,
        request: &WorkflowRequest,
        attempt: Attempt,
    ) -> std::result::Result<serde_json::Value, ClassifiedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.secrets
            .lock()
            .unwrap()
            .push(request.credentials.secret_ref.as_ref().map(|s| s.expose().to_string()));
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(json!({
                "kind": request.kind().as_str(),
                "attempt": attempt.number,
                "slip": format!("VEP-{}", attempt.exchange_id),
            }))
        })
    }
}

// ---------------------------------------------------------------------------
// Recording publisher
// ---------------------------------------------------------------------------

/// Keeps every published event. Can be told to fail the next N publishes.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<TerminalEvent>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl RecordingPublisher {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<TerminalEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &TerminalEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Publish("log unavailable".to_string()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

/// Registry whose kinds retry immediately, `max_attempts` times.
pub fn fast_registry(max_attempts: u32) -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::empty();
    for kind in [WorkflowKind::Declaration, WorkflowKind::DebtCalculation] {
        registry.insert(WorkflowSpec {
            kind,
            command: "/bin/true".into(),
            timeout_secs: 5,
            retry: RetryPolicy::immediate(max_attempts),
        });
    }
    registry
}

/// Engine knobs for tests: 60s retention floor, immediate retries.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        retention: std::time::Duration::from_secs(60),
        publish_policy: RetryPolicy::immediate(3),
        store_policy: RetryPolicy::immediate(3),
    }
}

pub struct Harness {
    pub engine: Orchestrator,
    /// The records, whatever store the engine talks to.
    pub store: Arc<MemoryStore>,
    pub runner: Arc<ScriptedRunner>,
    pub publisher: Arc<RecordingPublisher>,
}

pub fn harness(runner: ScriptedRunner) -> Harness {
    harness_with(runner, RecordingPublisher::default(), 3)
}

pub fn harness_with(
    runner: ScriptedRunner,
    publisher: RecordingPublisher,
    max_attempts: u32,
) -> Harness {
    let store = Arc::new(MemoryStore::default());
    build_harness(store.clone(), store, runner, publisher, max_attempts, test_config())
}

pub fn harness_with_config(runner: ScriptedRunner, config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::default());
    build_harness(store.clone(), store, runner, RecordingPublisher::default(), 3, config)
}

/// Engine over a `FlakyStore`; `h.store` is the memory store underneath.
pub fn flaky_harness(runner: ScriptedRunner, flaky: FlakyStore) -> Harness {
    let memory = Arc::clone(&flaky.inner);
    build_harness(
        Arc::new(flaky),
        memory,
        runner,
        RecordingPublisher::default(),
        3,
        test_config(),
    )
}

fn build_harness(
    engine_store: Arc<dyn ExecutionStore>,
    store: Arc<MemoryStore>,
    runner: ScriptedRunner,
    publisher: RecordingPublisher,
    max_attempts: u32,
    config: EngineConfig,
) -> Harness {
    let runner = Arc::new(runner);
    let publisher = Arc::new(publisher);
    let engine = Orchestrator::new(
        engine_store,
        runner.clone(),
        publisher.clone(),
        Arc::new(fast_registry(max_attempts)),
    )
    .with_config(config);
    Harness {
        engine,
        store,
        runner,
        publisher,
    }
}

// ---------------------------------------------------------------------------
// Flaky store
// ---------------------------------------------------------------------------

/// Delegates to a `MemoryStore` but injects connection errors.
#[derive(Default)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    /// Terminal transitions to reject before touching the record.
    terminal_failures: AtomicUsize,
    /// Terminal transitions to apply and then report as failed.
    lost_acks: AtomicUsize,
    /// `get` calls to reject.
    get_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_terminal_writes(times: usize) -> Self {
        Self {
            terminal_failures: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn losing_terminal_acks(times: usize) -> Self {
        Self {
            lost_acks: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn failing_reads(times: usize) -> Self {
        Self {
            get_failures: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn memory(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.inner)
    }
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn connection_reset() -> Error {
    Error::Other("connection reset".to_string())
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn reserve(&self, fingerprint: &Fingerprint, record: ExecutionRecord) -> Result<ExchangeId> {
        self.inner.reserve(fingerprint, record).await
    }

    async fn transition(
        &self,
        exchange_id: ExchangeId,
        from: &[Status],
        to: Status,
        patch: RecordPatch,
    ) -> Result<()> {
        if to.is_terminal() && take(&self.terminal_failures) {
            return Err(connection_reset());
        }
        let applied = self.inner.transition(exchange_id, from, to, patch).await;
        if applied.is_ok() && to.is_terminal() && take(&self.lost_acks) {
            return Err(connection_reset());
        }
        applied
    }

    async fn get(&self, exchange_id: ExchangeId) -> Result<Option<ExecutionRecord>> {
        if take(&self.get_failures) {
            return Err(connection_reset());
        }
        self.inner.get(exchange_id).await
    }

    async fn release_dedup(&self, fingerprint: &Fingerprint, exchange_id: ExchangeId) -> Result<()> {
        self.inner.release_dedup(fingerprint, exchange_id).await
    }

    async fn list_retry_candidates(&self) -> Result<Vec<ExecutionRecord>> {
        self.inner.list_retry_candidates().await
    }

    async fn list_stale(&self, before: DateTime<Utc>) -> Result<Vec<ExecutionRecord>> {
        self.inner.list_stale(before).await
    }

    async fn purge_terminal(&self, now: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_terminal(now).await
    }
}
