//! Execution record store.
//!
//! Single source of truth for execution state. Every mutation goes through
//! a conditional operation: `reserve` is the linearizable admission point per
//! fingerprint, `transition` only applies if the record is still in one of
//! the statuses the caller expects. Nobody holds a lock across calls.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::model::{ExchangeId, ExecutionRecord, RecordPatch, Status};

/// Persistence contract the engine is written against.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Atomically admit `record` under `fingerprint`.
    ///
    /// Fails with [`Error::Duplicate`] carrying the live holder's id when the
    /// dedup index already has an unexpired entry, or when `record.retry_of`
    /// already has a successor. Otherwise inserts the record as `pending`
    /// together with the dedup entry.
    async fn reserve(&self, fingerprint: &Fingerprint, record: ExecutionRecord) -> Result<ExchangeId>;

    /// Move the record to `to` if its current status is in `from` and the
    /// move is legal; otherwise [`Error::StaleTransition`].
    async fn transition(
        &self,
        exchange_id: ExchangeId,
        from: &[Status],
        to: Status,
        patch: RecordPatch,
    ) -> Result<()>;

    /// Point read.
    async fn get(&self, exchange_id: ExchangeId) -> Result<Option<ExecutionRecord>>;

    /// Drop the dedup entry if it still points at `exchange_id`. Idempotent.
    async fn release_dedup(&self, fingerprint: &Fingerprint, exchange_id: ExchangeId) -> Result<()>;

    /// Failed records nobody has re-admitted yet.
    async fn list_retry_candidates(&self) -> Result<Vec<ExecutionRecord>>;

    /// Live records whose last update is older than `before`.
    async fn list_stale(&self, before: DateTime<Utc>) -> Result<Vec<ExecutionRecord>>;

    /// Delete terminal records whose `retain_until` (or `completed_at`, when
    /// unset) is before `now`. Returns the count.
    async fn purge_terminal(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Legal subset of `from` for a move to `to`. Empty means the move can
/// never succeed, whatever the record holds.
pub(crate) fn legal_sources(from: &[Status], to: Status) -> Vec<Status> {
    from.iter()
        .copied()
        .filter(|s| s.can_transition_to(to))
        .collect()
}

pub(crate) fn stale(exchange_id: ExchangeId, from: &[Status], to: Status) -> Error {
    Error::StaleTransition {
        exchange_id,
        expected: from.to_vec(),
        to,
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DedupEntry {
    exchange_id: ExchangeId,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<ExchangeId, ExecutionRecord>,
    dedup: HashMap<Fingerprint, DedupEntry>,
    /// Failed records that already have a re-admission, mapped to it.
    successors: HashMap<ExchangeId, ExchangeId>,
}

/// Process-local store. One mutex makes every operation atomic; it is never
/// held across an await.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    dedup_ttl: Duration,
}

impl MemoryStore {
    pub fn new(dedup_ttl: std::time::Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            dedup_ttl: Duration::from_std(dedup_ttl).unwrap_or_else(|_| Duration::days(36_500)),
        }
    }

    /// Current dedup holder for a fingerprint, if any (expired entries excluded).
    pub fn dedup_holder(&self, fingerprint: &Fingerprint) -> Option<ExchangeId> {
        let inner = self.lock();
        inner
            .dedup
            .get(fingerprint)
            .filter(|e| e.expires_at > Utc::now())
            .map(|e| e.exchange_id)
    }

    /// Number of records held, terminal or not.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-operation;
        // every operation leaves the maps consistent before it can panic.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(2 * 60 * 60))
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn reserve(&self, fingerprint: &Fingerprint, mut record: ExecutionRecord) -> Result<ExchangeId> {
        let now = Utc::now();
        let mut inner = self.lock();

        if let Some(entry) = inner.dedup.get(fingerprint) {
            if entry.expires_at > now {
                return Err(Error::Duplicate(entry.exchange_id));
            }
        }
        if let Some(prior) = record.retry_of {
            if let Some(successor) = inner.successors.get(&prior) {
                return Err(Error::Duplicate(*successor));
            }
        }

        let id = record.exchange_id;
        record.status = Status::Pending;
        record.fingerprint = fingerprint.clone();
        if let Some(prior) = record.retry_of {
            inner.successors.insert(prior, id);
        }
        inner.dedup.insert(
            fingerprint.clone(),
            DedupEntry {
                exchange_id: id,
                expires_at: now + self.dedup_ttl,
            },
        );
        inner.records.insert(id, record);
        Ok(id)
    }

    async fn transition(
        &self,
        exchange_id: ExchangeId,
        from: &[Status],
        to: Status,
        patch: RecordPatch,
    ) -> Result<()> {
        let allowed = legal_sources(from, to);
        let mut inner = self.lock();
        let Some(record) = inner.records.get_mut(&exchange_id) else {
            return Err(stale(exchange_id, from, to));
        };
        if !allowed.contains(&record.status) {
            return Err(stale(exchange_id, from, to));
        }
        record.apply(to, &patch, Utc::now());
        Ok(())
    }

    async fn get(&self, exchange_id: ExchangeId) -> Result<Option<ExecutionRecord>> {
        Ok(self.lock().records.get(&exchange_id).cloned())
    }

    async fn release_dedup(&self, fingerprint: &Fingerprint, exchange_id: ExchangeId) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .dedup
            .get(fingerprint)
            .is_some_and(|e| e.exchange_id == exchange_id)
        {
            inner.dedup.remove(fingerprint);
        }
        Ok(())
    }

    async fn list_retry_candidates(&self) -> Result<Vec<ExecutionRecord>> {
        let inner = self.lock();
        let mut out: Vec<ExecutionRecord> = inner
            .records
            .values()
            .filter(|r| r.status == Status::Failed && !inner.successors.contains_key(&r.exchange_id))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn list_stale(&self, before: DateTime<Utc>) -> Result<Vec<ExecutionRecord>> {
        let inner = self.lock();
        let mut out: Vec<ExecutionRecord> = inner
            .records
            .values()
            .filter(|r| r.is_live() && r.updated_at < before)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.updated_at);
        Ok(out)
    }

    async fn purge_terminal(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let doomed: HashSet<ExchangeId> = inner
            .records
            .values()
            .filter(|r| {
                r.status.is_terminal() && r.retain_until.or(r.completed_at).is_some_and(|at| at < now)
            })
            .map(|r| r.exchange_id)
            .collect();
        inner.records.retain(|id, _| !doomed.contains(id));
        inner.successors.retain(|prior, _| !doomed.contains(prior));
        Ok(doomed.len() as u64)
    }
}
