//! Postgres-backed execution store.
//!
//! The dedup index is its own table keyed by fingerprint; admission is an
//! `INSERT .. ON CONFLICT DO NOTHING` against it inside the same transaction
//! that inserts the record, so exactly one racing caller wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::model::{ExchangeId, ExecutionRecord, RecordPatch, Status};
use crate::store::{ExecutionStore, legal_sources, stale};

const SELECT_COLUMNS: &str = "SELECT exchange_id, fingerprint, kind, request, status, retry_count, retry_of, created_at, updated_at, completed_at, retain_until, result, error FROM executions";

/// How many times `reserve` re-checks when the conflicting dedup entry
/// disappears between the insert and the lookup.
const RESERVE_ROUNDS: usize = 3;

#[async_trait]
impl ExecutionStore for super::Db {
    async fn reserve(&self, fingerprint: &Fingerprint, record: ExecutionRecord) -> Result<ExchangeId> {
        let ttl = chrono::Duration::from_std(self.dedup_ttl)
            .map_err(|e| Error::Config(format!("dedup ttl out of range: {e}")))?;
        let request = serde_json::to_value(&record.request)?;

        for _ in 0..RESERVE_ROUNDS {
            let mut tx = self.pool().begin().await?;
            let now = Utc::now();

            sqlx::query("DELETE FROM dedup_index WHERE fingerprint = $1 AND expires_at <= $2")
                .bind(fingerprint.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;

            let claimed: Option<(Uuid,)> = sqlx::query_as(
                "INSERT INTO dedup_index (fingerprint, exchange_id, expires_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (fingerprint) DO NOTHING
                 RETURNING exchange_id",
            )
            .bind(fingerprint.as_str())
            .bind(record.exchange_id.0)
            .bind(now + ttl)
            .fetch_optional(&mut *tx)
            .await?;

            if claimed.is_none() {
                let holder: Option<(Uuid,)> =
                    sqlx::query_as("SELECT exchange_id FROM dedup_index WHERE fingerprint = $1")
                        .bind(fingerprint.as_str())
                        .fetch_optional(&mut *tx)
                        .await?;
                tx.rollback().await?;
                match holder {
                    Some((id,)) => return Err(Error::Duplicate(ExchangeId(id))),
                    // Released between our insert and lookup; try again.
                    None => continue,
                }
            }

            // Any unique violation here is the retry_of index: someone else
            // already re-admitted the same failed record.
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                "INSERT INTO executions (exchange_id, fingerprint, kind, request, status, retry_count, retry_of, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $7)
                 ON CONFLICT DO NOTHING
                 RETURNING exchange_id",
            )
            .bind(record.exchange_id.0)
            .bind(fingerprint.as_str())
            .bind(record.kind.as_str())
            .bind(&request)
            .bind(record.retry_count as i32)
            .bind(record.retry_of.map(|p| p.0))
            .bind(record.created_at)
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_none() {
                tx.rollback().await?;
                let successor: Option<(Uuid,)> =
                    sqlx::query_as("SELECT exchange_id FROM executions WHERE retry_of = $1")
                        .bind(record.retry_of.map(|p| p.0))
                        .fetch_optional(self.pool())
                        .await?;
                return match successor {
                    Some((id,)) => Err(Error::Duplicate(ExchangeId(id))),
                    None => Err(Error::Other(format!(
                        "execution {} conflicted on insert",
                        record.exchange_id
                    ))),
                };
            }

            tx.commit().await?;
            return Ok(record.exchange_id);
        }

        Err(Error::Other(format!(
            "could not settle dedup entry for {fingerprint} after {RESERVE_ROUNDS} rounds"
        )))
    }

    async fn transition(
        &self,
        exchange_id: ExchangeId,
        from: &[Status],
        to: Status,
        patch: RecordPatch,
    ) -> Result<()> {
        let allowed: Vec<String> = legal_sources(from, to)
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        if allowed.is_empty() {
            return Err(stale(exchange_id, from, to));
        }

        let error = patch.error.as_ref().map(serde_json::to_value).transpose()?;
        let rows_affected = sqlx::query(
            "UPDATE executions SET status = $1, updated_at = $2,
                retry_count = COALESCE($3, retry_count),
                result = COALESCE($4, result),
                error = COALESCE($5, error),
                completed_at = COALESCE($6, completed_at),
                retain_until = COALESCE($7, retain_until)
             WHERE exchange_id = $8 AND status = ANY($9)",
        )
        .bind(to.to_string())
        .bind(Utc::now())
        .bind(patch.retry_count.map(|n| n as i32))
        .bind(&patch.result)
        .bind(&error)
        .bind(patch.completed_at)
        .bind(patch.retain_until)
        .bind(exchange_id.0)
        .bind(&allowed)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(stale(exchange_id, from, to));
        }
        Ok(())
    }

    async fn get(&self, exchange_id: ExchangeId) -> Result<Option<ExecutionRecord>> {
        let row: Option<ExecutionRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE exchange_id = $1"))
                .bind(exchange_id.0)
                .fetch_optional(self.pool())
                .await?;
        row.map(ExecutionRow::try_into_record).transpose()
    }

    async fn release_dedup(&self, fingerprint: &Fingerprint, exchange_id: ExchangeId) -> Result<()> {
        sqlx::query("DELETE FROM dedup_index WHERE fingerprint = $1 AND exchange_id = $2")
            .bind(fingerprint.as_str())
            .bind(exchange_id.0)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn list_retry_candidates(&self) -> Result<Vec<ExecutionRecord>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} e WHERE e.status = 'failed'
             AND NOT EXISTS (SELECT 1 FROM executions s WHERE s.retry_of = e.exchange_id)
             ORDER BY e.created_at"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(ExecutionRow::try_into_record).collect()
    }

    async fn list_stale(&self, before: DateTime<Utc>) -> Result<Vec<ExecutionRecord>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('pending', 'running') AND updated_at < $1 ORDER BY updated_at"
        ))
        .bind(before)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(ExecutionRow::try_into_record).collect()
    }

    async fn purge_terminal(&self, now: DateTime<Utc>) -> Result<u64> {
        let rows_affected = sqlx::query(
            "DELETE FROM executions
             WHERE status IN ('completed', 'failed')
               AND COALESCE(retain_until, completed_at) < $1",
        )
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ExecutionRow {
    exchange_id: Uuid,
    fingerprint: String,
    kind: String,
    request: serde_json::Value,
    status: String,
    retry_count: i32,
    retry_of: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    retain_until: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

impl ExecutionRow {
    fn try_into_record(self) -> Result<ExecutionRecord> {
        Ok(ExecutionRecord {
            exchange_id: ExchangeId(self.exchange_id),
            fingerprint: Fingerprint::from_hex(self.fingerprint),
            kind: self.kind.parse()?,
            request: serde_json::from_value(self.request)?,
            status: self.status.parse()?,
            retry_count: self.retry_count.max(0) as u32,
            retry_of: self.retry_of.map(ExchangeId),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            retain_until: self.retain_until,
            result: self.result,
            error: self.error.map(serde_json::from_value).transpose()?,
        })
    }
}
