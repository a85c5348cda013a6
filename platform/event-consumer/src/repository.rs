//! Outbox / inbox persistence (§4.4, §6.3).
//!
//! Table and schema identifiers are validated once at construction against
//! `^[A-Za-z_][A-Za-z0-9_]*$` and then interpolated into prepared query
//! text — every value in those queries is still bound, never interpolated
//! (§4.4: "schema and table names are validated... and never interpolated
//! from unchecked sources" applies to identifiers; values always go through
//! `sqlx`'s bind parameters).
//!
//! Grounded on `identity-auth`'s `sqlx::{Pool, Postgres}` usage pattern —
//! the only sqlx-against-Postgres code in the retrieval pack — generalized
//! to the claim protocol this spec requires.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use event_bus::{retry_with_backoff, ErrorClass, MessagingError, RetryConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};

use crate::error::RepositoryError;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

fn validate_identifier(name: &str) -> Result<(), RepositoryError> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(RepositoryError::Messaging(MessagingError::Config(format!(
            "invalid identifier {name:?}: must match ^[A-Za-z_][A-Za-z0-9_]*$"
        ))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processed,
    Failed,
    Archived,
}

impl OutboxStatus {
    fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub producer_service: String,
    pub event_type: String,
    pub message_body: Value,
    pub partition_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Processing,
    Processed,
    Failed,
}

impl InboxStatus {
    fn as_str(self) -> &'static str {
        match self {
            InboxStatus::Processing => "processing",
            InboxStatus::Processed => "processed",
            InboxStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboxRow {
    pub message_id: String,
    pub consumer_service: String,
    pub event_name: String,
    pub status: String,
    pub attempts: i32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub metadata: Option<Value>,
}

/// Outcome of [`Repository::try_claim_inbox`] (§4.2.3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No row existed; this worker created it.
    Inserted,
    /// A row existed in a claimable state; this worker now owns it.
    Claimed,
    /// A row existed and is actively owned by another worker.
    Rejected,
}

pub struct Repository {
    pool: PgPool,
    schema: String,
}

impl Repository {
    pub async fn connect(
        connection_uri: &str,
        schema: &str,
        max_connections: u32,
        statement_timeout_ms: u64,
    ) -> Result<Self, RepositoryError> {
        validate_identifier(schema)?;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .after_connect(move |conn, _meta| {
                let statement = format!("SET statement_timeout = {statement_timeout_ms}");
                Box::pin(async move {
                    sqlx::query(&statement).execute(conn).await.map(|_| ())
                })
            })
            .connect(connection_uri)
            .await?;

        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn with_pool(pool: PgPool, schema: &str) -> Result<Self, RepositoryError> {
        validate_identifier(schema)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// True if a lightweight probe query succeeds (used by the circuit
    /// breaker's `ensureHealthyOrSleep`, §4.2.7).
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    #[instrument(skip(self, body), fields(operation = "insert_outbox", table = %self.table("outbox")))]
    pub async fn insert_outbox(
        &self,
        producer_service: &str,
        event_type: &str,
        body: &Value,
        partition_key: Option<&str>,
    ) -> Result<i64, RepositoryError> {
        let retry_config = RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(50 * 16), // 50ms doubling five times caps near here
        };

        let table = self.table("outbox");
        retry_with_backoff(
            || async {
                let sql = format!(
                    "INSERT INTO {table} (producer_service, event_type, message_body, partition_key, created_at, status) \
                     VALUES ($1, $2, $3, $4, NOW(), 'pending') RETURNING id"
                );
                sqlx::query(&sql)
                    .bind(producer_service)
                    .bind(event_type)
                    .bind(body)
                    .bind(partition_key)
                    .fetch_one(&self.pool)
                    .await
                    .map(|row| row.get::<i64, _>("id"))
                    .map_err(RepositoryError::Sqlx)
            },
            &retry_config,
            "insert_outbox",
        )
        .await
        .map_err(|e| {
            if e.class() == ErrorClass::Storage {
                RepositoryError::Messaging(MessagingError::Storage(e.to_string()))
            } else {
                e
            }
        })
    }

    #[instrument(skip(self), fields(operation = "fetch_pending_outbox", table = %self.table("outbox")))]
    pub async fn fetch_pending_outbox(&self, limit: i64) -> Result<Vec<OutboxRow>, RepositoryError> {
        let table = self.table("outbox");
        let sql = format!(
            "SELECT id, producer_service, event_type, message_body, partition_key, created_at, processed_at, status \
             FROM {table} WHERE status = 'pending' ORDER BY id ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_outbox).collect())
    }

    /// Same as [`Self::fetch_pending_outbox`] but returns at most one row
    /// per distinct `partition_key` (rows with a `NULL` key are each their
    /// own singleton group), so a dispatcher built against it preserves
    /// same-key ordering without a second lock (DESIGN.md open question 2).
    #[instrument(skip(self), fields(operation = "fetch_pending_outbox_ordered", table = %self.table("outbox")))]
    pub async fn fetch_pending_outbox_ordered(
        &self,
        limit: i64,
    ) -> Result<Vec<OutboxRow>, RepositoryError> {
        let candidates = self.fetch_pending_outbox(limit * 4).await?;
        let mut seen_keys: HashMap<String, ()> = HashMap::new();
        let mut result = Vec::new();

        for row in candidates {
            match &row.partition_key {
                None => result.push(row),
                Some(key) => {
                    if !seen_keys.contains_key(key) {
                        seen_keys.insert(key.clone(), ());
                        result.push(row);
                    }
                }
            }
            if result.len() as i64 >= limit {
                break;
            }
        }

        Ok(result)
    }

    #[instrument(skip(self), fields(operation = "mark_outbox_processed", table = %self.table("outbox")))]
    pub async fn mark_outbox_processed(&self, id: i64) -> Result<(), RepositoryError> {
        let table = self.table("outbox");
        let sql = format!("UPDATE {table} SET status = 'processed', processed_at = NOW() WHERE id = $1");
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, reason), fields(operation = "mark_outbox_failed", table = %self.table("outbox")))]
    pub async fn mark_outbox_failed(&self, id: i64, reason: &str) -> Result<(), RepositoryError> {
        let table = self.table("outbox");
        let sql = format!("UPDATE {table} SET status = 'failed' WHERE id = $1");
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        warn!(outbox_id = id, reason, "outbox row marked failed");
        Ok(())
    }

    /// Atomic claim (§4.2.3): `INSERT`, and on unique-constraint conflict a
    /// conditional `UPDATE` restricted to rows that are `failed` or whose
    /// processing lock is older than `stale_threshold`.
    #[instrument(skip(self), fields(operation = "try_claim_inbox", table = %self.table("inbox")))]
    pub async fn try_claim_inbox(
        &self,
        message_id: &str,
        consumer_service: &str,
        event_name: &str,
        worker_id: &str,
        stale_threshold: Duration,
    ) -> Result<ClaimOutcome, RepositoryError> {
        let table = self.table("inbox");
        let insert_sql = format!(
            "INSERT INTO {table} \
             (message_id, consumer_service, event_name, status, attempts, first_seen_at, last_seen_at, locked_at, locked_by) \
             VALUES ($1, $2, $3, 'processing', 1, NOW(), NOW(), NOW(), $4)"
        );

        let insert_result = sqlx::query(&insert_sql)
            .bind(message_id)
            .bind(consumer_service)
            .bind(event_name)
            .bind(worker_id)
            .execute(&self.pool)
            .await;

        match insert_result {
            Ok(_) => return Ok(ClaimOutcome::Inserted),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {}
            Err(e) => return Err(RepositoryError::Inbox(e)),
        }

        let stale_secs = stale_threshold.as_secs() as f64;
        let update_sql = format!(
            "UPDATE {table} SET status = 'processing', attempts = attempts + 1, last_seen_at = NOW(), \
             locked_at = NOW(), locked_by = $4 \
             WHERE message_id = $1 AND consumer_service = $2 \
             AND (status = 'failed' OR (status = 'processing' AND locked_at < NOW() - make_interval(secs => $3)))"
        );

        let update_result = sqlx::query(&update_sql)
            .bind(message_id)
            .bind(consumer_service)
            .bind(stale_secs)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::Inbox)?;

        if update_result.rows_affected() == 1 {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::Rejected)
        }
    }

    #[instrument(skip(self), fields(operation = "mark_inbox_processed", table = %self.table("inbox")))]
    pub async fn mark_inbox_processed(
        &self,
        message_id: &str,
        consumer_service: &str,
    ) -> Result<(), RepositoryError> {
        let table = self.table("inbox");
        let sql = format!(
            "UPDATE {table} SET status = 'processed', last_seen_at = NOW(), locked_at = NULL, locked_by = NULL \
             WHERE message_id = $1 AND consumer_service = $2"
        );
        sqlx::query(&sql)
            .bind(message_id)
            .bind(consumer_service)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::Inbox)?;
        Ok(())
    }

    #[instrument(skip(self, reason), fields(operation = "mark_inbox_failed", table = %self.table("inbox")))]
    pub async fn mark_inbox_failed(
        &self,
        message_id: &str,
        consumer_service: &str,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        let table = self.table("inbox");
        let sql = format!(
            "UPDATE {table} SET status = 'failed', last_seen_at = NOW(), locked_at = NULL, locked_by = NULL, \
             metadata = jsonb_build_object('last_error', $3::text) \
             WHERE message_id = $1 AND consumer_service = $2"
        );
        sqlx::query(&sql)
            .bind(message_id)
            .bind(consumer_service)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::Inbox)?;
        Ok(())
    }

    /// Delete outbox/inbox rows older than `retention` (default 30 days,
    /// §4.4). Returns `(outbox_deleted, inbox_deleted)`.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, retention: Duration) -> Result<(u64, u64), RepositoryError> {
        // Kept as a separate timed future below so a host that wants its own
        // scheduling (cron, a k8s CronJob hitting a maintenance endpoint)
        // can call `cleanup` directly instead of `run_cleanup_loop`.
        let retention_secs = retention.as_secs() as f64;

        let outbox_table = self.table("outbox");
        let outbox_sql = format!(
            "DELETE FROM {outbox_table} WHERE status IN ('processed', 'archived') \
             AND created_at < NOW() - make_interval(secs => $1)"
        );
        let outbox_result = sqlx::query(&outbox_sql)
            .bind(retention_secs)
            .execute(&self.pool)
            .await?;

        let inbox_table = self.table("inbox");
        let inbox_sql = format!(
            "DELETE FROM {inbox_table} WHERE status = 'processed' \
             AND last_seen_at < NOW() - make_interval(secs => $1)"
        );
        let inbox_result = sqlx::query(&inbox_sql)
            .bind(retention_secs)
            .execute(&self.pool)
            .await?;

        Ok((outbox_result.rows_affected(), inbox_result.rows_affected()))
    }

    /// Run [`Self::cleanup`] on a fixed tick until `shutdown` flips
    /// (§4.4 "a scheduled cleanup operation"). A failed sweep is logged and
    /// retried on the next tick rather than ending the loop — cleanup is
    /// housekeeping, not a correctness path.
    pub async fn run_cleanup_loop(
        &self,
        retention: Duration,
        interval: Duration,
        shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) {
        use std::sync::atomic::Ordering;

        while !shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(interval).await;
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match self.cleanup(retention).await {
                Ok((outbox_deleted, inbox_deleted)) => {
                    if outbox_deleted > 0 || inbox_deleted > 0 {
                        tracing::info!(outbox_deleted, inbox_deleted, "outbox/inbox cleanup swept rows");
                    }
                }
                Err(e) => warn!(error = %e, "outbox/inbox cleanup sweep failed, retrying next tick"),
            }
        }
    }
}

/// Default outbox/inbox retention window (§4.4: "default 30 days").
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn row_to_outbox(row: sqlx::postgres::PgRow) -> OutboxRow {
    OutboxRow {
        id: row.get("id"),
        producer_service: row.get("producer_service"),
        event_type: row.get("event_type"),
        message_body: row.get("message_body"),
        partition_key: row.get("partition_key"),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
        status: row.get("status"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_schema_identifiers() {
        assert!(validate_identifier("public").is_ok());
        assert!(validate_identifier("my_schema").is_ok());
        assert!(validate_identifier("my-schema").is_err());
        assert!(validate_identifier("1schema").is_err());
        assert!(validate_identifier("schema; DROP TABLE users;--").is_err());
    }

    #[test]
    fn outbox_status_and_inbox_status_render_expected_strings() {
        assert_eq!(OutboxStatus::Pending.as_str(), "pending");
        assert_eq!(OutboxStatus::Archived.as_str(), "archived");
        assert_eq!(InboxStatus::Processing.as_str(), "processing");
        assert_eq!(InboxStatus::Failed.as_str(), "failed");
    }
}
