//! libSQL backend — implements both `MessageStore` and `ExecutionLedger`.
//!
//! Supports local file and in-memory databases. Multi-statement writes run
//! inside a transaction so each upsert and each ledger batch is atomic.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, StoreError};
use crate::message::{Attributes, Message};
use crate::store::migrations;
use crate::store::traits::{
    ExecutionLedger, ExecutionOutcome, ExecutionRecord, FilterHint, MarkResult, MessageStore,
    UpsertResult,
};

/// Rows fetched per page by [`MessageStore::query`].
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    page_size: usize,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            page_size: DEFAULT_PAGE_SIZE,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Override the query page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        // Ledger rows reference messages; enforcement is per connection.
        self.conn()
            .execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(|e| StoreError::Migration(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(self.conn()).await
    }

    /// Fetch one page of messages with ids strictly greater than `after`.
    ///
    /// Unreadable rows are skipped but still count towards the page and
    /// still advance the cursor.
    async fn fetch_page(
        &self,
        after: &str,
        hint: FilterHint,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let received_after = opt_int(hint.received_after.map(|ts| ts.timestamp_millis()));
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, attributes FROM messages
                 WHERE message_id > ?1
                   AND (?2 IS NULL OR received_at_ms IS NULL OR received_at_ms >= ?2)
                 ORDER BY message_id ASC
                 LIMIT ?3",
                params![after, received_after, limit as i64],
            )
            .await
            .map_err(|e| StoreError::Unavailable(format!("query: {e}")))?;

        let mut page = Page::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Unavailable(format!("query: {e}")))?
        {
            page.rows += 1;
            if let Ok(id) = row.get::<String>(0) {
                page.last_id = Some(id);
            }
            match row_to_message(&row) {
                Ok(msg) => page.messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(page)
    }
}

/// One keyset page: the readable messages plus the raw scan position.
#[derive(Default)]
struct Page {
    messages: Vec<Message>,
    rows: usize,
    last_id: Option<String>,
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<i64>` to libsql Value.
fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a Message. Columns: 0:message_id, 1:attributes.
fn row_to_message(row: &libsql::Row) -> Result<Message, StoreError> {
    let message_id: String = row
        .get(0)
        .map_err(|e| StoreError::Serialization(format!("message_id: {e}")))?;
    let attributes_json: String = row
        .get(1)
        .map_err(|e| StoreError::Serialization(format!("attributes: {e}")))?;
    let attributes: Attributes = serde_json::from_str(&attributes_json)
        .map_err(|e| StoreError::Serialization(format!("{message_id}: {e}")))?;
    Ok(Message {
        message_id,
        attributes,
    })
}

/// Map a libsql Row to an ExecutionRecord.
///
/// Column order matches RECORD_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<ExecutionRecord, LedgerError> {
    let col = |e: libsql::Error| LedgerError::Serialization(format!("row parse: {e}"));
    let message_id: String = row.get(0).map_err(col)?;
    let rule_id: String = row.get(1).map_err(col)?;
    let outcome_str: String = row.get(2).map_err(col)?;
    let executed_str: String = row.get(3).map_err(col)?;
    let actions_str: String = row.get(4).map_err(col)?;

    Ok(ExecutionRecord {
        message_id,
        rule_id,
        outcome: outcome_str.parse().map_err(LedgerError::Serialization)?,
        executed_at: parse_datetime(&executed_str),
        actions_taken: serde_json::from_str(&actions_str)
            .map_err(|e| LedgerError::Serialization(format!("actions_taken: {e}")))?,
    })
}

const RECORD_COLUMNS: &str = "message_id, rule_id, outcome, executed_at, actions_taken";

// ── Message store ───────────────────────────────────────────────────

#[async_trait]
impl MessageStore for LibSqlBackend {
    async fn upsert(&self, message: &Message) -> Result<UpsertResult, StoreError> {
        if message.message_id.trim().is_empty() {
            return Err(StoreError::InvalidMessage("empty message_id".into()));
        }
        let attributes = serde_json::to_string(&message.attributes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let received_at_ms = message.received_at().map(|ts| ts.timestamp_millis());
        let now = Utc::now().to_rfc3339();

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| StoreError::Unavailable(format!("upsert: {e}")))?;

        let written: Result<UpsertResult, libsql::Error> = async {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO messages
                        (message_id, attributes, received_at_ms, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![
                        message.message_id.as_str(),
                        attributes.as_str(),
                        opt_int(received_at_ms),
                        now.as_str()
                    ],
                )
                .await?;
            if inserted > 0 {
                return Ok(UpsertResult::Inserted);
            }
            tx.execute(
                "UPDATE messages SET attributes = ?2, received_at_ms = ?3, updated_at = ?4
                 WHERE message_id = ?1",
                params![
                    message.message_id.as_str(),
                    attributes.as_str(),
                    opt_int(received_at_ms),
                    now.as_str()
                ],
            )
            .await?;
            Ok(UpsertResult::Updated)
        }
        .await;

        match written {
            Ok(result) => {
                tx.commit()
                    .await
                    .map_err(|e| StoreError::Unavailable(format!("upsert commit: {e}")))?;
                debug!(message_id = %message.message_id, result = ?result, "Message upserted");
                Ok(result)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback after failed upsert also failed");
                }
                Err(StoreError::Unavailable(format!("upsert: {e}")))
            }
        }
    }

    async fn get(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, attributes FROM messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| StoreError::Unavailable(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Unavailable(format!("get: {e}"))),
        }
    }

    fn query(&self, hint: FilterHint) -> BoxStream<'_, Result<Message, StoreError>> {
        let page_size = self.page_size;
        // State: the last id seen, or `None` once a short page ends the scan.
        stream::try_unfold(Some(String::new()), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok(None);
            };
            let page = self.fetch_page(&after, hint, page_size).await?;
            let next = if page.rows < page_size {
                None
            } else {
                page.last_id
            };
            Ok(Some((stream::iter(page.messages.into_iter().map(Ok)), next)))
        })
        .try_flatten()
        .boxed()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM messages", ())
            .await
            .map_err(|e| StoreError::Unavailable(format!("count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Serialization(format!("count: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Unavailable(format!("count: {e}"))),
        }
    }
}

// ── Execution ledger ────────────────────────────────────────────────

#[async_trait]
impl ExecutionLedger for LibSqlBackend {
    async fn has_executed(&self, message_id: &str, rule_id: &str) -> Result<bool, LedgerError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM rule_executions WHERE message_id = ?1 AND rule_id = ?2 LIMIT 1",
                params![message_id, rule_id],
            )
            .await
            .map_err(|e| LedgerError::Unavailable(format!("has_executed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(LedgerError::Unavailable(format!("has_executed: {e}"))),
        }
    }

    async fn bulk_mark(&self, records: &[ExecutionRecord]) -> Result<MarkResult, LedgerError> {
        if records.is_empty() {
            return Ok(MarkResult::default());
        }

        let actions = records
            .iter()
            .map(|r| serde_json::to_string(&r.actions_taken))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LedgerError::Serialization(format!("actions_taken: {e}")))?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("bulk_mark: {e}")))?;

        let written: Result<usize, libsql::Error> = async {
            let mut inserted = 0;
            for (record, actions) in records.iter().zip(&actions) {
                inserted += tx
                    .execute(
                        "INSERT OR IGNORE INTO rule_executions
                            (message_id, rule_id, outcome, executed_at, actions_taken)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            record.message_id.as_str(),
                            record.rule_id.as_str(),
                            record.outcome.as_str(),
                            record.executed_at.to_rfc3339(),
                            actions.as_str()
                        ],
                    )
                    .await? as usize;
            }
            Ok(inserted)
        }
        .await;

        match written {
            Ok(inserted) => {
                tx.commit()
                    .await
                    .map_err(|e| LedgerError::Unavailable(format!("bulk_mark commit: {e}")))?;
                let result = MarkResult {
                    inserted,
                    already_present: records.len() - inserted,
                };
                debug!(
                    inserted = result.inserted,
                    already_present = result.already_present,
                    "Ledger batch committed"
                );
                Ok(result)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback after failed ledger batch also failed");
                }
                Err(LedgerError::Rejected(format!("bulk_mark: {e}")))
            }
        }
    }

    async fn get_record(
        &self,
        message_id: &str,
        rule_id: &str,
    ) -> Result<Option<ExecutionRecord>, LedgerError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM rule_executions WHERE message_id = ?1 AND rule_id = ?2"
                ),
                params![message_id, rule_id],
            )
            .await
            .map_err(|e| LedgerError::Unavailable(format!("get_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(LedgerError::Unavailable(format!("get_record: {e}"))),
        }
    }

    async fn record_failed_attempt(
        &self,
        message_id: &str,
        rule_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<u32, LedgerError> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO dispatch_attempts
                    (message_id, rule_id, attempts, last_outcome, last_attempt_at)
                 VALUES (?1, ?2, 1, ?3, ?4)
                 ON CONFLICT (message_id, rule_id) DO UPDATE
                    SET attempts = attempts + 1, last_outcome = ?3, last_attempt_at = ?4
                 RETURNING attempts",
                params![message_id, rule_id, outcome.as_str(), now],
            )
            .await
            .map_err(|e| LedgerError::Unavailable(format!("record_failed_attempt: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let attempts: i64 = row
                    .get(0)
                    .map_err(|e| LedgerError::Serialization(format!("attempts: {e}")))?;
                Ok(attempts.clamp(0, u32::MAX as i64) as u32)
            }
            Ok(None) => Err(LedgerError::Unavailable(
                "record_failed_attempt: no row returned".into(),
            )),
            Err(e) => Err(LedgerError::Unavailable(format!("record_failed_attempt: {e}"))),
        }
    }
}
