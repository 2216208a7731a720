//! Storage contracts: the Message Store and the Execution Ledger.
//!
//! Both are backend-agnostic async traits. The libSQL backend implements
//! both on one connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, StoreError};
use crate::message::Message;

/// Whether an upsert created or replaced the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Inserted,
    Updated,
}

/// Coarse pre-filter for [`MessageStore::query`].
///
/// Messages without a `received_at` timestamp always pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterHint {
    pub received_after: Option<DateTime<Utc>>,
}

/// Terminal result of dispatching one rule's actions to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Every action succeeded.
    Success,
    /// Some actions succeeded, some failed.
    Partial,
    /// No action succeeded.
    Failed,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ExecutionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown execution outcome: {other}")),
        }
    }
}

/// The fact that a rule's actions were applied to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub message_id: String,
    pub rule_id: String,
    pub outcome: ExecutionOutcome,
    pub executed_at: DateTime<Utc>,
    /// Labels of the actions that succeeded.
    pub actions_taken: Vec<String>,
}

/// Result of a [`ExecutionLedger::bulk_mark`] batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkResult {
    pub inserted: usize,
    /// Pairs that already had a record; left untouched.
    pub already_present: usize,
}

/// Durable message table keyed by the source message id.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or update one message atomically.
    async fn upsert(&self, message: &Message) -> Result<UpsertResult, StoreError>;

    /// Look up one message.
    async fn get(&self, message_id: &str) -> Result<Option<Message>, StoreError>;

    /// Lazily stream every stored message passing `hint`, ordered by id.
    ///
    /// The hint only narrows volume; callers still evaluate every message.
    fn query(&self, hint: FilterHint) -> BoxStream<'_, Result<Message, StoreError>>;

    /// Number of stored messages.
    async fn count(&self) -> Result<u64, StoreError>;
}

/// Durable record of handled (message, rule) pairs.
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Whether the pair already has a record.
    async fn has_executed(&self, message_id: &str, rule_id: &str) -> Result<bool, LedgerError>;

    /// Insert all records in one transaction. Existing pairs are skipped.
    ///
    /// On error nothing from the batch is visible.
    async fn bulk_mark(&self, records: &[ExecutionRecord]) -> Result<MarkResult, LedgerError>;

    /// Fetch the record for a pair.
    async fn get_record(
        &self,
        message_id: &str,
        rule_id: &str,
    ) -> Result<Option<ExecutionRecord>, LedgerError>;

    /// Count one more unsuccessful dispatch of the pair. Returns the new total.
    async fn record_failed_attempt(
        &self,
        message_id: &str,
        rule_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<u32, LedgerError>;
}
