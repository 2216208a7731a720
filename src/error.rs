//! Error types for mail-rules.
//!
//! Errors below the (message, rule) pair granularity (`EvaluationError`,
//! `ActionError`, per-rule `ConfigError`) are absorbed and logged by the
//! engine. Errors at cycle-resource granularity (`MailError`, store or
//! ledger unavailability) abort the cycle.

use crate::engine::cycle::CycleStage;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Message store error: {0}")]
    Store(#[from] StoreError),

    #[error("Execution ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Mail client error: {0}")]
    Mail(#[from] MailError),

    #[error("Cycle error: {0}")]
    Cycle(#[from] CycleError),
}

/// Configuration and rule-definition errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse rule definitions: {0}")]
    ParseError(String),

    #[error("Rule {rule_id}: unknown operator '{operator}'")]
    UnknownOperator { rule_id: String, operator: String },

    #[error("Rule {rule_id}: unknown action '{action}'")]
    UnknownAction { rule_id: String, action: String },

    #[error("Rule {rule_id}: unknown combinator '{combinator}'")]
    UnknownCombinator { rule_id: String, combinator: String },

    #[error("Rule {rule_id}: invalid operand for '{operator}': {reason}")]
    InvalidOperand {
        rule_id: String,
        operator: String,
        reason: String,
    },

    #[error("Invalid rule definition: {0}")]
    InvalidRule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Message store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Execution ledger errors.
///
/// On any of these, no entry of the affected batch is committed.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Execution ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Ledger batch rejected: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Condition evaluation errors. Never fatal: the condition counts as unmatched.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Field '{field}' is {actual}, operator '{operator}' expects {expected}")]
    TypeMismatch {
        field: String,
        operator: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
}

/// A single action failed for a single message.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Action {action} failed: {reason}")]
    Failed { action: String, reason: String },

    #[error("Message {message_id} not found in mailbox")]
    MessageNotFound { message_id: String },

    #[error("Mail client error: {0}")]
    Mail(#[from] MailError),
}

/// Mail source errors. All of them are cycle-level.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for MailError {
    fn from(e: std::io::Error) -> Self {
        MailError::TransientNetwork(e.to_string())
    }
}

/// Reasons a cycle ended in the `Failed` state.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("Mail fetch failed: {0}")]
    Mail(#[from] MailError),

    #[error("Rule loading failed: {0}")]
    Rules(#[from] ConfigError),

    #[error("Message store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Execution ledger failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Cycle cancelled during {stage}")]
    Cancelled { stage: CycleStage },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
