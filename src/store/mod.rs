//! Persistence layer — the message store and the execution ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ExecutionLedger, ExecutionOutcome, ExecutionRecord, FilterHint, MarkResult, MessageStore,
    UpsertResult,
};
