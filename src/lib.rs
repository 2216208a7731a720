//! Rule matching and idempotent action execution for a mailbox.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod mail;
pub mod message;
pub mod rules;
pub mod store;
