//! Mail source abstraction.

pub mod imap;

use async_trait::async_trait;

use crate::error::MailError;
use crate::message::RawMessage;

pub use imap::{ImapConfig, ImapMailbox};

/// Fetches recent messages from the mail source.
///
/// Any error aborts the current cycle; nothing partial is persisted.
#[async_trait]
pub trait MailClient: Send + Sync {
    async fn fetch_batch(&self, max_results: usize) -> Result<Vec<RawMessage>, MailError>;
}
