//! Action dispatch — applies a rule's actions to one message.
//!
//! Every action runs, in declared order, even after an earlier one fails.
//! The overall outcome is derived from how many succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::ActionError;
use crate::message::Message;
use crate::rules::{Action, Rule};
use crate::store::ExecutionOutcome;

/// Performs a single action against the mail source.
///
/// Implementations must be idempotent per (action, message): running the
/// same action twice leaves the mailbox as running it once.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action, message: &Message) -> Result<(), ActionError>;
}

/// Result of one action.
#[derive(Debug)]
pub struct ActionResult {
    pub action: Action,
    pub result: Result<(), ActionError>,
}

impl ActionResult {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-action results plus the overall outcome for one (message, rule) pair.
#[derive(Debug)]
pub struct DispatchReport {
    pub outcome: ExecutionOutcome,
    pub results: Vec<ActionResult>,
}

impl DispatchReport {
    /// Labels of the actions that succeeded, in order.
    pub fn actions_taken(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| r.action.label().to_string())
            .collect()
    }
}

/// Runs a rule's actions through an [`ActionExecutor`].
#[derive(Clone)]
pub struct ActionDispatcher {
    executor: Arc<dyn ActionExecutor>,
}

impl ActionDispatcher {
    pub fn new(executor: Arc<dyn ActionExecutor>) -> Self {
        Self { executor }
    }

    pub async fn dispatch(&self, message: &Message, rule: &Rule) -> DispatchReport {
        let mut results = Vec::with_capacity(rule.actions.len());

        for action in &rule.actions {
            let result = self.executor.execute(action, message).await;
            match &result {
                Ok(()) => debug!(
                    message_id = %message.message_id,
                    rule_id = %rule.rule_id,
                    action = action.label(),
                    "Action applied"
                ),
                Err(e) => warn!(
                    message_id = %message.message_id,
                    rule_id = %rule.rule_id,
                    action = action.label(),
                    error = %e,
                    "Action failed"
                ),
            }
            results.push(ActionResult {
                action: action.clone(),
                result,
            });
        }

        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        let outcome = if succeeded == results.len() {
            ExecutionOutcome::Success
        } else if succeeded > 0 {
            ExecutionOutcome::Partial
        } else {
            ExecutionOutcome::Failed
        };

        DispatchReport { outcome, results }
    }
}

/// Logs each action and reports success without touching the mailbox.
pub struct DryRunExecutor;

#[async_trait]
impl ActionExecutor for DryRunExecutor {
    async fn execute(&self, action: &Action, message: &Message) -> Result<(), ActionError> {
        info!(
            message_id = %message.message_id,
            action = ?action,
            "Dry run: would apply action"
        );
        Ok(())
    }
}
