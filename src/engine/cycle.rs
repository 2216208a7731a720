//! Cycle orchestrator — one fetch → reconcile → evaluate → dispatch → commit pass.
//!
//! The orchestrator holds no state between cycles. Every (message, rule)
//! pair is dispatched only if the ledger has no record of it, and recorded
//! only after its dispatch outcome is known.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::dispatch::{ActionDispatcher, ActionExecutor, DispatchReport};
use crate::error::CycleError;
use crate::mail::MailClient;
use crate::message::{Message, RawMessage};
use crate::rules::{Rule, RuleSource, evaluator};
use crate::store::{
    ExecutionLedger, ExecutionOutcome, ExecutionRecord, MessageStore, UpsertResult,
};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Fetching,
    Reconciling,
    Evaluating,
    Dispatching,
    Committing,
    Done,
    Failed,
}

impl CycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::Reconciling => "reconciling",
            Self::Evaluating => "evaluating",
            Self::Dispatching => "dispatching",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with pairs whose dispatch keeps ending `Partial` or `Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever. `Some(n)` records the pair with its last
    /// outcome after `n` unsuccessful dispatches, so it is never retried.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self { max_attempts: None }
    }

    pub fn give_up_after(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
        }
    }
}

/// Per-cycle settings.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Upper bound passed to the mail client.
    pub max_results: usize,
    pub retry: RetryPolicy,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_results: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators used by every cycle.
pub struct CycleDeps {
    pub mail: Arc<dyn MailClient>,
    pub rules: Arc<dyn RuleSource>,
    pub store: Arc<dyn MessageStore>,
    pub ledger: Arc<dyn ExecutionLedger>,
    pub executor: Arc<dyn ActionExecutor>,
}

/// Counters for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Messages whose upsert failed this cycle.
    pub skipped: usize,
    pub rules_loaded: usize,
    pub rules_rejected: usize,
    pub pairs_evaluated: usize,
    pub matched: usize,
    /// Matches the ledger already had a record for.
    pub already_executed: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    /// Unsuccessful pairs recorded because the retry policy gave up.
    pub abandoned: usize,
    pub marked: usize,
    pub already_marked: usize,
    pub failed_batches: usize,
}

impl CycleReport {
    pub fn dispatched(&self) -> usize {
        self.succeeded + self.partial + self.failed
    }

    fn count_outcome(&mut self, outcome: ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::Success => self.succeeded += 1,
            ExecutionOutcome::Partial => self.partial += 1,
            ExecutionOutcome::Failed => self.failed += 1,
        }
    }
}

/// Matches of one rule that still need dispatching.
struct PendingBatch<'r> {
    rule: &'r Rule,
    messages: Vec<Message>,
}

/// A rule batch whose dispatch ran to completion.
struct CompletedBatch {
    rule_id: String,
    records: Vec<ExecutionRecord>,
}

/// Stage bookkeeping for one run.
struct CycleRun {
    stage: CycleStage,
    report: CycleReport,
}

impl CycleRun {
    fn advance(&mut self, next: CycleStage) {
        debug!(from = %self.stage, to = %next, "Cycle stage transition");
        self.stage = next;
    }

    /// Advance unless the cycle has been cancelled.
    fn enter(&mut self, next: CycleStage, cancel: &CancellationToken) -> Result<(), CycleError> {
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled { stage: next });
        }
        self.advance(next);
        Ok(())
    }
}

/// Runs cycles against a fixed set of collaborators.
pub struct CycleOrchestrator {
    mail: Arc<dyn MailClient>,
    rules: Arc<dyn RuleSource>,
    store: Arc<dyn MessageStore>,
    ledger: Arc<dyn ExecutionLedger>,
    dispatcher: ActionDispatcher,
    config: CycleConfig,
}

impl CycleOrchestrator {
    pub fn new(deps: CycleDeps, config: CycleConfig) -> Self {
        Self {
            mail: deps.mail,
            rules: deps.rules,
            store: deps.store,
            ledger: deps.ledger,
            dispatcher: ActionDispatcher::new(deps.executor),
            config,
        }
    }

    /// Run one full cycle.
    ///
    /// Cancellation is checked before each stage and between rule batches.
    /// Batches that finished dispatching are still committed before
    /// [`CycleError::Cancelled`] is returned.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        let cycle_id = Uuid::new_v4();
        async move {
            let started = Instant::now();
            let mut run = CycleRun {
                stage: CycleStage::Fetching,
                report: CycleReport {
                    cycle_id,
                    ..Default::default()
                },
            };

            match self.drive(&mut run, cancel).await {
                Ok(()) => {
                    run.advance(CycleStage::Done);
                    let report = run.report;
                    info!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        fetched = report.fetched,
                        inserted = report.inserted,
                        skipped = report.skipped,
                        rules = report.rules_loaded,
                        matched = report.matched,
                        dispatched = report.dispatched(),
                        marked = report.marked,
                        failed_batches = report.failed_batches,
                        "Cycle complete"
                    );
                    Ok(report)
                }
                Err(e) => {
                    let stage = run.stage;
                    run.advance(CycleStage::Failed);
                    match &e {
                        CycleError::Cancelled { .. } => {
                            info!(%stage, marked = run.report.marked, "Cycle cancelled")
                        }
                        _ => error!(%stage, error = %e, "Cycle failed"),
                    }
                    Err(e)
                }
            }
        }
        .instrument(info_span!("cycle", %cycle_id))
        .await
    }

    async fn drive(&self, run: &mut CycleRun, cancel: &CancellationToken) -> Result<(), CycleError> {
        run.enter(CycleStage::Fetching, cancel)?;
        let raw = self.mail.fetch_batch(self.config.max_results).await?;
        run.report.fetched = raw.len();

        run.enter(CycleStage::Reconciling, cancel)?;
        self.reconcile(raw, &mut run.report).await;

        run.enter(CycleStage::Evaluating, cancel)?;
        let rule_set = self.rules.load_rules().await?;
        run.report.rules_loaded = rule_set.rules.len();
        run.report.rules_rejected = rule_set.rejected.len();
        let now = Utc::now();
        let batches = self.evaluate(&rule_set.rules, now, &mut run.report).await?;

        run.enter(CycleStage::Dispatching, cancel)?;
        let (completed, interrupted) = self.dispatch(batches, cancel, &mut run.report).await;

        // Completed batches are committed even after cancellation.
        run.advance(CycleStage::Committing);
        self.commit(&completed, &mut run.report).await?;

        if interrupted {
            return Err(CycleError::Cancelled {
                stage: CycleStage::Dispatching,
            });
        }
        Ok(())
    }

    /// Upsert fetched messages. One bad message never blocks the rest.
    async fn reconcile(&self, raw: Vec<RawMessage>, report: &mut CycleReport) {
        for message in raw {
            match self.store.upsert(&message).await {
                Ok(UpsertResult::Inserted) => report.inserted += 1,
                Ok(UpsertResult::Updated) => report.updated += 1,
                Err(e) => {
                    warn!(message_id = %message.message_id, error = %e, "Skipping message");
                    report.skipped += 1;
                }
            }
        }
    }

    /// Collect, per rule, the matching messages the ledger has not seen.
    async fn evaluate<'r>(
        &self,
        rules: &'r [Rule],
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<Vec<PendingBatch<'r>>, CycleError> {
        let mut batches = Vec::new();

        for rule in rules {
            let mut candidates = self.store.query(rule.filter_hint(now));
            let mut pending = Vec::new();

            while let Some(message) = candidates.try_next().await? {
                report.pairs_evaluated += 1;
                if !evaluator::evaluate(rule, &message, now) {
                    continue;
                }
                report.matched += 1;
                if self
                    .ledger
                    .has_executed(&message.message_id, &rule.rule_id)
                    .await?
                {
                    report.already_executed += 1;
                    continue;
                }
                pending.push(message);
            }

            debug!(rule_id = %rule.rule_id, pending = pending.len(), "Rule evaluated");
            if !pending.is_empty() {
                batches.push(PendingBatch {
                    rule,
                    messages: pending,
                });
            }
        }

        Ok(batches)
    }

    /// Dispatch every pending pair, one rule batch at a time.
    ///
    /// Returns the completed batches and whether cancellation cut the
    /// stage short. A batch interrupted part-way is dropped.
    async fn dispatch(
        &self,
        batches: Vec<PendingBatch<'_>>,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> (Vec<CompletedBatch>, bool) {
        let mut completed = Vec::with_capacity(batches.len());

        for batch in batches {
            let mut records = Vec::new();
            for message in &batch.messages {
                if cancel.is_cancelled() {
                    if !records.is_empty() {
                        warn!(
                            rule_id = %batch.rule.rule_id,
                            dropped = records.len(),
                            "Discarding interrupted batch"
                        );
                    }
                    return (completed, true);
                }

                let dispatched = self.dispatcher.dispatch(message, batch.rule).await;
                report.count_outcome(dispatched.outcome);
                if let Some(record) = self
                    .settle(message, batch.rule, &dispatched, report)
                    .await
                {
                    records.push(record);
                }
            }

            completed.push(CompletedBatch {
                rule_id: batch.rule.rule_id.clone(),
                records,
            });
        }

        (completed, false)
    }

    /// Decide whether a dispatched pair goes into the ledger batch.
    async fn settle(
        &self,
        message: &Message,
        rule: &Rule,
        dispatched: &DispatchReport,
        report: &mut CycleReport,
    ) -> Option<ExecutionRecord> {
        let record = ExecutionRecord {
            message_id: message.message_id.clone(),
            rule_id: rule.rule_id.clone(),
            outcome: dispatched.outcome,
            executed_at: Utc::now(),
            actions_taken: dispatched.actions_taken(),
        };

        if dispatched.outcome == ExecutionOutcome::Success {
            return Some(record);
        }

        let limit = self.config.retry.max_attempts?;
        match self
            .ledger
            .record_failed_attempt(&message.message_id, &rule.rule_id, dispatched.outcome)
            .await
        {
            Ok(attempts) if attempts >= limit => {
                warn!(
                    message_id = %message.message_id,
                    rule_id = %rule.rule_id,
                    attempts,
                    outcome = dispatched.outcome.as_str(),
                    "Giving up on pair"
                );
                report.abandoned += 1;
                Some(record)
            }
            Ok(attempts) => {
                debug!(
                    message_id = %message.message_id,
                    rule_id = %rule.rule_id,
                    attempts,
                    "Pair will be retried"
                );
                None
            }
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    rule_id = %rule.rule_id,
                    error = %e,
                    "Failed to count dispatch attempt"
                );
                None
            }
        }
    }

    /// One atomic ledger batch per rule.
    ///
    /// A failed batch leaves its pairs unmarked for the next cycle. The
    /// cycle fails only if every attempted batch failed.
    async fn commit(
        &self,
        batches: &[CompletedBatch],
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        let mut attempted = 0;
        let mut last_error = None;

        for batch in batches.iter().filter(|b| !b.records.is_empty()) {
            attempted += 1;
            match self.ledger.bulk_mark(&batch.records).await {
                Ok(result) => {
                    report.marked += result.inserted;
                    report.already_marked += result.already_present;
                }
                Err(e) => {
                    warn!(
                        rule_id = %batch.rule_id,
                        records = batch.records.len(),
                        error = %e,
                        "Ledger batch failed, pairs will be retried"
                    );
                    report.failed_batches += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if report.failed_batches == attempted => Err(e.into()),
            _ => Ok(()),
        }
    }
}
