//! End-to-end cycle scenarios against an in-memory database.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use mail_rules::dispatch::ActionExecutor;
use mail_rules::engine::{
    CycleConfig, CycleDeps, CycleOrchestrator, CycleStage, RetryPolicy,
};
use mail_rules::error::{ActionError, CycleError, LedgerError, MailError};
use mail_rules::mail::MailClient;
use mail_rules::message::{Message, RawMessage, fields};
use mail_rules::rules::{Action, Combinator, JsonRuleFile, Operator, Rule, RuleSource, StaticRules};
use mail_rules::store::{
    ExecutionLedger, ExecutionOutcome, ExecutionRecord, LibSqlBackend, MarkResult, MessageStore,
};

// ── Fakes ───────────────────────────────────────────────────────────

/// Serves a fixed batch, or fails when `fail` is set.
struct FakeMail {
    batch: Mutex<Vec<RawMessage>>,
    fail: AtomicBool,
    calls: Mutex<usize>,
}

impl FakeMail {
    fn new(batch: Vec<RawMessage>) -> Arc<Self> {
        Arc::new(Self {
            batch: Mutex::new(batch),
            fail: AtomicBool::new(false),
            calls: Mutex::new(0),
        })
    }

    fn set_batch(&self, batch: Vec<RawMessage>) {
        *self.batch.lock().unwrap() = batch;
    }
}

#[async_trait]
impl MailClient for FakeMail {
    async fn fetch_batch(&self, max_results: usize) -> Result<Vec<RawMessage>, MailError> {
        *self.calls.lock().unwrap() += 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(MailError::Auth("bad credentials".into()));
        }
        Ok(self
            .batch
            .lock()
            .unwrap()
            .iter()
            .take(max_results)
            .cloned()
            .collect())
    }
}

/// Records (message_id, action) calls; fails actions whose label is listed.
#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<&'static str>>,
    cancel_on_call: Mutex<Option<CancellationToken>>,
    last_call_at: Mutex<Option<DateTime<Utc>>>,
}

impl RecordingExecutor {
    fn failing(labels: &[&'static str]) -> Arc<Self> {
        let exec = Self::default();
        exec.failing.lock().unwrap().extend(labels.iter().copied());
        Arc::new(exec)
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, message_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == message_id)
            .count()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, action: &Action, message: &Message) -> Result<(), ActionError> {
        self.calls
            .lock()
            .unwrap()
            .push((message.message_id.clone(), action.label().to_string()));
        *self.last_call_at.lock().unwrap() = Some(Utc::now());
        if let Some(token) = self.cancel_on_call.lock().unwrap().as_ref() {
            token.cancel();
        }
        if self.failing.lock().unwrap().contains(action.label()) {
            return Err(ActionError::Failed {
                action: action.label().into(),
                reason: "simulated".into(),
            });
        }
        Ok(())
    }
}

/// Delegates to the real ledger but can reject every batch.
struct FlakyLedger {
    inner: Arc<LibSqlBackend>,
    reject_marks: AtomicBool,
}

#[async_trait]
impl ExecutionLedger for FlakyLedger {
    async fn has_executed(&self, message_id: &str, rule_id: &str) -> Result<bool, LedgerError> {
        self.inner.has_executed(message_id, rule_id).await
    }

    async fn bulk_mark(&self, records: &[ExecutionRecord]) -> Result<MarkResult, LedgerError> {
        if self.reject_marks.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("disk full".into()));
        }
        self.inner.bulk_mark(records).await
    }

    async fn get_record(
        &self,
        message_id: &str,
        rule_id: &str,
    ) -> Result<Option<ExecutionRecord>, LedgerError> {
        self.inner.get_record(message_id, rule_id).await
    }

    async fn record_failed_attempt(
        &self,
        message_id: &str,
        rule_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<u32, LedgerError> {
        self.inner
            .record_failed_attempt(message_id, rule_id, outcome)
            .await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn message(id: &str, sender: &str) -> RawMessage {
    Message::new(id)
        .with(fields::SENDER, sender)
        .with(fields::LABELS, BTreeSet::<String>::new())
        .with(fields::RECEIVED_AT, Utc::now() - Duration::hours(1))
}

fn processed_rule() -> Rule {
    Rule::new("rule1", Combinator::All)
        .with_condition(fields::SENDER, Operator::Equals("a@x.com".into()))
        .with_action(Action::AddLabel {
            label: "processed".into(),
        })
}

struct Harness {
    db: Arc<LibSqlBackend>,
    mail: Arc<FakeMail>,
    executor: Arc<RecordingExecutor>,
    orchestrator: CycleOrchestrator,
}

async fn harness_with(
    batch: Vec<RawMessage>,
    rules: Arc<dyn RuleSource>,
    executor: Arc<RecordingExecutor>,
    retry: RetryPolicy,
) -> Harness {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mail = FakeMail::new(batch);
    let orchestrator = CycleOrchestrator::new(
        CycleDeps {
            mail: mail.clone(),
            rules,
            store: db.clone(),
            ledger: db.clone(),
            executor: executor.clone(),
        },
        CycleConfig {
            max_results: 100,
            retry,
        },
    );
    Harness {
        db,
        mail,
        executor,
        orchestrator,
    }
}

async fn harness(batch: Vec<RawMessage>, rules: Vec<Rule>) -> Harness {
    harness_with(
        batch,
        Arc::new(StaticRules(rules)),
        Arc::new(RecordingExecutor::default()),
        RetryPolicy::default(),
    )
    .await
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn matching_pair_runs_once_across_cycles() {
    let h = harness(vec![message("m1", "a@x.com")], vec![processed_rule()]).await;
    let cancel = CancellationToken::new();

    let first = h.orchestrator.run_cycle(&cancel).await.unwrap();
    assert_eq!(first.fetched, 1);
    assert_eq!(first.inserted, 1);
    assert_eq!(first.matched, 1);
    assert_eq!(first.succeeded, 1);
    assert_eq!(first.marked, 1);

    let record = h.db.get_record("m1", "rule1").await.unwrap().unwrap();
    assert_eq!(record.outcome, ExecutionOutcome::Success);
    assert_eq!(record.actions_taken, vec!["add_label".to_string()]);
    let acted_at = h.executor.last_call_at.lock().unwrap().expect("executor was called");
    assert!(record.executed_at >= acted_at);

    let second = h.orchestrator.run_cycle(&cancel).await.unwrap();
    assert_eq!(second.updated, 1);
    assert_eq!(second.matched, 1);
    assert_eq!(second.already_executed, 1);
    assert_eq!(second.dispatched(), 0);

    assert_eq!(
        h.executor.calls(),
        vec![("m1".to_string(), "add_label".to_string())]
    );
}

#[tokio::test]
async fn non_matching_message_never_recorded() {
    let h = harness(vec![message("m2", "b@x.com")], vec![processed_rule()]).await;
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let report = h.orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(report.matched, 0);
    }
    assert!(!h.db.has_executed("m2", "rule1").await.unwrap());
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn empty_condition_rule_matches_nothing() {
    let rule = Rule::new("noop", Combinator::Any).with_action(Action::MarkAsRead);
    let h = harness(vec![message("m1", "a@x.com")], vec![rule]).await;

    let report = h
        .orchestrator
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.pairs_evaluated, 1);
    assert_eq!(report.matched, 0);
}

#[tokio::test]
async fn mail_failure_fails_cycle_without_progress() {
    let h = harness(vec![message("m1", "a@x.com")], vec![processed_rule()]).await;
    h.mail.fail.store(true, Ordering::SeqCst);

    let err = h
        .orchestrator
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::Mail(MailError::Auth(_))));
    assert_eq!(h.db.count().await.unwrap(), 0);
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn rejected_ledger_batch_is_retried_next_cycle() {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let ledger = Arc::new(FlakyLedger {
        inner: db.clone(),
        reject_marks: AtomicBool::new(true),
    });
    let executor = Arc::new(RecordingExecutor::default());
    let orchestrator = CycleOrchestrator::new(
        CycleDeps {
            mail: FakeMail::new(vec![message("m1", "a@x.com")]),
            rules: Arc::new(StaticRules(vec![processed_rule()])),
            store: db.clone(),
            ledger: ledger.clone(),
            executor: executor.clone(),
        },
        CycleConfig::default(),
    );
    let cancel = CancellationToken::new();

    let err = orchestrator.run_cycle(&cancel).await.unwrap_err();
    assert!(matches!(err, CycleError::Ledger(_)));
    assert!(!db.has_executed("m1", "rule1").await.unwrap());

    ledger.reject_marks.store(false, Ordering::SeqCst);
    let report = orchestrator.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.marked, 1);
    assert!(db.has_executed("m1", "rule1").await.unwrap());
    // Dispatched again because the first commit never landed.
    assert_eq!(executor.calls_for("m1"), 2);
}

#[tokio::test]
async fn partial_outcome_is_retried_without_ledger_entry() {
    let rule = processed_rule().with_action(Action::MoveMessage {
        mailbox: "Archive".into(),
    });
    let h = harness_with(
        vec![message("m1", "a@x.com")],
        Arc::new(StaticRules(vec![rule])),
        RecordingExecutor::failing(&["move_message"]),
        RetryPolicy::unlimited(),
    )
    .await;
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let report = h.orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(report.partial, 1);
        assert_eq!(report.marked, 0);
    }
    assert!(!h.db.has_executed("m1", "rule1").await.unwrap());
    // Both actions attempted on every cycle.
    assert_eq!(h.executor.calls_for("m1"), 6);
}

#[tokio::test]
async fn retry_policy_gives_up_after_limit() {
    let h = harness_with(
        vec![message("m1", "a@x.com")],
        Arc::new(StaticRules(vec![processed_rule()])),
        RecordingExecutor::failing(&["add_label"]),
        RetryPolicy::give_up_after(2),
    )
    .await;
    let cancel = CancellationToken::new();

    let first = h.orchestrator.run_cycle(&cancel).await.unwrap();
    assert_eq!((first.failed, first.abandoned, first.marked), (1, 0, 0));

    let second = h.orchestrator.run_cycle(&cancel).await.unwrap();
    assert_eq!((second.failed, second.abandoned, second.marked), (1, 1, 1));

    let record = h.db.get_record("m1", "rule1").await.unwrap().unwrap();
    assert_eq!(record.outcome, ExecutionOutcome::Failed);
    assert!(record.actions_taken.is_empty());

    let third = h.orchestrator.run_cycle(&cancel).await.unwrap();
    assert_eq!(third.dispatched(), 0);
    assert_eq!(h.executor.calls_for("m1"), 2);
}

#[tokio::test]
async fn cancelled_before_start_touches_nothing() {
    let h = harness(vec![message("m1", "a@x.com")], vec![processed_rule()]).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.orchestrator.run_cycle(&cancel).await.unwrap_err();
    assert!(matches!(
        err,
        CycleError::Cancelled {
            stage: CycleStage::Fetching
        }
    ));
    assert_eq!(*h.mail.calls.lock().unwrap(), 0);
    assert_eq!(h.db.count().await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_mid_dispatch_commits_finished_batches_only() {
    let second_rule = Rule::new("rule2", Combinator::All)
        .with_condition(fields::SENDER, Operator::Contains("x.com".into()))
        .with_action(Action::MarkAsRead);
    let h = harness(
        vec![message("m1", "a@x.com")],
        vec![processed_rule(), second_rule],
    )
    .await;
    let cancel = CancellationToken::new();
    *h.executor.cancel_on_call.lock().unwrap() = Some(cancel.clone());

    let err = h.orchestrator.run_cycle(&cancel).await.unwrap_err();
    assert!(matches!(
        err,
        CycleError::Cancelled {
            stage: CycleStage::Dispatching
        }
    ));
    // rule1's batch finished before the token was observed; rule2 never ran.
    assert!(h.db.has_executed("m1", "rule1").await.unwrap());
    assert!(!h.db.has_executed("m1", "rule2").await.unwrap());
    assert_eq!(h.executor.calls().len(), 1);
}

#[tokio::test]
async fn cancellation_part_way_through_a_batch_discards_it() {
    let h = harness(
        vec![message("m1", "a@x.com"), message("m2", "a@x.com")],
        vec![processed_rule()],
    )
    .await;
    let cancel = CancellationToken::new();
    *h.executor.cancel_on_call.lock().unwrap() = Some(cancel.clone());

    let err = h.orchestrator.run_cycle(&cancel).await.unwrap_err();
    assert!(matches!(
        err,
        CycleError::Cancelled {
            stage: CycleStage::Dispatching
        }
    ));
    // m1 was dispatched, but its batch never finished, so nothing is recorded.
    assert_eq!(h.executor.calls().len(), 1);
    assert!(!h.db.has_executed("m1", "rule1").await.unwrap());
    assert!(!h.db.has_executed("m2", "rule1").await.unwrap());
}

#[tokio::test]
async fn unstorable_message_is_skipped_without_failing_cycle() {
    let h = harness(
        vec![message("", "a@x.com"), message("m1", "a@x.com")],
        vec![processed_rule()],
    )
    .await;

    let report = h
        .orchestrator
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.matched, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.marked, 1);
    assert!(h.db.has_executed("m1", "rule1").await.unwrap());
    assert_eq!(h.db.count().await.unwrap(), 1);
}

#[tokio::test]
async fn malformed_rule_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    std::fs::write(
        &path,
        r#"[
            {"id": "bad", "predicate": "all",
             "conditions": [{"field": "from", "predicate": "sounds_like", "value": "a"}],
             "actions": [{"type": "mark_as_read"}]},
            {"id": "rule1", "predicate": "all",
             "conditions": [{"field": "from", "predicate": "equals", "value": "A@X.COM"}],
             "actions": [{"type": "mark_as_read"}]}
        ]"#,
    )
    .unwrap();

    let h = harness_with(
        vec![message("m1", "a@x.com")],
        Arc::new(JsonRuleFile::new(&path)),
        Arc::new(RecordingExecutor::default()),
        RetryPolicy::default(),
    )
    .await;

    let report = h
        .orchestrator
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.rules_loaded, 1);
    assert_eq!(report.rules_rejected, 1);
    assert_eq!(report.marked, 1);
    assert!(h.db.has_executed("m1", "rule1").await.unwrap());
}

#[tokio::test]
async fn unreadable_rules_file_fails_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with(
        vec![message("m1", "a@x.com")],
        Arc::new(JsonRuleFile::new(dir.path().join("missing.json"))),
        Arc::new(RecordingExecutor::default()),
        RetryPolicy::default(),
    )
    .await;

    let err = h
        .orchestrator
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::Rules(_)));
    // Reconciling already ran.
    assert_eq!(h.db.count().await.unwrap(), 1);
}

#[tokio::test]
async fn stored_messages_are_evaluated_after_they_leave_the_batch() {
    let h = harness(vec![message("m1", "b@x.com")], vec![processed_rule()]).await;
    let cancel = CancellationToken::new();
    h.orchestrator.run_cycle(&cancel).await.unwrap();

    // m3 arrives; m1 is no longer fetched but stays in the store.
    h.mail.set_batch(vec![message("m3", "a@x.com")]);
    let report = h.orchestrator.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.pairs_evaluated, 2);
    assert_eq!(report.marked, 1);
    assert!(h.db.has_executed("m3", "rule1").await.unwrap());
}

#[tokio::test]
async fn age_condition_filters_old_messages() {
    let old = Message::new("old")
        .with(fields::SENDER, "a@x.com")
        .with(fields::RECEIVED_AT, Utc::now() - Duration::days(40));
    let rule = processed_rule().with_condition(fields::RECEIVED_AT, Operator::LessThanDays(7));
    let h = harness(vec![old, message("new", "a@x.com")], vec![rule]).await;

    let report = h
        .orchestrator
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.matched, 1);
    assert!(h.db.has_executed("new", "rule1").await.unwrap());
    assert!(!h.db.has_executed("old", "rule1").await.unwrap());
}
