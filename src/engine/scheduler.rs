//! Fixed-interval scheduling for the cycle orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::cycle::CycleOrchestrator;

/// Shortest interval the loop accepts; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn a task that runs a cycle now and then every `interval`.
///
/// Each cycle is awaited before the next tick, so cycles never overlap. A
/// failed cycle is already logged by the orchestrator; the loop just waits
/// for the next tick. Cancelling `cancel` stops the loop and also interrupts
/// a running cycle.
pub fn spawn_cycle_loop(
    orchestrator: Arc<CycleOrchestrator>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = interval.max(MIN_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Cycle loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Ok(report) = orchestrator.run_cycle(&cancel).await {
                debug!(cycle_id = %report.cycle_id, "Scheduled cycle finished");
            }
        }

        info!("Cycle loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::dispatch::DryRunExecutor;
    use crate::engine::cycle::{CycleConfig, CycleDeps};
    use crate::error::MailError;
    use crate::mail::MailClient;
    use crate::message::RawMessage;
    use crate::rules::StaticRules;
    use crate::store::LibSqlBackend;

    struct CountingMail(AtomicUsize);

    #[async_trait]
    impl MailClient for CountingMail {
        async fn fetch_batch(&self, _max_results: usize) -> Result<Vec<RawMessage>, MailError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    async fn orchestrator(mail: Arc<CountingMail>) -> Arc<CycleOrchestrator> {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Arc::new(CycleOrchestrator::new(
            CycleDeps {
                mail,
                rules: Arc::new(StaticRules(Vec::new())),
                store: db.clone(),
                ledger: db,
                executor: Arc::new(DryRunExecutor),
            },
            CycleConfig::default(),
        ))
    }

    #[tokio::test]
    async fn runs_immediately_and_stops_on_cancel() {
        let mail = Arc::new(CountingMail(AtomicUsize::new(0)));
        let orchestrator = orchestrator(mail.clone()).await;

        let cancel = CancellationToken::new();
        let handle = spawn_cycle_loop(orchestrator, Duration::from_secs(3600), cancel.clone());

        for _ in 0..100 {
            if mail.0.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mail.0.load(Ordering::SeqCst), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn zero_interval_does_not_panic() {
        let mail = Arc::new(CountingMail(AtomicUsize::new(0)));
        let orchestrator = orchestrator(mail.clone()).await;

        let cancel = CancellationToken::new();
        let handle = spawn_cycle_loop(orchestrator, Duration::ZERO, cancel.clone());

        for _ in 0..100 {
            if mail.0.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mail.0.load(Ordering::SeqCst), 1);
    }
}
