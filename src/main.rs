use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use mail_rules::config::EngineConfig;
use mail_rules::dispatch::{ActionExecutor, DryRunExecutor};
use mail_rules::engine::{
    CycleConfig, CycleDeps, CycleOrchestrator, CycleReport, RetryPolicy, spawn_cycle_loop,
};
use mail_rules::error::Result;
use mail_rules::mail::{ImapConfig, ImapMailbox};
use mail_rules::rules::JsonRuleFile;
use mail_rules::store::{LibSqlBackend, MessageStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📬 Mail Rules v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Rules: {}", config.rules_file.display());
    if config.dry_run {
        eprintln!("   Dry run: actions are logged, not applied");
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db = open_store(&config.db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    eprintln!("   Database: {}", config.db_path.display());

    // ── Rules ────────────────────────────────────────────────────────────
    let rules = prepare_rules(&config.rules_file)
        .await
        .context("Failed to prepare rules file")?;

    // ── Mail ─────────────────────────────────────────────────────────────
    let imap_config = ImapConfig::from_env().context("IMAP is not configured")?;
    eprintln!("   Mailbox: {} on {}", imap_config.mailbox, imap_config.host);
    let mailbox = ImapMailbox::new(imap_config);
    let executor: Arc<dyn ActionExecutor> = if config.dry_run {
        Arc::new(DryRunExecutor)
    } else {
        Arc::new(mailbox.clone())
    };

    let orchestrator = Arc::new(CycleOrchestrator::new(
        CycleDeps {
            mail: Arc::new(mailbox),
            rules: Arc::new(rules),
            store: db.clone(),
            ledger: db,
            executor,
        },
        CycleConfig {
            max_results: config.max_results,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
            },
        },
    ));

    let cancel = install_signal_handler();

    if config.run_once {
        let report = run_once(&orchestrator, &cancel).await?;
        eprintln!(
            "   Cycle done: {} fetched, {} matched, {} dispatched, {} marked",
            report.fetched,
            report.matched,
            report.dispatched(),
            report.marked
        );
    } else {
        eprintln!("   Running every {}s. Ctrl+C to stop.\n", config.interval.as_secs());
        spawn_cycle_loop(orchestrator, config.interval, cancel)
            .await
            .context("Cycle loop task failed")?;
    }

    Ok(())
}

async fn open_store(path: &Path) -> Result<Arc<LibSqlBackend>> {
    let db = LibSqlBackend::new_local(path).await?;
    info!(messages = db.count().await?, "Message store ready");
    Ok(Arc::new(db))
}

async fn prepare_rules(path: &Path) -> Result<JsonRuleFile> {
    let rules = JsonRuleFile::new(path);
    if rules.write_default_if_missing().await? {
        eprintln!("   Created default rules file");
    }
    Ok(rules)
}

async fn run_once(
    orchestrator: &CycleOrchestrator,
    cancel: &CancellationToken,
) -> Result<CycleReport> {
    Ok(orchestrator.run_cycle(cancel).await?)
}

/// Console logging, plus a daily-rolling file when `log_dir` is set.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-rules.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

/// Cancel the returned token on SIGINT or SIGTERM.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
        }

        trigger.cancel();
    });

    token
}
