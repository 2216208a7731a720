//! Schema migrations for the libSQL backend.
//!
//! Applied versions are recorded in `_migrations`; only versions above the
//! recorded maximum run.

use libsql::Connection;

use crate::error::StoreError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "messages_and_ledger",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                attributes TEXT NOT NULL,
                received_at_ms INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_received_at ON messages(received_at_ms);

            CREATE TABLE IF NOT EXISTS rule_executions (
                message_id TEXT NOT NULL REFERENCES messages(message_id),
                rule_id TEXT NOT NULL,
                outcome TEXT NOT NULL CHECK (outcome IN ('success', 'partial', 'failed')),
                executed_at TEXT NOT NULL,
                actions_taken TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (message_id, rule_id)
            );
            CREATE INDEX IF NOT EXISTS idx_rule_executions_rule ON rule_executions(rule_id);
        "#,
    },
    Migration {
        version: 2,
        name: "dispatch_attempts",
        sql: r#"
            CREATE TABLE IF NOT EXISTS dispatch_attempts (
                message_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_outcome TEXT NOT NULL,
                last_attempt_at TEXT NOT NULL,
                PRIMARY KEY (message_id, rule_id)
            );
        "#,
    },
];

/// Bring the schema up to the latest version.
///
/// Each pending migration and its `_migrations` row are applied in one
/// transaction, so a failed step leaves the previous version intact.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| StoreError::Migration(format!("_migrations table: {e}")))?;

    let applied = current_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        apply(conn, migration).await?;
    }
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), StoreError> {
    let fail = |e: libsql::Error| {
        StoreError::Migration(format!("V{} ({}): {e}", migration.version, migration.name))
    };

    tracing::info!(
        version = migration.version,
        name = migration.name,
        "Applying migration"
    );

    let tx = conn.transaction().await.map_err(fail)?;
    if let Err(e) = tx.execute_batch(migration.sql).await {
        let _ = tx.rollback().await;
        return Err(fail(e));
    }
    if let Err(e) = tx
        .execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
    {
        let _ = tx.rollback().await;
        return Err(fail(e));
    }
    tx.commit().await.map_err(fail)
}

/// Highest applied version, 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let read = |e: libsql::Error| StoreError::Migration(format!("reading schema version: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}
