//! SQLite pool and schema

use crate::config::LedgerConfig;
use crate::error::LedgerResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Ledger tables, created idempotently on every start
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS designated_accounts (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        obligation_type TEXT NOT NULL,
        balance_minor_units INTEGER NOT NULL DEFAULT 0 CHECK (balance_minor_units >= 0),
        locked INTEGER NOT NULL DEFAULT 0,
        locked_at TEXT,
        last_reconciled_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (tenant_id, obligation_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS contributions (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        account_id TEXT NOT NULL REFERENCES designated_accounts(id),
        obligation_type TEXT NOT NULL,
        amount_minor_units INTEGER NOT NULL CHECK (amount_minor_units > 0),
        source TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        applied_at TEXT NOT NULL,
        UNIQUE (tenant_id, idempotency_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS idempotency_keys (
        tenant_id TEXT NOT NULL,
        key TEXT NOT NULL,
        request_hash TEXT NOT NULL,
        response_hash TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        response_payload TEXT NOT NULL,
        resource TEXT,
        resource_id TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        actor_id TEXT NOT NULL,
        action TEXT NOT NULL,
        payload TEXT NOT NULL,
        prev_hash TEXT,
        hash TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (tenant_id, seq),
        UNIQUE (tenant_id, prev_hash)
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS audit_log_no_update
    BEFORE UPDATE ON audit_log
    BEGIN
        SELECT RAISE(ABORT, 'audit_log is append-only');
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
    BEFORE DELETE ON audit_log
    BEGIN
        SELECT RAISE(ABORT, 'audit_log is append-only');
    END
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_chain_heads (
        tenant_id TEXT PRIMARY KEY,
        last_seq INTEGER NOT NULL,
        last_entry_id TEXT NOT NULL,
        last_hash TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_quarantine (
        tenant_id TEXT PRIMARY KEY,
        broken_at_entry_id TEXT,
        reason TEXT NOT NULL,
        quarantined_at TEXT NOT NULL
    )
    "#,
];

/// Open the pool described by `config` and create the schema
pub async fn connect(config: &LedgerConfig) -> LedgerResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout())
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;

    tracing::debug!(
        database_url = %config.database_url,
        max_connections = config.max_connections,
        "Ledger database ready"
    );

    Ok(pool)
}

/// Create ledger tables and triggers if they do not exist
pub async fn init_schema(pool: &SqlitePool) -> LedgerResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_creates_schema_idempotently() {
        let dir = TempDir::new().unwrap();
        let config = LedgerConfig::for_sqlite_file(dir.path().join("ledger.db"));

        let pool = connect(&config).await.unwrap();
        init_schema(&pool).await.unwrap();

        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(&pool)
            .await
            .unwrap();
        let tables: Vec<String> = rows.iter().map(|r| r.get("name")).collect();

        assert!(tables.contains(&"designated_accounts".to_string()));
        assert!(tables.contains(&"audit_log".to_string()));
        assert!(tables.contains(&"idempotency_keys".to_string()));
    }

    #[tokio::test]
    async fn test_audit_log_rejects_delete() {
        let dir = TempDir::new().unwrap();
        let pool = connect(&LedgerConfig::for_sqlite_file(dir.path().join("ledger.db")))
            .await
            .unwrap();

        sqlx::query(
            "INSERT INTO audit_log (id, tenant_id, seq, actor_id, action, payload, prev_hash, hash, created_at)
             VALUES ('e1', 'org-1', 1, 'system', 'test', '{}', NULL, 'h', '2025-03-12T00:00:00.000000Z')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let result = sqlx::query("DELETE FROM audit_log WHERE id = 'e1'")
            .execute(&pool)
            .await;
        assert!(result.is_err());
    }
}
