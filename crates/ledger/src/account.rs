//! Designated account repository
//!
//! The only code that writes `designated_accounts`. All functions run on a
//! caller-supplied connection so they compose into one transaction.

use crate::error::{LedgerError, LedgerResult};
use apgms_core::{DesignatedAccount, MinorUnits, ObligationType};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

const SELECT_ACCOUNT: &str = r#"
    SELECT id, tenant_id, obligation_type, balance_minor_units, locked, locked_at,
           last_reconciled_at, created_at, updated_at
    FROM designated_accounts
"#;

pub struct AccountRepo;

impl AccountRepo {
    /// Fetch the account for `(tenant_id, obligation)`, creating it with a zero
    /// balance if this is the first time the pair is seen
    pub async fn get_or_create(
        conn: &mut SqliteConnection,
        tenant_id: &str,
        obligation: ObligationType,
    ) -> LedgerResult<DesignatedAccount> {
        let now = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO designated_accounts
                (id, tenant_id, obligation_type, balance_minor_units, locked, created_at, updated_at)
            VALUES (?, ?, ?, 0, 0, ?, ?)
            ON CONFLICT (tenant_id, obligation_type) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(obligation.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        if inserted.rows_affected() > 0 {
            tracing::info!(tenant_id, obligation = %obligation, "Designated account created");
        }

        Self::find(conn, tenant_id, obligation).await?.ok_or_else(|| {
            LedgerError::CorruptRecord(format!(
                "account {}/{} missing after upsert",
                tenant_id, obligation
            ))
        })
    }

    pub async fn find(
        conn: &mut SqliteConnection,
        tenant_id: &str,
        obligation: ObligationType,
    ) -> LedgerResult<Option<DesignatedAccount>> {
        let sql = format!("{} WHERE tenant_id = ? AND obligation_type = ?", SELECT_ACCOUNT);
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(obligation.as_str())
            .fetch_optional(&mut *conn)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    /// All accounts of a tenant, ordered by obligation type
    pub async fn list_for_tenant(
        conn: &mut SqliteConnection,
        tenant_id: &str,
    ) -> LedgerResult<Vec<DesignatedAccount>> {
        let sql = format!("{} WHERE tenant_id = ? ORDER BY obligation_type", SELECT_ACCOUNT);
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_all(&mut *conn)
            .await?;

        rows.iter().map(account_from_row).collect()
    }

    /// Every tenant that owns at least one designated account
    pub async fn tenants(conn: &mut SqliteConnection) -> LedgerResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT tenant_id FROM designated_accounts ORDER BY tenant_id")
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows.iter().map(|row| row.get("tenant_id")).collect())
    }

    /// Increase the balance by `amount`
    ///
    /// This is the only balance-increasing primitive. The addition happens in
    /// the `UPDATE` itself, so concurrent callers cannot lose an update even
    /// without the account lock; a row that would pass `i64::MAX` is left
    /// untouched and reported as an overflow.
    pub async fn apply_delta(
        conn: &mut SqliteConnection,
        tenant_id: &str,
        obligation: ObligationType,
        amount: MinorUnits,
    ) -> LedgerResult<DesignatedAccount> {
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount(0));
        }

        let account = Self::get_or_create(conn, tenant_id, obligation).await?;
        let row = sqlx::query(
            r#"
            UPDATE designated_accounts
            SET balance_minor_units = balance_minor_units + ?, updated_at = ?
            WHERE id = ? AND balance_minor_units <= ?
            RETURNING id, tenant_id, obligation_type, balance_minor_units, locked, locked_at,
                      last_reconciled_at, created_at, updated_at
            "#,
        )
        .bind(amount.value())
        .bind(Utc::now())
        .bind(&account.id)
        .bind(i64::MAX - amount.value())
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => account_from_row(&row),
            None => Err(LedgerError::BalanceOverflow(account.id)),
        }
    }

    /// Set the lock flag; a no-op (timestamps untouched) when it already has
    /// that value
    pub async fn set_locked(
        conn: &mut SqliteConnection,
        tenant_id: &str,
        obligation: ObligationType,
        locked: bool,
    ) -> LedgerResult<DesignatedAccount> {
        let mut account = Self::get_or_create(conn, tenant_id, obligation).await?;
        if account.locked == locked {
            return Ok(account);
        }

        let now = Utc::now();
        let locked_at = locked.then_some(now);

        sqlx::query(
            "UPDATE designated_accounts SET locked = ?, locked_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(locked)
        .bind(locked_at)
        .bind(now)
        .bind(&account.id)
        .execute(&mut *conn)
        .await?;

        account.locked = locked;
        account.locked_at = locked_at;
        account.updated_at = now;
        Ok(account)
    }

    /// Record that the account was compared against the bank at `at`
    pub async fn mark_reconciled(
        conn: &mut SqliteConnection,
        account_id: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        sqlx::query("UPDATE designated_accounts SET last_reconciled_at = ? WHERE id = ?")
            .bind(at)
            .bind(account_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

fn account_from_row(row: &SqliteRow) -> LedgerResult<DesignatedAccount> {
    let obligation: String = row.try_get("obligation_type")?;
    let balance: i64 = row.try_get("balance_minor_units")?;

    Ok(DesignatedAccount {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        obligation_type: ObligationType::parse_code(&obligation)
            .map_err(|e| LedgerError::CorruptRecord(e.to_string()))?,
        balance_minor_units: MinorUnits::new(balance)
            .map_err(|e| LedgerError::CorruptRecord(e.to_string()))?,
        locked: row.try_get("locked")?,
        locked_at: row.try_get("locked_at")?,
        last_reconciled_at: row.try_get("last_reconciled_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
