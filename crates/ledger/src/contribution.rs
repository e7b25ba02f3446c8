//! Contribution records - one row per applied inbound funding event

use crate::error::{LedgerError, LedgerResult};
use apgms_core::{ContributionSource, MinorUnits, ObligationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

/// An applied contribution
///
/// Exactly one exists per `(tenant_id, idempotency_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionRecord {
    pub id: String,
    pub tenant_id: String,
    pub account_id: String,
    pub obligation_type: ObligationType,
    pub amount_minor_units: MinorUnits,
    pub source: ContributionSource,
    pub idempotency_key: String,
    pub applied_at: DateTime<Utc>,
}

pub struct ContributionRepo;

impl ContributionRepo {
    pub async fn insert(conn: &mut SqliteConnection, record: &ContributionRecord) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO contributions
                (id, tenant_id, account_id, obligation_type, amount_minor_units, source,
                 idempotency_key, applied_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.account_id)
        .bind(record.obligation_type.as_str())
        .bind(record.amount_minor_units.value())
        .bind(record.source.as_str())
        .bind(&record.idempotency_key)
        .bind(record.applied_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Contributions of a tenant in the order they were applied
    pub async fn list_for_tenant(
        conn: &mut SqliteConnection,
        tenant_id: &str,
    ) -> LedgerResult<Vec<ContributionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, account_id, obligation_type, amount_minor_units, source,
                   idempotency_key, applied_at
            FROM contributions
            WHERE tenant_id = ?
            ORDER BY applied_at, rowid
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &SqliteRow) -> LedgerResult<ContributionRecord> {
    let obligation: String = row.try_get("obligation_type")?;
    let source: String = row.try_get("source")?;
    let amount: i64 = row.try_get("amount_minor_units")?;
    let corrupt = |e: &dyn std::fmt::Display| LedgerError::CorruptRecord(e.to_string());

    Ok(ContributionRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        account_id: row.try_get("account_id")?,
        obligation_type: ObligationType::parse_code(&obligation).map_err(|e| corrupt(&e))?,
        amount_minor_units: MinorUnits::new(amount).map_err(|e| corrupt(&e))?,
        source: ContributionSource::parse_code(&source).map_err(|e| corrupt(&e))?,
        idempotency_key: row.try_get("idempotency_key")?,
        applied_at: row.try_get("applied_at")?,
    })
}
