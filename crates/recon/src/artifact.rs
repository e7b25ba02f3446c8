//! Reconciliation artifacts - immutable, hashed output of one run per tenant

use apgms_core::ObligationType;
use apgms_ledger::hash::{canonical_json, sha256_hex};
use apgms_ledger::{LedgerError, LedgerResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use strum_macros::{Display, EnumString};

/// Outcome of comparing the ledger with the bank
///
/// Ordered by severity: a shortfall outranks a surplus, which outranks balanced.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    Balanced,
    /// Bank holds more than the ledger records; harmless
    Surplus,
    /// Ledger believes it holds more than the bank shows
    Shortfall,
}

impl ReconciliationStatus {
    /// Status for `discrepancy = external - internal`
    pub fn from_discrepancy(discrepancy: i64) -> Self {
        match discrepancy {
            0 => ReconciliationStatus::Balanced,
            d if d < 0 => ReconciliationStatus::Shortfall,
            _ => ReconciliationStatus::Surplus,
        }
    }
}

/// One designated account's comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationLine {
    pub account_id: String,
    pub obligation_type: ObligationType,
    pub internal_balance_minor_units: i64,
    pub external_balance_minor_units: i64,
    pub discrepancy_minor_units: i64,
    pub status: ReconciliationStatus,
}

impl ReconciliationLine {
    pub fn new(
        account_id: impl Into<String>,
        obligation_type: ObligationType,
        internal: i64,
        external: i64,
    ) -> LedgerResult<Self> {
        let account_id = account_id.into();
        let discrepancy = external
            .checked_sub(internal)
            .ok_or_else(|| LedgerError::BalanceOverflow(account_id.clone()))?;

        Ok(Self {
            account_id,
            obligation_type,
            internal_balance_minor_units: internal,
            external_balance_minor_units: external,
            discrepancy_minor_units: discrepancy,
            status: ReconciliationStatus::from_discrepancy(discrepancy),
        })
    }
}

/// A tenant's reconciliation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationArtifact {
    pub id: String,
    pub run_id: String,
    pub tenant_id: String,
    pub as_of_date: NaiveDate,
    pub internal_balance_minor_units: i64,
    pub external_balance_minor_units: i64,
    pub discrepancy_minor_units: i64,
    /// Worst line status; never netted across obligations
    pub status: ReconciliationStatus,
    pub lines: Vec<ReconciliationLine>,
    pub generated_at: DateTime<Utc>,
    /// SHA-256 over the canonical serialization of every other field
    pub sha256: String,
}

impl ReconciliationArtifact {
    /// Assemble an artifact from its lines and seal it with its digest
    pub fn build(
        id: String,
        run_id: String,
        tenant_id: String,
        lines: Vec<ReconciliationLine>,
        generated_at: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        let overflow = || LedgerError::BalanceOverflow(format!("tenant {} totals", tenant_id));
        let mut internal: i64 = 0;
        let mut external: i64 = 0;
        for line in &lines {
            internal = internal
                .checked_add(line.internal_balance_minor_units)
                .ok_or_else(overflow)?;
            external = external
                .checked_add(line.external_balance_minor_units)
                .ok_or_else(overflow)?;
        }
        let discrepancy = external.checked_sub(internal).ok_or_else(overflow)?;

        let status = lines
            .iter()
            .map(|l| l.status)
            .max()
            .unwrap_or(ReconciliationStatus::Balanced);

        let mut artifact = Self {
            id,
            run_id,
            as_of_date: generated_at.date_naive(),
            tenant_id,
            internal_balance_minor_units: internal,
            external_balance_minor_units: external,
            discrepancy_minor_units: discrepancy,
            status,
            lines,
            generated_at,
            sha256: String::new(),
        };
        artifact.sha256 = artifact.compute_digest()?;
        Ok(artifact)
    }

    /// Digest of the artifact with the `sha256` field left out
    pub fn compute_digest(&self) -> LedgerResult<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(fields) = value.as_object_mut() {
            fields.remove("sha256");
        }
        Ok(sha256_hex(canonical_json(&value)))
    }

    /// True when the stored digest matches the contents
    pub fn verify_digest(&self) -> bool {
        self.compute_digest().map_or(false, |digest| digest == self.sha256)
    }

    /// Lines that need attention (shortfalls)
    pub fn shortfall_lines(&self) -> impl Iterator<Item = &ReconciliationLine> {
        self.lines
            .iter()
            .filter(|l| l.status == ReconciliationStatus::Shortfall)
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS reconciliation_artifacts (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        as_of_date TEXT NOT NULL,
        internal_balance_minor_units INTEGER NOT NULL,
        external_balance_minor_units INTEGER NOT NULL,
        discrepancy_minor_units INTEGER NOT NULL,
        status TEXT NOT NULL,
        lines TEXT NOT NULL,
        sha256 TEXT NOT NULL,
        generated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_reconciliation_artifacts_tenant_date
    ON reconciliation_artifacts(tenant_id, as_of_date)
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS reconciliation_artifacts_no_update
    BEFORE UPDATE ON reconciliation_artifacts
    BEGIN
        SELECT RAISE(ABORT, 'reconciliation artifacts are immutable');
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS reconciliation_artifacts_no_delete
    BEFORE DELETE ON reconciliation_artifacts
    BEGIN
        SELECT RAISE(ABORT, 'reconciliation artifacts are immutable');
    END
    "#,
];

const SELECT_ARTIFACT: &str = r#"
    SELECT id, run_id, tenant_id, as_of_date, internal_balance_minor_units,
           external_balance_minor_units, discrepancy_minor_units, status, lines,
           sha256, generated_at
    FROM reconciliation_artifacts
"#;

pub struct ArtifactRepo;

impl ArtifactRepo {
    /// Create the artifact table if it does not exist
    pub async fn init(pool: &SqlitePool) -> LedgerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    pub async fn insert(conn: &mut SqliteConnection, artifact: &ReconciliationArtifact) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_artifacts
                (id, run_id, tenant_id, as_of_date, internal_balance_minor_units,
                 external_balance_minor_units, discrepancy_minor_units, status, lines,
                 sha256, generated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&artifact.id)
        .bind(&artifact.run_id)
        .bind(&artifact.tenant_id)
        .bind(artifact.as_of_date)
        .bind(artifact.internal_balance_minor_units)
        .bind(artifact.external_balance_minor_units)
        .bind(artifact.discrepancy_minor_units)
        .bind(artifact.status.to_string())
        .bind(serde_json::to_string(&artifact.lines)?)
        .bind(&artifact.sha256)
        .bind(artifact.generated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Artifacts of a tenant for one day, oldest first
    pub async fn find(
        pool: &SqlitePool,
        tenant_id: &str,
        as_of_date: NaiveDate,
    ) -> LedgerResult<Vec<ReconciliationArtifact>> {
        let sql = format!(
            "{} WHERE tenant_id = ? AND as_of_date = ? ORDER BY generated_at, rowid",
            SELECT_ARTIFACT
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(as_of_date)
            .fetch_all(pool)
            .await?;

        rows.iter().map(artifact_from_row).collect()
    }

    /// Most recent artifact of a tenant
    pub async fn latest(pool: &SqlitePool, tenant_id: &str) -> LedgerResult<Option<ReconciliationArtifact>> {
        let sql = format!(
            "{} WHERE tenant_id = ? ORDER BY generated_at DESC, rowid DESC LIMIT 1",
            SELECT_ARTIFACT
        );
        let row = sqlx::query(&sql).bind(tenant_id).fetch_optional(pool).await?;

        row.as_ref().map(artifact_from_row).transpose()
    }
}

fn artifact_from_row(row: &SqliteRow) -> LedgerResult<ReconciliationArtifact> {
    let status: String = row.try_get("status")?;
    let lines: String = row.try_get("lines")?;

    Ok(ReconciliationArtifact {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        tenant_id: row.try_get("tenant_id")?,
        as_of_date: row.try_get("as_of_date")?,
        internal_balance_minor_units: row.try_get("internal_balance_minor_units")?,
        external_balance_minor_units: row.try_get("external_balance_minor_units")?,
        discrepancy_minor_units: row.try_get("discrepancy_minor_units")?,
        status: status
            .parse()
            .map_err(|_| LedgerError::CorruptRecord(format!("reconciliation status {}", status)))?,
        lines: serde_json::from_str(&lines)?,
        sha256: row.try_get("sha256")?,
        generated_at: row.try_get("generated_at")?,
    })
}
