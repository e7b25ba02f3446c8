//! Audit chain - per-tenant, append-only, hash-linked log
//!
//! # Invariants
//! - `hash = H(prev_hash ‖ canonical(record))`; `prev_hash` is null only for seq 1
//! - `audit_chain_heads` names the latest entry, so trailing deletions are visible
//! - A tenant whose chain fails a check is quarantined and refuses appends
//!   until an operator releases it

use crate::error::{LedgerError, LedgerResult};
use crate::hash::{calculate_entry_hash, canonical_json, entry_hash, format_timestamp, verify_chain};
use crate::locks::LedgerLocks;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

/// Audit actions written by the ledger
pub mod actions {
    pub const CONTRIBUTION_APPLIED: &str = "contribution.applied";
    pub const ACCOUNT_LOCKED: &str = "account.locked_true";
    pub const ACCOUNT_UNLOCKED: &str = "account.locked_false";
    pub const RECONCILIATION_COMPLETED: &str = "reconciliation.completed";
    pub const QUARANTINE_RELEASED: &str = "audit.quarantine_released";
}

/// One recorded state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub tenant_id: String,
    /// Position in the tenant's chain, starting at 1
    pub seq: i64,
    pub actor_id: String,
    pub action: String,
    pub payload: Value,
    pub prev_hash: Option<String>,
    pub hash: String,
    /// RFC 3339, microseconds, exactly as hashed
    pub created_at: String,
}

/// Result of walking a tenant's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub valid: bool,
    pub broken_at_entry_id: Option<String>,
    pub entries_checked: usize,
    pub reason: Option<String>,
}

impl ChainVerification {
    fn valid(entries_checked: usize) -> Self {
        Self {
            valid: true,
            broken_at_entry_id: None,
            entries_checked,
            reason: None,
        }
    }

    fn broken(entries_checked: usize, entry_id: Option<String>, reason: String) -> Self {
        Self {
            valid: false,
            broken_at_entry_id: entry_id,
            entries_checked,
            reason: Some(reason),
        }
    }
}

/// A tenant whose chain is closed for writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quarantine {
    pub tenant_id: String,
    pub broken_at_entry_id: Option<String>,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

struct ChainHead {
    last_seq: i64,
    last_entry_id: String,
    last_hash: String,
}

/// Per-tenant audit chain
#[derive(Clone)]
pub struct AuditChain {
    pool: SqlitePool,
    locks: Arc<LedgerLocks>,
}

impl AuditChain {
    pub fn new(pool: SqlitePool, locks: Arc<LedgerLocks>) -> Self {
        Self { pool, locks }
    }

    /// Append inside the caller's transaction
    ///
    /// The caller must hold `LedgerLocks::chain(tenant_id)` until it commits.
    pub async fn append_in(
        conn: &mut SqliteConnection,
        tenant_id: &str,
        actor_id: &str,
        action: &str,
        payload: Value,
    ) -> LedgerResult<AuditLogEntry> {
        if let Some(quarantine) = load_quarantine(&mut *conn, tenant_id).await? {
            return Err(LedgerError::AuditChainIntegrityViolation {
                tenant_id: tenant_id.to_string(),
                broken_at_entry_id: quarantine.broken_at_entry_id,
                reason: format!("tenant is quarantined: {}", quarantine.reason),
            });
        }

        let head = load_head(&mut *conn, tenant_id).await?;
        let tip = load_tip(&mut *conn, tenant_id).await?;
        check_tip(tenant_id, head.as_ref(), tip.as_ref())?;

        let (seq, prev_hash) = match &tip {
            Some(tip) => (tip.seq + 1, Some(tip.hash.clone())),
            None => (1, None),
        };

        let created_at = format_timestamp(Utc::now());
        let hash = entry_hash(prev_hash.as_deref(), tenant_id, actor_id, action, &payload, &created_at);
        let entry = AuditLogEntry {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            seq,
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            payload,
            prev_hash,
            hash,
            created_at,
        };

        sqlx::query(
            r#"
            INSERT INTO audit_log (id, tenant_id, seq, actor_id, action, payload, prev_hash, hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.tenant_id)
        .bind(entry.seq)
        .bind(&entry.actor_id)
        .bind(&entry.action)
        .bind(canonical_json(&entry.payload))
        .bind(&entry.prev_hash)
        .bind(&entry.hash)
        .bind(&entry.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| contention_or(e, tenant_id))?;

        advance_head(&mut *conn, &entry, head.as_ref()).await?;

        tracing::debug!(
            tenant_id,
            action,
            seq = entry.seq,
            entry_id = %entry.id,
            "Audit entry appended"
        );

        Ok(entry)
    }

    /// Append as its own transaction
    pub async fn append(
        &self,
        tenant_id: &str,
        actor_id: &str,
        action: &str,
        payload: Value,
    ) -> LedgerResult<AuditLogEntry> {
        let _chain = self.locks.chain(tenant_id).await;

        let result = async {
            let mut tx = self.pool.begin().await?;
            let entry = Self::append_in(&mut tx, tenant_id, actor_id, action, payload).await?;
            tx.commit().await?;
            Ok::<_, LedgerError>(entry)
        }
        .await;

        if let Err(ref e) = result {
            self.quarantine_on(e).await;
        }
        result
    }

    /// Walk the whole chain and check it against the chain head
    ///
    /// A broken chain quarantines the tenant.
    pub async fn verify(&self, tenant_id: &str) -> LedgerResult<ChainVerification> {
        let _chain = self.locks.chain(tenant_id).await;
        let verification = self.check(tenant_id).await?;

        if verification.valid {
            tracing::info!(
                tenant_id,
                entries = verification.entries_checked,
                "Audit chain verified"
            );
        } else {
            let reason = verification.reason.clone().unwrap_or_default();
            self.quarantine(tenant_id, verification.broken_at_entry_id.as_deref(), &reason)
                .await?;
        }

        Ok(verification)
    }

    async fn check(&self, tenant_id: &str) -> LedgerResult<ChainVerification> {
        let entries = self.entries(tenant_id).await?;
        let mut conn = self.pool.acquire().await?;
        let head = load_head(&mut conn, tenant_id).await?;

        if let Err(e) = verify_chain(&entries) {
            return Ok(ChainVerification::broken(
                entries.len(),
                Some(e.entry_id().to_string()),
                e.to_string(),
            ));
        }

        let verification = match (head, entries.last()) {
            (None, None) => ChainVerification::valid(0),
            (Some(head), Some(last))
                if head.last_seq == last.seq
                    && head.last_hash == last.hash
                    && head.last_entry_id == last.id =>
            {
                ChainVerification::valid(entries.len())
            }
            (Some(head), last) if last.map_or(true, |l| l.seq < head.last_seq) => {
                ChainVerification::broken(
                    entries.len(),
                    Some(head.last_entry_id),
                    format!("entries after sequence {} are missing", last.map_or(0, |l| l.seq)),
                )
            }
            (_, last) => ChainVerification::broken(
                entries.len(),
                last.map(|l| l.id.clone()),
                "chain head does not match the latest entry".to_string(),
            ),
        };

        Ok(verification)
    }

    /// All entries of a tenant in chain order
    pub async fn entries(&self, tenant_id: &str) -> LedgerResult<Vec<AuditLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, seq, actor_id, action, payload, prev_hash, hash, created_at
            FROM audit_log
            WHERE tenant_id = ?
            ORDER BY seq
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Close the tenant's chain for writes; repeated calls keep the first reason
    pub async fn quarantine(
        &self,
        tenant_id: &str,
        broken_at_entry_id: Option<&str>,
        reason: &str,
    ) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_quarantine (tenant_id, broken_at_entry_id, reason, quarantined_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(broken_at_entry_id)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::error!(
                tenant_id,
                broken_at_entry_id = broken_at_entry_id.unwrap_or("-"),
                reason,
                "Audit chain broken, tenant quarantined"
            );
        }
        Ok(())
    }

    /// Quarantine the tenant named by an integrity violation; other errors are ignored
    pub async fn quarantine_on(&self, error: &LedgerError) {
        if let LedgerError::AuditChainIntegrityViolation {
            tenant_id,
            broken_at_entry_id,
            reason,
        } = error
        {
            if let Err(e) = self
                .quarantine(tenant_id, broken_at_entry_id.as_deref(), reason)
                .await
            {
                tracing::error!(tenant_id = %tenant_id, error = %e, "Failed to record quarantine");
            }
        }
    }

    pub async fn quarantine_status(&self, tenant_id: &str) -> LedgerResult<Option<Quarantine>> {
        let mut conn = self.pool.acquire().await?;
        load_quarantine(&mut conn, tenant_id).await
    }

    /// Reopen a quarantined chain after it has been repaired
    ///
    /// Fails with `AuditChainIntegrityViolation` while the chain still does not
    /// verify. The release itself is the first entry written afterwards.
    pub async fn release_quarantine(
        &self,
        tenant_id: &str,
        actor_id: &str,
        reason: &str,
    ) -> LedgerResult<Option<AuditLogEntry>> {
        let _chain = self.locks.chain(tenant_id).await;

        let Some(quarantine) = self.quarantine_status(tenant_id).await? else {
            return Ok(None);
        };

        let verification = self.check(tenant_id).await?;
        if !verification.valid {
            return Err(LedgerError::AuditChainIntegrityViolation {
                tenant_id: tenant_id.to_string(),
                broken_at_entry_id: verification.broken_at_entry_id,
                reason: format!(
                    "chain still broken: {}",
                    verification.reason.unwrap_or_default()
                ),
            });
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM audit_quarantine WHERE tenant_id = ?")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        let entry = Self::append_in(
            &mut tx,
            tenant_id,
            actor_id,
            actions::QUARANTINE_RELEASED,
            json!({
                "reason": reason,
                "brokenAtEntryId": quarantine.broken_at_entry_id,
                "quarantinedAt": quarantine.quarantined_at,
                "quarantineReason": quarantine.reason,
            }),
        )
        .await?;
        tx.commit().await?;

        tracing::warn!(tenant_id, actor_id, reason, "Audit chain quarantine released");
        Ok(Some(entry))
    }
}

fn check_tip(
    tenant_id: &str,
    head: Option<&ChainHead>,
    tip: Option<&AuditLogEntry>,
) -> LedgerResult<()> {
    let violation = |entry_id: Option<String>, reason: &str| LedgerError::AuditChainIntegrityViolation {
        tenant_id: tenant_id.to_string(),
        broken_at_entry_id: entry_id,
        reason: reason.to_string(),
    };

    match (head, tip) {
        (None, None) => Ok(()),
        (Some(head), Some(tip))
            if head.last_seq == tip.seq
                && head.last_hash == tip.hash
                && head.last_entry_id == tip.id =>
        {
            if calculate_entry_hash(tip) == tip.hash {
                Ok(())
            } else {
                Err(violation(Some(tip.id.clone()), "latest entry hash does not match its contents"))
            }
        }
        (Some(head), _) => Err(violation(
            Some(head.last_entry_id.clone()),
            "chain head does not match the latest entry",
        )),
        (None, Some(tip)) => Err(violation(Some(tip.id.clone()), "entries exist without a chain head")),
    }
}

async fn advance_head(
    conn: &mut SqliteConnection,
    entry: &AuditLogEntry,
    previous: Option<&ChainHead>,
) -> LedgerResult<()> {
    let result = match previous {
        None => sqlx::query(
            r#"
            INSERT INTO audit_chain_heads (tenant_id, last_seq, last_entry_id, last_hash, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.tenant_id)
        .bind(entry.seq)
        .bind(&entry.id)
        .bind(&entry.hash)
        .bind(&entry.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| contention_or(e, &entry.tenant_id))?,
        Some(head) => sqlx::query(
            r#"
            UPDATE audit_chain_heads
            SET last_seq = ?, last_entry_id = ?, last_hash = ?, updated_at = ?
            WHERE tenant_id = ? AND last_hash = ?
            "#,
        )
        .bind(entry.seq)
        .bind(&entry.id)
        .bind(&entry.hash)
        .bind(&entry.created_at)
        .bind(&entry.tenant_id)
        .bind(&head.last_hash)
        .execute(&mut *conn)
        .await?,
    };

    if result.rows_affected() == 0 {
        return Err(LedgerError::ChainContention(entry.tenant_id.clone()));
    }
    Ok(())
}

fn contention_or(error: sqlx::Error, tenant_id: &str) -> LedgerError {
    if LedgerError::is_unique_violation(&error) {
        LedgerError::ChainContention(tenant_id.to_string())
    } else {
        LedgerError::Database(error)
    }
}

async fn load_head(conn: &mut SqliteConnection, tenant_id: &str) -> LedgerResult<Option<ChainHead>> {
    let row = sqlx::query(
        "SELECT last_seq, last_entry_id, last_hash FROM audit_chain_heads WHERE tenant_id = ?",
    )
    .bind(tenant_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|row| {
        Ok::<_, LedgerError>(ChainHead {
            last_seq: row.try_get("last_seq")?,
            last_entry_id: row.try_get("last_entry_id")?,
            last_hash: row.try_get("last_hash")?,
        })
    })
    .transpose()
}

async fn load_tip(conn: &mut SqliteConnection, tenant_id: &str) -> LedgerResult<Option<AuditLogEntry>> {
    let row = sqlx::query(
        r#"
        SELECT id, tenant_id, seq, actor_id, action, payload, prev_hash, hash, created_at
        FROM audit_log
        WHERE tenant_id = ?
        ORDER BY seq DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(entry_from_row).transpose()
}

async fn load_quarantine(
    conn: &mut SqliteConnection,
    tenant_id: &str,
) -> LedgerResult<Option<Quarantine>> {
    let row = sqlx::query(
        "SELECT tenant_id, broken_at_entry_id, reason, quarantined_at FROM audit_quarantine WHERE tenant_id = ?",
    )
    .bind(tenant_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|row| {
        Ok::<_, LedgerError>(Quarantine {
            tenant_id: row.try_get("tenant_id")?,
            broken_at_entry_id: row.try_get("broken_at_entry_id")?,
            reason: row.try_get("reason")?,
            quarantined_at: row.try_get("quarantined_at")?,
        })
    })
    .transpose()
}

fn entry_from_row(row: &SqliteRow) -> LedgerResult<AuditLogEntry> {
    let raw: String = row.try_get("payload")?;
    // Unparseable text still has to fail verification, not abort it.
    let payload = serde_json::from_str(&raw).unwrap_or(Value::String(raw));

    Ok(AuditLogEntry {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        seq: row.try_get("seq")?,
        actor_id: row.try_get("actor_id")?,
        action: row.try_get("action")?,
        payload,
        prev_hash: row.try_get("prev_hash")?,
        hash: row.try_get("hash")?,
        created_at: row.try_get("created_at")?,
    })
}
