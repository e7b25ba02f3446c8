//! Idempotency store - at-most-once guard for mutating operations
//!
//! Not specific to contributions: any write path can guard itself with a
//! `(tenant_id, key, request_hash)` triple.
//!
//! `begin` registers a provisional claim in memory; the durable row is only
//! written by `complete`, inside the same transaction as the guarded mutation.
//! A failed operation therefore leaves nothing behind and can be retried.

use crate::error::{LedgerError, LedgerResult};
use crate::hash::sha256_hex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

type ClaimKey = (String, String);
type Registry = Arc<Mutex<HashSet<ClaimKey>>>;

/// The response recorded for a completed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResponse {
    pub status_code: u16,
    /// Exact response body, returned verbatim on replay
    pub response_payload: String,
    pub response_hash: String,
    pub resource: Option<String>,
    pub resource_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of [`IdempotencyStore::begin`]
#[derive(Debug)]
pub enum BeginOutcome {
    /// Never seen: run the operation, then `complete` with this claim
    Fresh(IdempotencyClaim),
    /// Already completed with the same request: return this, do nothing else
    Replay(StoredResponse),
}

/// Provisional registration of a key; released when dropped
#[derive(Debug)]
pub struct IdempotencyClaim {
    tenant_id: String,
    key: String,
    request_hash: String,
    registry: Registry,
}

impl IdempotencyClaim {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn request_hash(&self) -> &str {
        &self.request_hash
    }
}

impl Drop for IdempotencyClaim {
    fn drop(&mut self) {
        let mut in_flight = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.remove(&(self.tenant_id.clone(), self.key.clone()));
    }
}

/// Response fields written by [`IdempotencyStore::complete`]
#[derive(Debug, Clone)]
pub struct CompletedResponse {
    pub status_code: u16,
    pub payload: String,
    pub resource: Option<String>,
    pub resource_id: Option<String>,
}

/// Durable `(tenant_id, key)` map plus the in-flight claim registry
#[derive(Clone)]
pub struct IdempotencyStore {
    pool: SqlitePool,
    in_flight: Registry,
}

impl IdempotencyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Three-way check of a key: fresh, replay, or an error
    ///
    /// A completed key replays no matter how many callers race on it. Fails
    /// with `KeyInFlight` only while another claim on a not-yet-completed key
    /// is alive, and with `IdempotencyKeyConflict` when the key completed with
    /// another request.
    pub async fn begin(
        &self,
        tenant_id: &str,
        key: &str,
        request_hash: &str,
    ) -> LedgerResult<BeginOutcome> {
        if key.trim().is_empty() {
            return Err(LedgerError::MissingIdempotencyKey);
        }

        if let Some(outcome) = self.completed(tenant_id, key, request_hash).await? {
            return Ok(outcome);
        }

        let claim = self.claim(tenant_id, key, request_hash)?;

        // The previous holder may have committed between the lookup and the claim.
        match self.completed(tenant_id, key, request_hash).await? {
            Some(outcome) => Ok(outcome),
            None => Ok(BeginOutcome::Fresh(claim)),
        }
    }

    /// Replay or conflict for a key that already has a durable row
    async fn completed(
        &self,
        tenant_id: &str,
        key: &str,
        request_hash: &str,
    ) -> LedgerResult<Option<BeginOutcome>> {
        match self.lookup(tenant_id, key).await? {
            Some((stored_hash, response)) if stored_hash == request_hash => {
                tracing::debug!(tenant_id, idempotency_key = key, "Idempotent replay served");
                Ok(Some(BeginOutcome::Replay(response)))
            }
            Some(_) => {
                tracing::warn!(
                    tenant_id,
                    idempotency_key = key,
                    "Idempotency key reused with a different payload"
                );
                Err(LedgerError::IdempotencyKeyConflict {
                    tenant_id: tenant_id.to_string(),
                    key: key.to_string(),
                })
            }
            None => Ok(None),
        }
    }

    fn claim(&self, tenant_id: &str, key: &str, request_hash: &str) -> LedgerResult<IdempotencyClaim> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let claim_key = (tenant_id.to_string(), key.to_string());

        if !in_flight.insert(claim_key) {
            tracing::warn!(tenant_id, idempotency_key = key, "Idempotency key in flight");
            return Err(LedgerError::KeyInFlight {
                tenant_id: tenant_id.to_string(),
                key: key.to_string(),
            });
        }

        Ok(IdempotencyClaim {
            tenant_id: tenant_id.to_string(),
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            registry: self.in_flight.clone(),
        })
    }

    /// Persist the response for `claim` on the caller's transaction
    pub async fn complete(
        conn: &mut SqliteConnection,
        claim: &IdempotencyClaim,
        response: CompletedResponse,
    ) -> LedgerResult<StoredResponse> {
        let stored = StoredResponse {
            status_code: response.status_code,
            response_hash: sha256_hex(&response.payload),
            response_payload: response.payload,
            resource: response.resource,
            resource_id: response.resource_id,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO idempotency_keys
                (tenant_id, key, request_hash, response_hash, status_code, response_payload,
                 resource, resource_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&claim.tenant_id)
        .bind(&claim.key)
        .bind(&claim.request_hash)
        .bind(&stored.response_hash)
        .bind(i64::from(stored.status_code))
        .bind(&stored.response_payload)
        .bind(&stored.resource)
        .bind(&stored.resource_id)
        .bind(stored.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            // Another process completed the same key first.
            if LedgerError::is_unique_violation(&e) {
                LedgerError::KeyInFlight {
                    tenant_id: claim.tenant_id.clone(),
                    key: claim.key.clone(),
                }
            } else {
                LedgerError::Database(e)
            }
        })?;

        Ok(stored)
    }

    /// Stored request hash and response for a completed key
    pub async fn lookup(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> LedgerResult<Option<(String, StoredResponse)>> {
        let row = sqlx::query(
            r#"
            SELECT request_hash, response_hash, status_code, response_payload,
                   resource, resource_id, created_at
            FROM idempotency_keys
            WHERE tenant_id = ? AND key = ?
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_code: i64 = row.try_get("status_code")?;
        let response = StoredResponse {
            status_code: u16::try_from(status_code)
                .map_err(|_| LedgerError::CorruptRecord(format!("status code {}", status_code)))?,
            response_payload: row.try_get("response_payload")?,
            response_hash: row.try_get("response_hash")?,
            resource: row.try_get("resource")?,
            resource_id: row.try_get("resource_id")?,
            created_at: row.try_get("created_at")?,
        };

        Ok(Some((row.try_get("request_hash")?, response)))
    }

    /// Number of claims currently registered
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
