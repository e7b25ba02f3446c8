//! Contribution ingestor - the ledger write path
//!
//! Order of operations for one contribution:
//! 1. idempotency `begin` (replay, conflict and in-flight return here)
//! 2. account lock, then chain lock
//! 3. one transaction: balance delta, contribution row, audit entry,
//!    coverage enforcement, idempotency `complete`
//! 4. publish events after commit
//!
//! Any failure in step 3 rolls everything back and releases the claim, so the
//! same key can be retried.

use crate::account::AccountRepo;
use crate::audit::{actions, AuditChain};
use crate::contribution::{ContributionRecord, ContributionRepo};
use crate::coverage::{self, Enforcement};
use crate::error::{LedgerError, LedgerResult};
use crate::hash::request_hash;
use crate::idempotency::{BeginOutcome, CompletedResponse, IdempotencyClaim, IdempotencyStore, StoredResponse};
use crate::locks::LedgerLocks;
use apgms_bus::{DomainEvent, EventEmitter};
use apgms_core::{ContributionSource, DesignatedAccount, MinorUnits, ObligationType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

pub const CONTRIBUTION_APPLIED_SUBJECT: &str = "designated_account.contribution_applied";
pub const LOCK_CHANGED_SUBJECT: &str = "designated_account.lock_changed";

const CREATED: u16 = 201;

/// One inbound contribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributionRequest {
    pub tenant_id: String,
    pub obligation_type: ObligationType,
    /// Must be positive
    pub amount_minor_units: i64,
    pub source: ContributionSource,
    /// Caller-stable key, usually the source system's event id
    pub idempotency_key: String,
    /// Amount the account must hold; computed upstream
    pub required_minor_units: MinorUnits,
    pub actor_id: Option<String>,
}

impl ContributionRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        obligation_type: ObligationType,
        amount_minor_units: i64,
        source: ContributionSource,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            obligation_type,
            amount_minor_units,
            source,
            idempotency_key: idempotency_key.into(),
            required_minor_units: MinorUnits::ZERO,
            actor_id: None,
        }
    }

    pub fn with_required(mut self, required: MinorUnits) -> Self {
        self.required_minor_units = required;
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Fingerprint of the payload fields; the required amount is context and
    /// does not take part
    pub fn request_hash(&self) -> String {
        request_hash(&json!({
            "tenantId": self.tenant_id,
            "obligationType": self.obligation_type,
            "amountMinorUnits": self.amount_minor_units,
            "source": self.source,
        }))
    }
}

/// What an applied contribution did; this is the stored idempotent response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionOutcome {
    pub contribution: ContributionRecord,
    /// Account snapshot right after the contribution
    pub account: DesignatedAccount,
    pub lock_changed: bool,
    pub required_minor_units: MinorUnits,
}

/// Response to `ingest`, first call or replay alike
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributionReceipt {
    pub replayed: bool,
    pub status_code: u16,
    /// Response body, byte-identical across replays
    pub payload: String,
    pub outcome: ContributionOutcome,
}

/// Applies contributions idempotently
#[derive(Clone)]
pub struct Ingestor {
    pool: SqlitePool,
    locks: Arc<LedgerLocks>,
    idempotency: IdempotencyStore,
    audit: AuditChain,
    events: EventEmitter,
    default_actor: String,
}

impl Ingestor {
    pub fn new(
        pool: SqlitePool,
        locks: Arc<LedgerLocks>,
        idempotency: IdempotencyStore,
        audit: AuditChain,
        events: EventEmitter,
        default_actor: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            locks,
            idempotency,
            audit,
            events,
            default_actor: default_actor.into(),
        }
    }

    /// Apply a contribution at most once per `(tenant_id, idempotency_key)`
    pub async fn ingest(&self, request: ContributionRequest) -> LedgerResult<ContributionReceipt> {
        if request.amount_minor_units <= 0 {
            return Err(LedgerError::InvalidAmount(request.amount_minor_units));
        }
        let amount = MinorUnits::new(request.amount_minor_units)
            .map_err(|_| LedgerError::InvalidAmount(request.amount_minor_units))?;
        if request.idempotency_key.trim().is_empty() {
            return Err(LedgerError::MissingIdempotencyKey);
        }

        let claim = match self
            .idempotency
            .begin(&request.tenant_id, &request.idempotency_key, &request.request_hash())
            .await?
        {
            BeginOutcome::Replay(stored) => return replayed(stored),
            BeginOutcome::Fresh(claim) => claim,
        };

        let account_guard = self.locks.account(&request.tenant_id, request.obligation_type).await;
        let chain_guard = self.locks.chain(&request.tenant_id).await;

        let result = self.apply(&request, amount, &claim).await;
        if let Err(ref e) = result {
            self.audit.quarantine_on(e).await;
        }

        drop(chain_guard);
        drop(account_guard);
        drop(claim);

        let (outcome, payload) = result?;

        tracing::info!(
            tenant_id = %request.tenant_id,
            obligation = %request.obligation_type,
            idempotency_key = %request.idempotency_key,
            amount = amount.value(),
            balance = outcome.account.balance_minor_units.value(),
            locked = outcome.account.locked,
            "Contribution applied"
        );

        self.publish_contribution(&outcome);
        if outcome.lock_changed {
            self.publish_lock_changed(&outcome.account, outcome.required_minor_units);
        }

        Ok(ContributionReceipt {
            replayed: false,
            status_code: CREATED,
            payload,
            outcome,
        })
    }

    async fn apply(
        &self,
        request: &ContributionRequest,
        amount: MinorUnits,
        claim: &IdempotencyClaim,
    ) -> LedgerResult<(ContributionOutcome, String)> {
        let actor = request.actor_id.as_deref().unwrap_or(&self.default_actor);
        let mut tx = self.pool.begin().await?;

        let account = AccountRepo::apply_delta(
            &mut tx,
            &request.tenant_id,
            request.obligation_type,
            amount,
        )
        .await?;

        let record = ContributionRecord {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            account_id: account.id.clone(),
            obligation_type: request.obligation_type,
            amount_minor_units: amount,
            source: request.source,
            idempotency_key: request.idempotency_key.clone(),
            applied_at: account.updated_at,
        };
        ContributionRepo::insert(&mut tx, &record).await?;

        AuditChain::append_in(
            &mut tx,
            &request.tenant_id,
            actor,
            actions::CONTRIBUTION_APPLIED,
            json!({
                "contributionId": record.id,
                "accountId": account.id,
                "obligationType": record.obligation_type,
                "amountMinorUnits": amount,
                "source": record.source,
                "idempotencyKey": record.idempotency_key,
                "balanceMinorUnits": account.balance_minor_units,
            }),
        )
        .await?;

        let enforcement = coverage::enforce(
            &mut tx,
            account,
            request.required_minor_units,
            actor,
            Some(amount),
        )
        .await?;

        let outcome = ContributionOutcome {
            lock_changed: enforcement.decision.changed,
            account: enforcement.account,
            required_minor_units: request.required_minor_units,
            contribution: record,
        };
        let payload = serde_json::to_string(&outcome)?;

        IdempotencyStore::complete(
            &mut tx,
            claim,
            CompletedResponse {
                status_code: CREATED,
                payload: payload.clone(),
                resource: Some("contribution".to_string()),
                resource_id: Some(outcome.contribution.id.clone()),
            },
        )
        .await?;

        tx.commit().await?;
        Ok((outcome, payload))
    }

    /// Re-evaluate an account's lock against a new required amount
    ///
    /// Same audit and event behaviour as the check that follows a contribution.
    pub async fn recompute_coverage(
        &self,
        tenant_id: &str,
        obligation: ObligationType,
        required: MinorUnits,
        actor_id: Option<&str>,
    ) -> LedgerResult<Enforcement> {
        let actor = actor_id.unwrap_or(&self.default_actor);
        let account_guard = self.locks.account(tenant_id, obligation).await;
        let chain_guard = self.locks.chain(tenant_id).await;

        let result = async {
            let mut tx = self.pool.begin().await?;
            let account = AccountRepo::get_or_create(&mut tx, tenant_id, obligation).await?;
            let enforcement = coverage::enforce(&mut tx, account, required, actor, None).await?;
            tx.commit().await?;
            Ok::<_, LedgerError>(enforcement)
        }
        .await;
        if let Err(ref e) = result {
            self.audit.quarantine_on(e).await;
        }

        drop(chain_guard);
        drop(account_guard);

        let enforcement = result?;
        if enforcement.decision.changed {
            self.publish_lock_changed(&enforcement.account, required);
        }
        Ok(enforcement)
    }

    fn publish_contribution(&self, outcome: &ContributionOutcome) {
        let record = &outcome.contribution;
        self.events.emit(DomainEvent::new(
            CONTRIBUTION_APPLIED_SUBJECT,
            &record.tenant_id,
            &record.id,
            json!({
                "contributionId": record.id,
                "accountId": record.account_id,
                "obligationType": record.obligation_type,
                "amountMinorUnits": record.amount_minor_units,
                "source": record.source,
                "balanceMinorUnits": outcome.account.balance_minor_units,
                "locked": outcome.account.locked,
            }),
        ));
    }

    fn publish_lock_changed(&self, account: &DesignatedAccount, required: MinorUnits) {
        let event = DomainEvent::new(
            LOCK_CHANGED_SUBJECT,
            &account.tenant_id,
            &account.id,
            json!({
                "accountId": account.id,
                "obligationType": account.obligation_type,
                "locked": account.locked,
                "balanceMinorUnits": account.balance_minor_units,
                "requiredMinorUnits": required,
            }),
        );

        self.events.emit(if account.locked {
            event.high_priority()
        } else {
            event
        });
    }
}

fn replayed(stored: StoredResponse) -> LedgerResult<ContributionReceipt> {
    let outcome = serde_json::from_str(&stored.response_payload)?;
    Ok(ContributionReceipt {
        replayed: true,
        status_code: stored.status_code,
        payload: stored.response_payload,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_hash_excludes_required_and_actor() {
        let base = ContributionRequest::new("org-1", ObligationType::Paygw, 5_000, ContributionSource::PayrollSystem, "k-1");
        let with_context = base
            .clone()
            .with_required(MinorUnits::new(10_000).unwrap())
            .with_actor("payroll-bot");

        assert_eq!(base.request_hash(), with_context.request_hash());
    }

    #[test]
    fn test_request_hash_covers_payload() {
        let base = ContributionRequest::new("org-1", ObligationType::Paygw, 5_000, ContributionSource::PayrollSystem, "k-1");

        let mut amount = base.clone();
        amount.amount_minor_units = 5_001;
        let mut obligation = base.clone();
        obligation.obligation_type = ObligationType::Gst;
        let mut source = base.clone();
        source.source = ContributionSource::Manual;

        assert_ne!(base.request_hash(), amount.request_hash());
        assert_ne!(base.request_hash(), obligation.request_hash());
        assert_ne!(base.request_hash(), source.request_hash());
    }
}
