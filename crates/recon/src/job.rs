//! Reconciliation job
//!
//! Per tenant: read every designated account, read the bank's balance for it
//! under a timeout, then persist one artifact, stamp `last_reconciled_at` and
//! append one audit entry in a single transaction. Events go out after commit.
//!
//! `run_all` isolates tenants: a failure is recorded for that tenant and the
//! batch carries on.

use crate::artifact::{ArtifactRepo, ReconciliationArtifact, ReconciliationLine, ReconciliationStatus};
use crate::banking::BankingBalanceReader;
use crate::error::ReconError;
use apgms_bus::DomainEvent;
use apgms_core::{DesignatedAccount, MinorUnits};
use apgms_ledger::{actions, AccountRepo, AuditChain, Ledger, LedgerError, LedgerResult, ReconciliationConfig};
use chrono::{SubsecRound, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub const COMPLETED_SUBJECT: &str = "reconciliation.completed";
pub const SHORTFALL_SUBJECT: &str = "reconciliation.shortfall";

/// One tenant's result within a run
#[derive(Debug)]
pub struct TenantOutcome {
    pub tenant_id: String,
    pub result: Result<ReconciliationArtifact, ReconError>,
}

impl TenantOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Result of `run_all`
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub outcomes: Vec<TenantOutcome>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn shortfalls(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(&o.result, Ok(a) if a.status == ReconciliationStatus::Shortfall))
            .count()
    }
}

/// Compares the ledger with the banking partner
pub struct ReconciliationJob {
    ledger: Ledger,
    reader: Arc<dyn BankingBalanceReader>,
    config: ReconciliationConfig,
}

impl ReconciliationJob {
    /// Create the job and the artifact table
    pub async fn new(
        ledger: Ledger,
        reader: Arc<dyn BankingBalanceReader>,
        config: ReconciliationConfig,
    ) -> LedgerResult<Self> {
        ArtifactRepo::init(ledger.pool()).await?;
        Ok(Self {
            ledger,
            reader,
            config,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Reconcile one tenant as a run of its own
    pub async fn run_for_tenant(&self, tenant_id: &str) -> LedgerResult<ReconciliationArtifact> {
        let run_id = Uuid::new_v4().to_string();
        self.reconcile(&run_id, tenant_id).await
    }

    /// Reconcile every tenant with at most `max_concurrency` in flight
    ///
    /// Only fails when the tenant list itself cannot be read.
    pub async fn run_all(self: &Arc<Self>) -> LedgerResult<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let tenants = self.ledger.tenants().await?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        tracing::info!(run_id = %run_id, tenants = tenants.len(), "Reconciliation run started");

        let mut handles = Vec::with_capacity(tenants.len());
        for tenant_id in tenants {
            let job = Arc::clone(self);
            let semaphore = semaphore.clone();
            let run_id = run_id.clone();
            let task_tenant = tenant_id.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                job.reconcile(&run_id, &task_tenant).await
            });
            handles.push((tenant_id, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (tenant_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result.map_err(ReconError::from),
                Err(e) => Err(ReconError::TaskAborted {
                    tenant_id: tenant_id.clone(),
                    reason: e.to_string(),
                }),
            };

            if let Err(ref e) = result {
                tracing::error!(
                    run_id = %run_id,
                    tenant_id = %tenant_id,
                    code = e.code(),
                    error = %e,
                    "Tenant reconciliation failed"
                );
            }
            outcomes.push(TenantOutcome { tenant_id, result });
        }

        let summary = RunSummary { run_id, outcomes };
        tracing::info!(
            run_id = %summary.run_id,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            shortfalls = summary.shortfalls(),
            "Reconciliation run finished"
        );
        Ok(summary)
    }

    async fn reconcile(&self, run_id: &str, tenant_id: &str) -> LedgerResult<ReconciliationArtifact> {
        let accounts = self.ledger.accounts(tenant_id).await?;

        let mut lines = Vec::with_capacity(accounts.len());
        for account in &accounts {
            let external = self.external_balance(account).await?;
            lines.push(ReconciliationLine::new(
                &account.id,
                account.obligation_type,
                account.balance_minor_units.value(),
                external,
            )?);
        }

        let generated_at = Utc::now().trunc_subsecs(6);
        let artifact = ReconciliationArtifact::build(
            Uuid::new_v4().to_string(),
            run_id.to_string(),
            tenant_id.to_string(),
            lines,
            generated_at,
        )?;

        self.persist(&artifact, &accounts).await?;

        if artifact.status == ReconciliationStatus::Shortfall {
            tracing::warn!(
                tenant_id,
                discrepancy = artifact.discrepancy_minor_units,
                artifact_id = %artifact.id,
                "Reconciliation shortfall: ledger holds more than the bank reports"
            );
        } else {
            tracing::info!(
                tenant_id,
                status = %artifact.status,
                discrepancy = artifact.discrepancy_minor_units,
                artifact_id = %artifact.id,
                "Tenant reconciled"
            );
        }

        self.publish_completed(&artifact);
        if artifact.status == ReconciliationStatus::Shortfall {
            self.handle_shortfall(&artifact, &accounts).await;
        }

        Ok(artifact)
    }

    async fn external_balance(&self, account: &DesignatedAccount) -> LedgerResult<i64> {
        let timeout = self.config.balance_timeout();
        let unavailable = |reason: String| LedgerError::ExternalBalanceUnavailable {
            tenant_id: account.tenant_id.clone(),
            reason,
        };

        match tokio::time::timeout(timeout, self.reader.get_balance(account)).await {
            Ok(Ok(balance)) => Ok(balance),
            Ok(Err(e)) => Err(unavailable(format!("{}: {}", self.reader.name(), e))),
            Err(_) => Err(unavailable(format!(
                "{}: no answer within {}ms for {}",
                self.reader.name(),
                timeout.as_millis(),
                account.obligation_type
            ))),
        }
    }

    async fn persist(
        &self,
        artifact: &ReconciliationArtifact,
        accounts: &[DesignatedAccount],
    ) -> LedgerResult<()> {
        let _chain = self.ledger.locks().chain(&artifact.tenant_id).await;

        let result = async {
            let mut tx = self.ledger.pool().begin().await?;
            ArtifactRepo::insert(&mut tx, artifact).await?;
            for account in accounts {
                AccountRepo::mark_reconciled(&mut tx, &account.id, artifact.generated_at).await?;
            }
            AuditChain::append_in(
                &mut tx,
                &artifact.tenant_id,
                &self.ledger.config().default_actor,
                actions::RECONCILIATION_COMPLETED,
                json!({
                    "artifactId": artifact.id,
                    "runId": artifact.run_id,
                    "asOfDate": artifact.as_of_date,
                    "status": artifact.status,
                    "internalBalanceMinorUnits": artifact.internal_balance_minor_units,
                    "externalBalanceMinorUnits": artifact.external_balance_minor_units,
                    "discrepancyMinorUnits": artifact.discrepancy_minor_units,
                    "sha256": artifact.sha256,
                }),
            )
            .await?;
            tx.commit().await?;
            Ok::<_, LedgerError>(())
        }
        .await;

        if let Err(ref e) = result {
            self.ledger.audit().quarantine_on(e).await;
        }
        result
    }

    async fn handle_shortfall(&self, artifact: &ReconciliationArtifact, accounts: &[DesignatedAccount]) {
        if self.config.block_on_shortfall {
            for line in artifact.shortfall_lines() {
                let Some(account) = accounts.iter().find(|a| a.id == line.account_id) else {
                    continue;
                };
                let shortfall = MinorUnits::new(line.discrepancy_minor_units.saturating_neg())
                    .unwrap_or(MinorUnits::ZERO);

                let blocked = tokio::time::timeout(
                    self.config.balance_timeout(),
                    self.reader.block_transfer(account, shortfall),
                )
                .await;

                match blocked {
                    Ok(Ok(())) => tracing::warn!(
                        tenant_id = %account.tenant_id,
                        obligation = %account.obligation_type,
                        shortfall = shortfall.value(),
                        "Outbound transfers blocked"
                    ),
                    Ok(Err(e)) => tracing::error!(
                        tenant_id = %account.tenant_id,
                        obligation = %account.obligation_type,
                        error = %e,
                        "Transfer block failed"
                    ),
                    Err(_) => tracing::error!(
                        tenant_id = %account.tenant_id,
                        obligation = %account.obligation_type,
                        "Transfer block timed out"
                    ),
                }
            }
        }

        let shortfalls: Vec<_> = artifact
            .shortfall_lines()
            .map(|l| {
                json!({
                    "accountId": l.account_id,
                    "obligationType": l.obligation_type,
                    "shortfallMinorUnits": l.discrepancy_minor_units.saturating_neg(),
                })
            })
            .collect();

        self.ledger.events().emit(
            DomainEvent::new(
                SHORTFALL_SUBJECT,
                &artifact.tenant_id,
                &artifact.id,
                json!({
                    "artifactId": artifact.id,
                    "asOfDate": artifact.as_of_date,
                    "discrepancyMinorUnits": artifact.discrepancy_minor_units,
                    "lines": shortfalls,
                }),
            )
            .high_priority(),
        );
    }

    fn publish_completed(&self, artifact: &ReconciliationArtifact) {
        self.ledger.events().emit(DomainEvent::new(
            COMPLETED_SUBJECT,
            &artifact.tenant_id,
            &artifact.id,
            json!({
                "artifactId": artifact.id,
                "runId": artifact.run_id,
                "asOfDate": artifact.as_of_date,
                "status": artifact.status,
                "internalBalanceMinorUnits": artifact.internal_balance_minor_units,
                "externalBalanceMinorUnits": artifact.external_balance_minor_units,
                "discrepancyMinorUnits": artifact.discrepancy_minor_units,
                "sha256": artifact.sha256,
            }),
        ));
    }
}
