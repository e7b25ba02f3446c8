//! CLI commands
//!
//! Each command prints a human summary and returns what it did.

use apgms_core::{AmountError, ContributionSource, DesignatedAccount, MinorUnits, ObligationType};
use apgms_ledger::{
    AuditLogEntry, ChainVerification, ContributionReceipt, ContributionRequest, Enforcement, LedgerError,
};
use apgms_recon::{BankingError, ReconError, ReconciliationScheduler, ReconciliationStatus, TenantOutcome};
use std::path::Path;

use crate::context::AppContext;

/// Stable code for an error chain, `internal_error` when it is not ours
pub fn error_code(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<LedgerError>() {
            return e.code();
        }
        if let Some(e) = cause.downcast_ref::<ReconError>() {
            return e.code();
        }
        if cause.downcast_ref::<BankingError>().is_some() {
            return "external_balance_unavailable";
        }
        if cause.downcast_ref::<AmountError>().is_some() {
            return "invalid_amount";
        }
    }
    "internal_error"
}

fn units(value: i64) -> anyhow::Result<MinorUnits> {
    Ok(MinorUnits::new(value)?)
}

/// Apply a contribution
#[allow(clippy::too_many_arguments)]
pub async fn contribute(
    ctx: &AppContext,
    tenant_id: &str,
    obligation: ObligationType,
    amount: i64,
    key: &str,
    source: Option<ContributionSource>,
    required: Option<i64>,
    actor: Option<&str>,
) -> anyhow::Result<ContributionReceipt> {
    let source = source.unwrap_or_else(|| obligation.default_source());
    let mut request = ContributionRequest::new(tenant_id, obligation, amount, source, key);
    if let Some(required) = required {
        request = request.with_required(units(required)?);
    }
    if let Some(actor) = actor {
        request = request.with_actor(actor);
    }

    let receipt = ctx.ledger.ingestor().ingest(request).await?;
    let account = &receipt.outcome.account;

    println!(
        "{} {} to {}/{} (balance: {}, locked: {})",
        if receipt.replayed { "↩️  Replayed" } else { "✅ Applied" },
        MinorUnits::new(amount).unwrap_or_default(),
        tenant_id,
        obligation,
        account.balance_minor_units,
        account.locked
    );
    println!("{}", receipt.payload);
    Ok(receipt)
}

/// Re-evaluate the lock against a new required amount
pub async fn coverage(
    ctx: &AppContext,
    tenant_id: &str,
    obligation: ObligationType,
    required: i64,
    actor: Option<&str>,
) -> anyhow::Result<Enforcement> {
    let enforcement = ctx
        .ledger
        .ingestor()
        .recompute_coverage(tenant_id, obligation, units(required)?, actor)
        .await?;

    let account = &enforcement.account;
    let shortfall = account.shortfall_against(enforcement.required);
    if account.locked {
        println!(
            "🔒 {}/{} locked: balance {} is short of {} by {}",
            tenant_id, obligation, account.balance_minor_units, enforcement.required, shortfall
        );
    } else {
        println!(
            "✅ {}/{} covered: balance {} against {}",
            tenant_id, obligation, account.balance_minor_units, enforcement.required
        );
    }
    if enforcement.decision.changed {
        println!("   Lock state changed");
    }
    Ok(enforcement)
}

/// Show every designated account of a tenant
pub async fn balance(ctx: &AppContext, tenant_id: &str) -> anyhow::Result<Vec<DesignatedAccount>> {
    let accounts = ctx.ledger.accounts(tenant_id).await?;

    if accounts.is_empty() {
        println!("No designated accounts for {}", tenant_id);
    }
    for account in &accounts {
        println!(
            "{:<6} {:>16} {}{}",
            account.obligation_type.as_str(),
            account.balance_minor_units.to_string(),
            if account.locked { "LOCKED" } else { "open" },
            account
                .last_reconciled_at
                .map(|at| format!(" (reconciled {})", at.to_rfc3339()))
                .unwrap_or_default()
        );
    }
    Ok(accounts)
}

/// Walk a tenant's audit chain
pub async fn audit_verify(ctx: &AppContext, tenant_id: &str) -> anyhow::Result<ChainVerification> {
    let verification = ctx.ledger.verify_chain(tenant_id).await?;

    if verification.valid {
        println!("✅ Audit chain verified ({} entries)", verification.entries_checked);
    } else {
        println!(
            "❌ Audit chain broken at {}: {}",
            verification.broken_at_entry_id.as_deref().unwrap_or("-"),
            verification.reason.as_deref().unwrap_or("unknown")
        );
        println!("   Tenant {} is quarantined", tenant_id);
    }
    Ok(verification)
}

/// Print a tenant's audit entries, oldest first
pub async fn audit_log(ctx: &AppContext, tenant_id: &str) -> anyhow::Result<Vec<AuditLogEntry>> {
    let entries = ctx.ledger.audit().entries(tenant_id).await?;

    for entry in &entries {
        println!(
            "{:>5} {} {:<28} {:<12} {}",
            entry.seq,
            entry.created_at,
            entry.action,
            entry.actor_id,
            short_hash(&entry.hash)
        );
    }
    println!("{} entries", entries.len());
    Ok(entries)
}

/// First 12 characters of a hash for tabular output
fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}

/// Lift a quarantine after the chain has been repaired
pub async fn audit_release(
    ctx: &AppContext,
    tenant_id: &str,
    actor: &str,
    reason: &str,
) -> anyhow::Result<Option<AuditLogEntry>> {
    let released = ctx.ledger.audit().release_quarantine(tenant_id, actor, reason).await?;

    match &released {
        Some(entry) => println!("✅ Quarantine released for {} (seq: {})", tenant_id, entry.seq),
        None => println!("{} is not quarantined", tenant_id),
    }
    Ok(released)
}

/// Reconcile one tenant or all of them once
pub async fn reconcile(
    ctx: &AppContext,
    tenant_id: Option<&str>,
    bank_snapshot: Option<&Path>,
) -> anyhow::Result<Vec<TenantOutcome>> {
    let job = ctx.reconciliation_job(bank_snapshot).await?;

    let outcomes = match tenant_id {
        Some(tenant_id) => vec![TenantOutcome {
            tenant_id: tenant_id.to_string(),
            result: job.run_for_tenant(tenant_id).await.map_err(ReconError::from),
        }],
        None => job.run_all().await?.outcomes,
    };

    for outcome in &outcomes {
        print_outcome(outcome);
    }
    Ok(outcomes)
}

/// Reconcile every tenant on the configured interval until Ctrl-C
pub async fn reconcile_watch(ctx: &AppContext, bank_snapshot: Option<&Path>) -> anyhow::Result<usize> {
    let job = ctx.reconciliation_job(bank_snapshot).await?;
    let interval = ctx.ledger.config().reconciliation.interval();

    println!("Reconciling every {}s, Ctrl-C to stop", interval.as_secs());
    let scheduler = ReconciliationScheduler::spawn(job, interval, |summary| {
        for outcome in &summary.outcomes {
            print_outcome(outcome);
        }
    });

    tokio::signal::ctrl_c().await?;
    let runs = scheduler.shutdown().await;
    println!("Stopped after {} runs", runs);
    Ok(runs)
}

fn print_outcome(outcome: &TenantOutcome) {
    match &outcome.result {
        Ok(artifact) => {
            let marker = match artifact.status {
                ReconciliationStatus::Balanced => "✅",
                ReconciliationStatus::Surplus => "➕",
                ReconciliationStatus::Shortfall => "⚠️ ",
            };
            println!(
                "{} {} {} discrepancy {} (artifact {}, sha256 {})",
                marker,
                outcome.tenant_id,
                artifact.status,
                artifact.discrepancy_minor_units,
                artifact.id,
                artifact.sha256
            );
        }
        Err(e) => println!("❌ {} failed [{}]: {}", outcome.tenant_id, e.code(), e),
    }
}
