//! Coverage enforcer - lock an account while it cannot cover its obligation
//!
//! The rule has no hysteresis: an account is locked exactly when
//! `balance < required`, so `balance == required` is unlocked.

use crate::account::AccountRepo;
use crate::audit::{actions, AuditChain, AuditLogEntry};
use crate::error::LedgerResult;
use apgms_core::{DesignatedAccount, MinorUnits};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqliteConnection;

/// Lock decision for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageDecision {
    pub next_locked: bool,
    /// True only when `next_locked` differs from the current flag
    pub changed: bool,
}

/// Decide the lock state of `account` for a `required` amount
pub fn evaluate(account: &DesignatedAccount, required: MinorUnits) -> CoverageDecision {
    let next_locked = account.balance_minor_units < required;
    CoverageDecision {
        next_locked,
        changed: next_locked != account.locked,
    }
}

/// Account state after enforcement
#[derive(Debug, Clone)]
pub struct Enforcement {
    pub account: DesignatedAccount,
    pub decision: CoverageDecision,
    pub required: MinorUnits,
    /// The lock transition entry, when the flag flipped
    pub audit_entry: Option<AuditLogEntry>,
}

/// Apply the decision for `account` inside the caller's transaction
///
/// Flips the flag and records `account.locked_true` / `account.locked_false`
/// only when the decision changed. Caller holds the account and chain locks.
pub async fn enforce(
    conn: &mut SqliteConnection,
    account: DesignatedAccount,
    required: MinorUnits,
    actor_id: &str,
    trigger_amount: Option<MinorUnits>,
) -> LedgerResult<Enforcement> {
    let decision = evaluate(&account, required);
    if !decision.changed {
        return Ok(Enforcement {
            account,
            decision,
            required,
            audit_entry: None,
        });
    }

    let updated = AccountRepo::set_locked(
        &mut *conn,
        &account.tenant_id,
        account.obligation_type,
        decision.next_locked,
    )
    .await?;

    let action = if decision.next_locked {
        actions::ACCOUNT_LOCKED
    } else {
        actions::ACCOUNT_UNLOCKED
    };

    let entry = AuditChain::append_in(
        &mut *conn,
        &updated.tenant_id,
        actor_id,
        action,
        json!({
            "accountId": updated.id,
            "obligationType": updated.obligation_type,
            "balanceMinorUnits": updated.balance_minor_units,
            "requiredMinorUnits": required,
            "shortfallMinorUnits": updated.shortfall_against(required),
            "triggerAmountMinorUnits": trigger_amount,
        }),
    )
    .await?;

    if decision.next_locked {
        tracing::warn!(
            tenant_id = %updated.tenant_id,
            obligation = %updated.obligation_type,
            balance = updated.balance_minor_units.value(),
            required = required.value(),
            "Designated account locked: balance below required"
        );
    } else {
        tracing::info!(
            tenant_id = %updated.tenant_id,
            obligation = %updated.obligation_type,
            balance = updated.balance_minor_units.value(),
            required = required.value(),
            "Designated account unlocked: coverage restored"
        );
    }

    Ok(Enforcement {
        account: updated,
        decision,
        required,
        audit_entry: Some(entry),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use apgms_core::ObligationType;
    use chrono::Utc;

    fn account(balance: i64, locked: bool) -> DesignatedAccount {
        let now = Utc::now();
        DesignatedAccount {
            id: "acct-1".to_string(),
            tenant_id: "org-1".to_string(),
            obligation_type: ObligationType::Paygw,
            balance_minor_units: MinorUnits::new(balance).unwrap(),
            locked,
            locked_at: None,
            last_reconciled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn required(value: i64) -> MinorUnits {
        MinorUnits::new(value).unwrap()
    }

    #[test]
    fn test_boundary_is_unlocked() {
        let decision = evaluate(&account(10_000, true), required(10_000));
        assert!(!decision.next_locked);
        assert!(decision.changed);
    }

    #[test]
    fn test_one_below_is_locked() {
        let decision = evaluate(&account(9_999, false), required(10_000));
        assert!(decision.next_locked);
        assert!(decision.changed);
    }

    #[test]
    fn test_unchanged_state() {
        assert!(!evaluate(&account(9_999, true), required(10_000)).changed);
        assert!(!evaluate(&account(20_000, false), required(10_000)).changed);
    }

    #[test]
    fn test_zero_required_never_locks() {
        let decision = evaluate(&account(0, false), MinorUnits::ZERO);
        assert!(!decision.next_locked);
        assert!(!decision.changed);
    }
}
