//! Designated account snapshot

use crate::amount::MinorUnits;
use crate::obligation::ObligationType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One tenant's reserve for one obligation type.
///
/// Accounts are created lazily on the first contribution for a
/// `(tenant_id, obligation_type)` pair and never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignatedAccount {
    pub id: String,
    pub tenant_id: String,
    pub obligation_type: ObligationType,
    pub balance_minor_units: MinorUnits,
    /// True while the balance does not cover the required amount
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DesignatedAccount {
    /// Amount still missing to cover `required`, zero when covered
    pub fn shortfall_against(&self, required: MinorUnits) -> MinorUnits {
        required
            .checked_sub(self.balance_minor_units)
            .unwrap_or(MinorUnits::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(balance: i64) -> DesignatedAccount {
        let now = Utc::now();
        DesignatedAccount {
            id: "acct-1".to_string(),
            tenant_id: "org-1".to_string(),
            obligation_type: ObligationType::Paygw,
            balance_minor_units: MinorUnits::new(balance).unwrap(),
            locked: false,
            locked_at: None,
            last_reconciled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_shortfall() {
        let required = MinorUnits::new(10_000).unwrap();
        assert_eq!(account(9_999).shortfall_against(required).value(), 1);
        assert!(account(10_000).shortfall_against(required).is_zero());
        assert!(account(12_000).shortfall_against(required).is_zero());
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(account(5)).unwrap();
        assert_eq!(json["tenantId"], "org-1");
        assert_eq!(json["obligationType"], "PAYGW");
        assert_eq!(json["balanceMinorUnits"], 5);
    }
}
