//! Banking partner capability
//!
//! Adapters are partner-specific. The job only needs to read a balance and,
//! on a shortfall, ask the partner to stop outbound transfers.

use crate::error::BankingError;
use apgms_core::{DesignatedAccount, MinorUnits};
use async_trait::async_trait;

/// Reads the partner's authoritative balance for a designated account
#[async_trait]
pub trait BankingBalanceReader: Send + Sync {
    /// Adapter name (for logging)
    fn name(&self) -> &str;

    /// Balance held at the bank, in minor units; may be negative (overdrawn)
    async fn get_balance(&self, account: &DesignatedAccount) -> Result<i64, BankingError>;

    /// Stop outbound transfers from the account until the shortfall is covered
    async fn block_transfer(
        &self,
        _account: &DesignatedAccount,
        _shortfall: MinorUnits,
    ) -> Result<(), BankingError> {
        Ok(())
    }
}

/// Reports the ledger's own balance
///
/// Used when no partner is configured; every run comes out balanced.
#[derive(Debug, Default, Clone, Copy)]
pub struct LedgerMirrorReader;

#[async_trait]
impl BankingBalanceReader for LedgerMirrorReader {
    fn name(&self) -> &str {
        "ledger_mirror"
    }

    async fn get_balance(&self, account: &DesignatedAccount) -> Result<i64, BankingError> {
        Ok(account.balance_minor_units.value())
    }
}
