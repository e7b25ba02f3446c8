//! In-memory balance reader for tests and fixtures
//!
//! Balances, failures and delays are configured per account or tenant.

use crate::banking::BankingBalanceReader;
use crate::error::BankingError;
use apgms_core::{DesignatedAccount, MinorUnits, ObligationType};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

type AccountKey = (String, ObligationType);

/// Static balance reader with programmable failures
#[derive(Default)]
pub struct StaticBalanceReader {
    balances: RwLock<HashMap<AccountKey, i64>>,
    failing: RwLock<HashSet<String>>,
    delays: RwLock<HashMap<String, Duration>>,
    blocked: RwLock<Vec<(String, ObligationType, MinorUnits)>>,
}

impl StaticBalanceReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bank-side balance of one account
    pub fn set_balance(&self, tenant_id: &str, obligation: ObligationType, balance: i64) {
        let mut balances = self.balances.write().unwrap_or_else(PoisonError::into_inner);
        balances.insert((tenant_id.to_string(), obligation), balance);
    }

    /// Make every read for the tenant fail as if the partner were down
    pub fn fail_tenant(&self, tenant_id: &str) {
        let mut failing = self.failing.write().unwrap_or_else(PoisonError::into_inner);
        failing.insert(tenant_id.to_string());
    }

    /// Delay every read for the tenant
    pub fn delay_tenant(&self, tenant_id: &str, delay: Duration) {
        let mut delays = self.delays.write().unwrap_or_else(PoisonError::into_inner);
        delays.insert(tenant_id.to_string(), delay);
    }

    /// Transfer blocks requested so far
    pub fn blocked(&self) -> Vec<(String, ObligationType, MinorUnits)> {
        self.blocked.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl BankingBalanceReader for StaticBalanceReader {
    fn name(&self) -> &str {
        "static"
    }

    async fn get_balance(&self, account: &DesignatedAccount) -> Result<i64, BankingError> {
        let delay = self
            .delays
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account.tenant_id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&account.tenant_id);
        if failing {
            return Err(BankingError::Unavailable(format!(
                "partner rejected balance read for {}",
                account.tenant_id
            )));
        }

        let balances = self.balances.read().unwrap_or_else(PoisonError::into_inner);
        balances
            .get(&(account.tenant_id.clone(), account.obligation_type))
            .copied()
            .ok_or_else(|| BankingError::UnknownAccount {
                tenant_id: account.tenant_id.clone(),
                obligation: account.obligation_type,
            })
    }

    async fn block_transfer(
        &self,
        account: &DesignatedAccount,
        shortfall: MinorUnits,
    ) -> Result<(), BankingError> {
        let mut blocked = self.blocked.write().unwrap_or_else(PoisonError::into_inner);
        blocked.push((account.tenant_id.clone(), account.obligation_type, shortfall));
        Ok(())
    }
}
