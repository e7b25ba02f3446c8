//! Balance reader backed by a JSON snapshot file
//!
//! Format: `{ "<tenant>": { "PAYGW": 480000, "GST": 12000 } }`. Lets an
//! operator dry-run reconciliation against a statement export.

use crate::banking::BankingBalanceReader;
use crate::error::BankingError;
use apgms_core::{DesignatedAccount, ObligationType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

pub struct SnapshotBalanceReader {
    balances: HashMap<(String, ObligationType), i64>,
}

impl SnapshotBalanceReader {
    /// Load a snapshot file
    pub fn from_file(path: &Path) -> Result<Self, BankingError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse snapshot JSON; obligation codes accept the same spellings as everywhere else
    pub fn from_json(json: &str) -> Result<Self, BankingError> {
        let raw: HashMap<String, HashMap<String, i64>> = serde_json::from_str(json)?;
        let mut balances = HashMap::new();

        for (tenant_id, accounts) in raw {
            for (code, balance) in accounts {
                let obligation = ObligationType::parse_code(&code).map_err(|e| {
                    BankingError::Unavailable(format!("snapshot for {}: {}", tenant_id, e))
                })?;
                balances.insert((tenant_id.clone(), obligation), balance);
            }
        }

        Ok(Self { balances })
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}

#[async_trait]
impl BankingBalanceReader for SnapshotBalanceReader {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn get_balance(&self, account: &DesignatedAccount) -> Result<i64, BankingError> {
        self.balances
            .get(&(account.tenant_id.clone(), account.obligation_type))
            .copied()
            .ok_or_else(|| BankingError::UnknownAccount {
                tenant_id: account.tenant_id.clone(),
                obligation: account.obligation_type,
            })
    }
}
