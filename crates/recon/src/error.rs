//! Reconciliation errors

use apgms_core::ObligationType;
use apgms_ledger::LedgerError;
use thiserror::Error;

/// Errors reported by a banking partner adapter
#[derive(Debug, Error)]
pub enum BankingError {
    #[error("Banking partner unreachable: {0}")]
    Unavailable(String),

    #[error("No balance reported for {tenant_id}/{obligation}")]
    UnknownAccount {
        tenant_id: String,
        obligation: ObligationType,
    },

    #[error("Transfer block rejected: {0}")]
    BlockRejected(String),

    #[error("Snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Why one tenant's reconciliation failed
#[derive(Debug, Error)]
pub enum ReconError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Reconciliation task for tenant {tenant_id} aborted: {reason}")]
    TaskAborted { tenant_id: String, reason: String },
}

impl ReconError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            ReconError::Ledger(e) => e.code(),
            ReconError::TaskAborted { .. } => "task_aborted",
        }
    }

    /// Whether the next scheduled run may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconError::Ledger(e) => e.is_retryable(),
            ReconError::TaskAborted { .. } => true,
        }
    }
}
