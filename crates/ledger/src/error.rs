//! Ledger errors

use thiserror::Error;

/// Errors that can occur in ledger operations
///
/// Every variant has a stable machine-readable [`code`](LedgerError::code) so
/// callers can tell "retry with backoff" apart from "stop, this is a bug".
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Contribution amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("Idempotency key is required")]
    MissingIdempotencyKey,

    #[error("Idempotency key '{key}' was already used with a different payload")]
    IdempotencyKeyConflict { tenant_id: String, key: String },

    #[error("Idempotency key '{key}' is still being processed")]
    KeyInFlight { tenant_id: String, key: String },

    #[error("Banking partner balance unavailable for tenant {tenant_id}: {reason}")]
    ExternalBalanceUnavailable { tenant_id: String, reason: String },

    #[error("Audit chain integrity violation for tenant {tenant_id}: {reason}")]
    AuditChainIntegrityViolation {
        tenant_id: String,
        broken_at_entry_id: Option<String>,
        reason: String,
    },

    #[error("Audit chain head for tenant {0} moved during append")]
    ChainContention(String),

    #[error("Balance overflow on account {0}")]
    BalanceOverflow(String),

    #[error("Corrupt ledger record: {0}")]
    CorruptRecord(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Stable error code for clients and logs
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::MissingIdempotencyKey => "missing_idempotency_key",
            LedgerError::IdempotencyKeyConflict { .. } => "idempotency_key_conflict",
            LedgerError::KeyInFlight { .. } => "key_in_flight",
            LedgerError::ExternalBalanceUnavailable { .. } => "external_balance_unavailable",
            LedgerError::AuditChainIntegrityViolation { .. } => "audit_chain_integrity_violation",
            LedgerError::ChainContention(_) => "chain_contention",
            LedgerError::BalanceOverflow(_) => "balance_overflow",
            LedgerError::CorruptRecord(_) => "corrupt_record",
            LedgerError::Database(_) => "database_error",
            LedgerError::Serialization(_) => "serialization_error",
        }
    }

    /// Suggested HTTP status for an API layer
    pub fn status_hint(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount(_) | LedgerError::MissingIdempotencyKey => 400,
            LedgerError::IdempotencyKeyConflict { .. } | LedgerError::KeyInFlight { .. } => 409,
            LedgerError::AuditChainIntegrityViolation { .. } => 423,
            LedgerError::BalanceOverflow(_) => 422,
            LedgerError::ExternalBalanceUnavailable { .. } | LedgerError::ChainContention(_) => 503,
            LedgerError::CorruptRecord(_)
            | LedgerError::Database(_)
            | LedgerError::Serialization(_) => 500,
        }
    }

    /// Whether the same request may succeed if retried after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::KeyInFlight { .. }
                | LedgerError::ChainContention(_)
                | LedgerError::ExternalBalanceUnavailable { .. }
        )
    }

    /// True when the underlying database rejected a duplicate key
    pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
        match error {
            sqlx::Error::Database(db) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let in_flight = LedgerError::KeyInFlight {
            tenant_id: "org-1".to_string(),
            key: "k".to_string(),
        };
        let conflict = LedgerError::IdempotencyKeyConflict {
            tenant_id: "org-1".to_string(),
            key: "k".to_string(),
        };

        assert!(in_flight.is_retryable());
        assert!(!conflict.is_retryable());
        assert!(LedgerError::ChainContention("org-1".to_string()).is_retryable());
        assert!(!LedgerError::InvalidAmount(0).is_retryable());
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(LedgerError::InvalidAmount(-5).code(), "invalid_amount");
        assert_eq!(LedgerError::MissingIdempotencyKey.status_hint(), 400);

        let violation = LedgerError::AuditChainIntegrityViolation {
            tenant_id: "org-1".to_string(),
            broken_at_entry_id: None,
            reason: "quarantined".to_string(),
        };
        assert_eq!(violation.code(), "audit_chain_integrity_violation");
        assert_eq!(violation.status_hint(), 423);
    }
}
