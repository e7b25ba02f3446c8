//! APGMS Ledger - Designated account ledger
//!
//! Ring-fences money owed to the tax authority in per-tenant, per-obligation
//! designated accounts.
//!
//! # Guarantees
//! - Every contribution is applied at most once per idempotency key
//! - Contributions for one account are serialized; other accounts run in parallel
//! - An account is locked exactly while its balance is below the required amount
//! - Every mutation lands in a per-tenant hash-chained audit log in the same
//!   transaction as the mutation itself

pub mod account;
pub mod audit;
pub mod config;
pub mod contribution;
pub mod coverage;
pub mod db;
pub mod error;
pub mod hash;
pub mod idempotency;
pub mod ingest;
pub mod locks;
pub mod service;

pub use account::AccountRepo;
pub use audit::{actions, AuditChain, AuditLogEntry, ChainVerification, Quarantine};
pub use config::{LedgerConfig, ReconciliationConfig};
pub use contribution::{ContributionRecord, ContributionRepo};
pub use coverage::{evaluate, CoverageDecision, Enforcement};
pub use error::{LedgerError, LedgerResult};
pub use idempotency::{BeginOutcome, CompletedResponse, IdempotencyClaim, IdempotencyStore, StoredResponse};
pub use ingest::{ContributionOutcome, ContributionReceipt, ContributionRequest, Ingestor};
pub use locks::{KeyedLocks, LedgerLocks};
pub use service::Ledger;
