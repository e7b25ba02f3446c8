//! APGMS Reconciliation
//!
//! Compares each tenant's designated account balances with the banking
//! partner's view and records the result as an immutable, hashed artifact.
//!
//! - `banking`: the partner capability plus a ledger-mirroring default
//! - `job`: one run over one tenant or all of them
//! - `scheduler`: periodic runs with cooperative shutdown

pub mod artifact;
pub mod banking;
pub mod error;
pub mod job;
pub mod mock;
pub mod scheduler;
pub mod snapshot;

pub use artifact::{ArtifactRepo, ReconciliationArtifact, ReconciliationLine, ReconciliationStatus};
pub use banking::{BankingBalanceReader, LedgerMirrorReader};
pub use error::{BankingError, ReconError};
pub use job::{ReconciliationJob, RunSummary, TenantOutcome, COMPLETED_SUBJECT, SHORTFALL_SUBJECT};
pub use mock::StaticBalanceReader;
pub use scheduler::ReconciliationScheduler;
pub use snapshot::SnapshotBalanceReader;
