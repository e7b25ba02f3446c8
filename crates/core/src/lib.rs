//! APGMS Core - Domain types
//!
//! This crate contains the fundamental types shared by the designated account ledger:
//! - `MinorUnits`: Non-negative integer money in minor units (cents)
//! - `ObligationType`: The tax obligation a designated account backs
//! - `ContributionSource`: Where an inbound funding event came from
//! - `DesignatedAccount`: Snapshot of one tenant's reserve for one obligation

pub mod account;
pub mod amount;
pub mod obligation;

pub use account::DesignatedAccount;
pub use amount::{AmountError, MinorUnits};
pub use obligation::{ContributionSource, ObligationError, ObligationType};
