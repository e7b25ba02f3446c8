//! Obligation types and contribution sources
//!
//! Both sets are fixed and small, so they are enums rather than strings.
//! The string forms are what gets persisted and hashed.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Errors that can occur when parsing obligation-related codes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObligationError {
    #[error("Unsupported obligation type: {0}")]
    UnknownObligation(String),

    #[error("Unsupported contribution source: {0}")]
    UnknownSource(String),
}

/// The category of tax liability a designated account backs
///
/// # Examples
/// ```
/// use apgms_core::ObligationType;
///
/// let paygw: ObligationType = "PAYGW".parse().unwrap();
/// assert_eq!(paygw, ObligationType::Paygw);
/// assert_eq!(ObligationType::Gst.to_string(), "GST");
///
/// // Legacy buffer names are accepted on input
/// let gst: ObligationType = "GST_BUFFER".parse().unwrap();
/// assert_eq!(gst, ObligationType::Gst);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString, EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum ObligationType {
    /// Pay-as-you-go withholding from payroll
    #[serde(rename = "PAYGW", alias = "PAYGW_BUFFER")]
    #[strum(to_string = "PAYGW", serialize = "PAYGW_BUFFER")]
    Paygw,

    /// Goods and services tax collected at point of sale
    #[serde(rename = "GST", alias = "GST_BUFFER")]
    #[strum(to_string = "GST", serialize = "GST_BUFFER")]
    Gst,
}

impl ObligationType {
    /// Persisted code
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationType::Paygw => "PAYGW",
            ObligationType::Gst => "GST",
        }
    }

    /// Parse a persisted or user-supplied code
    pub fn parse_code(code: &str) -> Result<Self, ObligationError> {
        code.parse()
            .map_err(|_| ObligationError::UnknownObligation(code.to_string()))
    }

    /// Source assumed when a contribution does not name one
    pub fn default_source(&self) -> ContributionSource {
        match self {
            ObligationType::Paygw => ContributionSource::PayrollSystem,
            ObligationType::Gst => ContributionSource::PosSystem,
        }
    }
}

/// Where an inbound contribution was captured
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContributionSource {
    /// Withholding captured from a payroll run
    PayrollSystem,
    /// GST captured from point-of-sale takings
    PosSystem,
    /// Operator-entered top-up
    Manual,
}

impl ContributionSource {
    /// Persisted code
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionSource::PayrollSystem => "payroll_system",
            ContributionSource::PosSystem => "pos_system",
            ContributionSource::Manual => "manual",
        }
    }

    /// Parse a persisted or user-supplied code
    pub fn parse_code(code: &str) -> Result<Self, ObligationError> {
        code.parse()
            .map_err(|_| ObligationError::UnknownSource(code.to_string()))
    }
}
