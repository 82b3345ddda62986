//! Settlement models

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};

/// Minor units (cents) per network unit
pub const MINOR_UNITS_PER_UNIT: i64 = 100;

/// Convert an accounting amount (minor units) to network units
pub fn to_network_units(minor: i64) -> f64 {
    minor as f64 / MINOR_UNITS_PER_UNIT as f64
}

/// Opaque reference to a transfer on the settlement network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(pub String);

impl TxRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TxRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxRef {
    fn from(s: &str) -> Self {
        TxRef(s.to_string())
    }
}

/// Receipt status reported by the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Failure,
    /// Not yet terminal
    Unknown,
}

impl ReceiptStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReceiptStatus::Unknown)
    }
}

/// Detailed transfer record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub tx_ref: TxRef,
    /// Amount actually moved, in network units
    pub actual_amount: f64,
    pub from: String,
    pub to: String,
}

/// Transfer the verifier is asked to confirm
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedTransfer {
    pub tx_ref: TxRef,
    /// Expected amount in minor units
    pub amount: i64,
    pub payer: String,
    pub payee: String,
}

/// Verification outcome of the confirmation protocol
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// No terminal receipt inside the retry budget; the transfer may still land
    Pending,
    Confirmed {
        /// Receipt succeeded but the detailed record could not be read
        unverified_amount: bool,
    },
    Mismatched {
        expected_amount: f64,
        actual_amount: f64,
        reason: String,
    },
    Failed {
        reason: String,
    },
}

/// Transient record of one run of the confirmation protocol
#[derive(Debug, Clone, Serialize)]
pub struct SettlementRecord {
    pub expected: ExpectedTransfer,
    pub outcome: VerificationOutcome,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl SettlementRecord {
    pub fn is_confirmed(&self) -> bool {
        matches!(self.outcome, VerificationOutcome::Confirmed { .. })
    }
}
