//! Loan models for ParcelVault
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::Validate;

use crate::models::AccountId;
use crate::settlement::TxRef;

/// Loan status enum
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "loan_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Open,
    Active, // Funded
    Repaid,
    Defaulted, // Carried for historical rows; no transition produces it
    Liquidated,
    Cancelled,
}

impl LoanStatus {
    /// Legal edges of the loan lifecycle
    pub fn can_transition_to(self, next: LoanStatus) -> bool {
        matches!(
            (self, next),
            (LoanStatus::Open, LoanStatus::Active)
                | (LoanStatus::Open, LoanStatus::Cancelled)
                | (LoanStatus::Active, LoanStatus::Repaid)
                | (LoanStatus::Active, LoanStatus::Liquidated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Open => "open",
            LoanStatus::Active => "active",
            LoanStatus::Repaid => "repaid",
            LoanStatus::Defaulted => "defaulted",
            LoanStatus::Liquidated => "liquidated",
            LoanStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loan model
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq)]
pub struct Loan {
    pub id: Uuid,
    pub borrower_id: AccountId,
    pub lender_id: Option<AccountId>,
    pub asset_id: Uuid,
    pub principal: i64,         // minor units
    pub interest_rate_bps: i32, // annual, basis points
    pub duration_days: i32,
    pub grace_period_days: i32,
    pub ltv_bps: i32,
    pub express: bool,
    pub status: LoanStatus,
    /// Bumped on every transition; paired with `status` as the write guard
    pub version: i64,
    pub funded_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terms requested when opening a loan
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoanTerms {
    #[validate(range(min = 1))]
    pub principal: i64,
    #[validate(range(min = 0))]
    pub interest_rate_bps: i32,
    #[validate(range(min = 1))]
    pub duration_days: i32,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub grace_period_days: i32,
    /// Platform-funded loan that needs no counterparty payment
    #[serde(default)]
    pub express: bool,
}

/// Amount owed to close an active loan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepaymentQuote {
    pub principal: i64,
    pub interest: i64,
    pub total: i64,
    pub elapsed_months: i64,
}

/// Request to open a new loan
#[derive(Debug, Deserialize, Validate)]
pub struct OpenLoanRequest {
    pub borrower_id: AccountId,
    pub asset_id: Uuid,
    #[validate]
    pub terms: LoanTerms,
}

/// Request to fund an open loan
#[derive(Debug, Default, Deserialize)]
pub struct FundLoanRequest {
    /// Omitted for express loans, which the platform funds
    pub lender_id: Option<AccountId>,
    /// Existing transfer to verify instead of submitting a new one
    pub payment_reference: Option<TxRef>,
}

/// Request to repay an active loan
#[derive(Debug, Deserialize)]
pub struct RepayLoanRequest {
    pub payer_id: AccountId,
    pub payment_reference: Option<TxRef>,
}

/// Request to claim the collateral of an overdue loan
#[derive(Debug, Deserialize)]
pub struct ClaimCollateralRequest {
    pub claimant_id: AccountId,
}

/// Request to cancel an unfunded loan
#[derive(Debug, Deserialize)]
pub struct CancelLoanRequest {
    pub requester_id: AccountId,
}

/// Result of a repayment
#[derive(Debug, Clone, Serialize)]
pub struct RepaymentReceipt {
    pub loan: Loan,
    pub total_owed: i64,
    pub quote: RepaymentQuote,
    pub tx_ref: TxRef,
}
