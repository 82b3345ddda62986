//! Data models for the ParcelVault settlement engine

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

/// Account holders are identified by UUID, like users in the rest of the system.
pub type AccountId = Uuid;

/// Lender recorded on express loans, which the platform funds itself.
pub const PLATFORM_ACCOUNT_ID: AccountId = Uuid::nil();

/// Tokenized parcel model
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Asset {
    pub id: Uuid,
    pub owner_id: AccountId,
    pub custody_token_id: Option<String>, // Present once minted on the settlement network
    pub value: i64,                       // Appraised value in minor units (cents)
    pub status: AssetStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    /// Whether the asset may be pledged as collateral for a new loan.
    pub fn is_pledgeable(&self) -> bool {
        match self.status {
            AssetStatus::Listed => true,
            AssetStatus::Draft => self.custody_token_id.is_some(),
            AssetStatus::Collateralized | AssetStatus::Sold => false,
        }
    }
}

/// Asset lifecycle status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "asset_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Draft,
    Listed,
    Collateralized,
    Sold,
}

/// Local change applied to the collateral asset alongside a loan transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUpdate {
    pub asset_id: Uuid,
    pub status: AssetStatus,
    /// New owner, when the transition moves ownership (collateral claim)
    pub owner_id: Option<AccountId>,
}

/// Counterparty trust attributes
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone, PartialEq, Eq)]
pub struct Reputation {
    pub account_id: AccountId,
    pub completed_loans: i32,
    pub defaulted_loans: i32,
    pub verified_transactions: i32,
    pub score: i32, // 0-1000, higher is better
    pub risk_tier: RiskTier,
    pub updated_at: DateTime<Utc>,
}

impl Reputation {
    /// Starting reputation for an account with no history
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            completed_loans: 0,
            defaulted_loans: 0,
            verified_transactions: 0,
            score: crate::reputation::DEFAULT_SCORE,
            risk_tier: RiskTier::Medium,
            updated_at: Utc::now(),
        }
    }
}

/// Coarse risk tier
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "risk_tier", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// Lifecycle event types recorded locally and mirrored to the external ledger
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "lifecycle_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    LoanOpened,
    LoanFunded,
    LoanRepaid,
    LoanLiquidated,
    LoanCancelled,
    ReconciliationRequired,
}

/// Immutable append-only lifecycle fact
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub event_type: LifecycleEventType,
    pub loan_id: Option<Uuid>,
    pub asset_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub digest: String, // hex SHA-256 over the event content, idempotency key for the mirror
    pub created_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        event_type: LifecycleEventType,
        loan_id: Option<Uuid>,
        asset_id: Option<Uuid>,
        metadata: serde_json::Value,
    ) -> Self {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let digest = crate::ledger::event_digest(id, event_type, loan_id, asset_id, &metadata);
        Self {
            id,
            event_type,
            loan_id,
            asset_id,
            metadata,
            digest,
            created_at,
        }
    }
}

/// External operations journaled before they are issued
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "external_operation", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExternalOperation {
    CustodyLock,
    CustodyRelease,
    CustodyTransfer,
    TransferSubmit,
    SettlementVerify,
}

/// Resolution of a journaled external attempt
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "attempt_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Started,
    Succeeded,
    Failed,
    Compensated,
    /// External effect may or may not have happened; needs an operator
    Unresolved,
}

impl AttemptStatus {
    /// Still waiting on a resolution
    pub fn is_open(&self) -> bool {
        matches!(self, AttemptStatus::Started | AttemptStatus::Unresolved)
    }
}

/// Journal entry written before every external call
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct ExternalAttempt {
    pub id: Uuid,
    pub loan_id: Uuid,
    pub operation: ExternalOperation,
    pub reference: String, // custody token id or transaction reference
    pub detail: serde_json::Value,
    pub status: AttemptStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ExternalAttempt {
    pub fn start(
        loan_id: Uuid,
        operation: ExternalOperation,
        reference: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            loan_id,
            operation,
            reference: reference.into(),
            detail,
            status: AttemptStatus::Started,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}
