//! Persistent store
//!
//! `LoanStore` is the single source of truth for which side effects have
//! already happened. Loan writes are guarded on the status and version that
//! were read; a guard miss surfaces as `StoreError::StaleState`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::loan::{Loan, LoanStatus};
use crate::models::{
    AccountId, Asset, AssetStatus, AssetUpdate, AttemptStatus, ExternalAttempt, ExternalOperation,
    LifecycleEvent, Reputation,
};

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgLoanStore;

/// Persistence errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("loan {loan_id} is no longer {expected} at version {version}")]
    StaleState {
        loan_id: Uuid,
        expected: LoanStatus,
        version: i64,
    },

    #[error("asset {asset_id} is no longer {expected:?}")]
    AssetChanged {
        asset_id: Uuid,
        expected: AssetStatus,
    },

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// One guarded loan transition and everything that commits with it
#[derive(Debug, Clone)]
pub struct Transition {
    /// Loan as it must be written; its version is one past the version read
    pub loan: Loan,
    /// Status the loan had when it was read
    pub expected_status: LoanStatus,
    pub asset: Option<AssetUpdate>,
    pub reputations: Vec<Reputation>,
    pub event: LifecycleEvent,
}

impl Transition {
    pub fn expected_version(&self) -> i64 {
        self.loan.version - 1
    }
}

#[async_trait]
pub trait LoanStore: Send + Sync {
    async fn get_loan(&self, id: Uuid) -> Result<Loan, StoreError>;

    async fn get_asset(&self, id: Uuid) -> Result<Asset, StoreError>;

    /// Current reputation, or a fresh one for an account with no history
    async fn get_reputation(&self, account: AccountId) -> Result<Reputation, StoreError>;

    /// Address of the account on the settlement network, if registered
    async fn settlement_address(&self, account: AccountId) -> Result<Option<String>, StoreError>;

    /// Insert an `Open` loan and collateralize its asset, guarded on the
    /// asset status that was read
    async fn create_loan(
        &self,
        loan: &Loan,
        expected_asset_status: AssetStatus,
        event: &LifecycleEvent,
    ) -> Result<(), StoreError>;

    /// Commit a transition atomically
    async fn apply_transition(&self, transition: &Transition) -> Result<(), StoreError>;

    async fn append_event(&self, event: &LifecycleEvent) -> Result<(), StoreError>;

    /// Record that `event_id` was mirrored to the external ledger
    async fn record_mirror(&self, event_id: Uuid, receipt: &str) -> Result<(), StoreError>;

    /// Events with no mirror receipt yet, oldest first
    async fn unmirrored_events(&self, limit: i64) -> Result<Vec<LifecycleEvent>, StoreError>;

    /// Journal an external call before it is issued
    async fn record_attempt(&self, attempt: &ExternalAttempt) -> Result<(), StoreError>;

    async fn resolve_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        resolved_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Close every still-open attempt of `operation` against `reference`.
    /// Returns how many were closed.
    async fn resolve_open_attempts(
        &self,
        operation: ExternalOperation,
        reference: &str,
        status: AttemptStatus,
        resolved_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Operator close-out of one open attempt after out-of-band
    /// reconciliation; `note` is kept in the attempt's detail
    async fn close_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        note: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<ExternalAttempt, StoreError>;

    /// Oldest `limit` attempts still `Started` or marked `Unresolved`,
    /// created before `before`
    async fn unresolved_attempts(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExternalAttempt>, StoreError>;

    /// Whether `reference` already settled a verified payment
    async fn settled_reference_exists(&self, reference: &str) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
