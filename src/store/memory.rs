//! In-memory store
//!
//! Same guard semantics as the PostgreSQL store, kept behind one mutex so
//! each operation is atomic. Backs the test suites, which can queue write
//! failures to exercise the reconciliation paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{LoanStore, StoreError, Transition};
use crate::loan::Loan;
use crate::models::{
    AccountId, Asset, AssetStatus, AttemptStatus, ExternalAttempt, ExternalOperation,
    LifecycleEvent, Reputation,
};

#[derive(Default)]
struct MemoryState {
    settlement_addresses: HashMap<AccountId, String>,
    assets: HashMap<Uuid, Asset>,
    loans: HashMap<Uuid, Loan>,
    reputations: HashMap<AccountId, Reputation>,
    events: Vec<LifecycleEvent>,
    mirrors: HashMap<Uuid, String>,
    attempts: Vec<ExternalAttempt>,
    fail_transitions: u32,
    fail_event_appends: u32,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register_account(&self, account: AccountId, settlement_address: &str) {
        self.lock_state()
            .settlement_addresses
            .insert(account, settlement_address.to_string());
    }

    pub fn insert_asset(&self, asset: Asset) {
        self.lock_state().assets.insert(asset.id, asset);
    }

    pub fn insert_loan(&self, loan: Loan) {
        self.lock_state().loans.insert(loan.id, loan);
    }

    /// Fail the next `count` calls to `apply_transition` without writing
    pub fn fail_next_transitions(&self, count: u32) {
        self.lock_state().fail_transitions = count;
    }

    /// Fail the next `count` calls to `append_event`
    pub fn fail_next_event_appends(&self, count: u32) {
        self.lock_state().fail_event_appends = count;
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.lock_state().events.clone()
    }

    pub fn attempts(&self) -> Vec<ExternalAttempt> {
        self.lock_state().attempts.clone()
    }

    pub fn is_mirrored(&self, event_id: Uuid) -> bool {
        self.lock_state().mirrors.contains_key(&event_id)
    }
}

#[async_trait]
impl LoanStore for InMemoryStore {
    async fn get_loan(&self, id: Uuid) -> Result<Loan, StoreError> {
        self.lock_state()
            .loans
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "loan", id })
    }

    async fn get_asset(&self, id: Uuid) -> Result<Asset, StoreError> {
        self.lock_state()
            .assets
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "asset", id })
    }

    async fn get_reputation(&self, account: AccountId) -> Result<Reputation, StoreError> {
        Ok(self
            .lock_state()
            .reputations
            .get(&account)
            .cloned()
            .unwrap_or_else(|| Reputation::new(account)))
    }

    async fn settlement_address(&self, account: AccountId) -> Result<Option<String>, StoreError> {
        Ok(self.lock_state().settlement_addresses.get(&account).cloned())
    }

    async fn create_loan(
        &self,
        loan: &Loan,
        expected_asset_status: AssetStatus,
        event: &LifecycleEvent,
    ) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        let asset = state
            .assets
            .get_mut(&loan.asset_id)
            .filter(|asset| asset.status == expected_asset_status)
            .ok_or(StoreError::AssetChanged {
                asset_id: loan.asset_id,
                expected: expected_asset_status,
            })?;
        asset.status = AssetStatus::Collateralized;
        asset.updated_at = loan.created_at;

        state.loans.insert(loan.id, loan.clone());
        state.events.push(event.clone());
        Ok(())
    }

    async fn apply_transition(&self, transition: &Transition) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        if state.fail_transitions > 0 {
            state.fail_transitions -= 1;
            return Err(StoreError::Database("simulated write failure".to_string()));
        }

        let loan = &transition.loan;
        let current = state.loans.get(&loan.id);
        let guard_holds = current.map_or(false, |current| {
            current.status == transition.expected_status
                && current.version == transition.expected_version()
        });
        if !guard_holds {
            return Err(StoreError::StaleState {
                loan_id: loan.id,
                expected: transition.expected_status,
                version: transition.expected_version(),
            });
        }

        state.loans.insert(loan.id, loan.clone());
        if let Some(update) = &transition.asset {
            if let Some(asset) = state.assets.get_mut(&update.asset_id) {
                asset.status = update.status;
                if let Some(owner) = update.owner_id {
                    asset.owner_id = owner;
                }
                asset.updated_at = loan.updated_at;
            }
        }
        for reputation in &transition.reputations {
            state
                .reputations
                .insert(reputation.account_id, reputation.clone());
        }
        state.events.push(transition.event.clone());
        Ok(())
    }

    async fn append_event(&self, event: &LifecycleEvent) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        if state.fail_event_appends > 0 {
            state.fail_event_appends -= 1;
            return Err(StoreError::Database("simulated write failure".to_string()));
        }
        state.events.push(event.clone());
        Ok(())
    }

    async fn record_mirror(&self, event_id: Uuid, receipt: &str) -> Result<(), StoreError> {
        self.lock_state()
            .mirrors
            .entry(event_id)
            .or_insert_with(|| receipt.to_string());
        Ok(())
    }

    async fn unmirrored_events(&self, limit: i64) -> Result<Vec<LifecycleEvent>, StoreError> {
        let state = self.lock_state();
        let mirrored: HashSet<&Uuid> = state.mirrors.keys().collect();
        Ok(state
            .events
            .iter()
            .filter(|event| !mirrored.contains(&event.id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_attempt(&self, attempt: &ExternalAttempt) -> Result<(), StoreError> {
        self.lock_state().attempts.push(attempt.clone());
        Ok(())
    }

    async fn resolve_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        resolved_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        if let Some(attempt) = state.attempts.iter_mut().find(|a| a.id == attempt_id) {
            attempt.status = status;
            attempt.resolved_at = (status != AttemptStatus::Unresolved).then_some(resolved_at);
        }
        Ok(())
    }

    async fn resolve_open_attempts(
        &self,
        operation: ExternalOperation,
        reference: &str,
        status: AttemptStatus,
        resolved_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock_state();
        let mut closed = 0;
        for attempt in state.attempts.iter_mut().filter(|a| {
            a.status.is_open() && a.operation == operation && a.reference == reference
        }) {
            attempt.status = status;
            attempt.resolved_at = (status != AttemptStatus::Unresolved).then_some(resolved_at);
            closed += 1;
        }
        Ok(closed)
    }

    async fn close_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        note: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<ExternalAttempt, StoreError> {
        let mut state = self.lock_state();
        let attempt = state
            .attempts
            .iter_mut()
            .find(|a| a.id == attempt_id && a.status.is_open())
            .ok_or(StoreError::NotFound {
                entity: "open attempt",
                id: attempt_id,
            })?;
        attempt.status = status;
        attempt.resolved_at = Some(resolved_at);
        if let Some(detail) = attempt.detail.as_object_mut() {
            detail.insert("resolution_note".to_string(), note.into());
        }
        Ok(attempt.clone())
    }

    async fn unresolved_attempts(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExternalAttempt>, StoreError> {
        let mut open: Vec<ExternalAttempt> = self
            .lock_state()
            .attempts
            .iter()
            .filter(|a| a.status.is_open() && a.created_at < before)
            .cloned()
            .collect();
        open.sort_by_key(|a| a.created_at);
        open.truncate(limit.max(0) as usize);
        Ok(open)
    }

    async fn settled_reference_exists(&self, reference: &str) -> Result<bool, StoreError> {
        Ok(self.lock_state().attempts.iter().any(|a| {
            a.operation == ExternalOperation::SettlementVerify
                && a.status == AttemptStatus::Succeeded
                && a.reference == reference
        }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loan::{LoanStateMachine, LoanTerms, LoanStatus};
    use crate::models::LifecycleEventType;

    fn seeded() -> (InMemoryStore, Asset, Loan) {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let asset = Asset {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            custody_token_id: Some("T1".to_string()),
            value: 10_000_000,
            status: AssetStatus::Listed,
            created_at: now,
            updated_at: now,
        };
        store.insert_asset(asset.clone());
        let terms = LoanTerms {
            principal: 1_000_000,
            interest_rate_bps: 850,
            duration_days: 30,
            grace_period_days: 0,
            express: false,
        };
        let loan = LoanStateMachine::default()
            .open(asset.owner_id, &asset, &terms, now)
            .unwrap();
        (store, asset, loan)
    }

    fn event(loan: &Loan) -> LifecycleEvent {
        LifecycleEvent::new(
            LifecycleEventType::LoanOpened,
            Some(loan.id),
            Some(loan.asset_id),
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn test_create_loan_is_guarded_on_asset_status() {
        let (store, asset, loan) = seeded();
        store
            .create_loan(&loan, AssetStatus::Listed, &event(&loan))
            .await
            .unwrap();
        assert_eq!(
            store.get_asset(asset.id).await.unwrap().status,
            AssetStatus::Collateralized
        );

        let second = Loan {
            id: Uuid::new_v4(),
            ..loan.clone()
        };
        assert!(matches!(
            store.create_loan(&second, AssetStatus::Listed, &event(&second)).await,
            Err(StoreError::AssetChanged { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_transition_is_refused() {
        let (store, _, loan) = seeded();
        store
            .create_loan(&loan, AssetStatus::Listed, &event(&loan))
            .await
            .unwrap();

        let machine = LoanStateMachine::default();
        let cancelled = machine.cancel(&loan, loan.borrower_id, Utc::now()).unwrap();
        let transition = Transition {
            loan: cancelled,
            expected_status: LoanStatus::Open,
            asset: None,
            reputations: vec![],
            event: event(&loan),
        };
        store.apply_transition(&transition).await.unwrap();

        assert!(matches!(
            store.apply_transition(&transition).await,
            Err(StoreError::StaleState { .. })
        ));
        assert_eq!(
            store.get_loan(loan.id).await.unwrap().status,
            LoanStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_injected_failure_writes_nothing() {
        let (store, _, loan) = seeded();
        store.insert_loan(loan.clone());
        store.fail_next_transitions(1);

        let cancelled = LoanStateMachine::default()
            .cancel(&loan, loan.borrower_id, Utc::now())
            .unwrap();
        let transition = Transition {
            loan: cancelled,
            expected_status: LoanStatus::Open,
            asset: None,
            reputations: vec![],
            event: event(&loan),
        };
        assert!(matches!(
            store.apply_transition(&transition).await,
            Err(StoreError::Database(_))
        ));
        assert_eq!(store.get_loan(loan.id).await.unwrap().status, LoanStatus::Open);
        store.apply_transition(&transition).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_attempts_close_by_reference_or_by_operator() {
        let store = InMemoryStore::new();
        let loan_id = Uuid::new_v4();
        let verify = |reference: &str| {
            ExternalAttempt::start(
                loan_id,
                ExternalOperation::SettlementVerify,
                reference,
                serde_json::json!({}),
            )
        };
        let first = verify("tx1");
        let second = verify("tx1");
        let other = verify("tx2");
        for attempt in [&first, &second, &other] {
            store.record_attempt(attempt).await.unwrap();
        }
        store
            .resolve_attempt(first.id, AttemptStatus::Unresolved, Utc::now())
            .await
            .unwrap();

        let closed = store
            .resolve_open_attempts(
                ExternalOperation::SettlementVerify,
                "tx1",
                AttemptStatus::Succeeded,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(closed, 2);

        let later = Utc::now() + chrono::Duration::minutes(1);
        let open = store.unresolved_attempts(later, 10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, other.id);

        let closed = store
            .close_attempt(other.id, AttemptStatus::Failed, "never broadcast", Utc::now())
            .await
            .unwrap();
        assert_eq!(closed.status, AttemptStatus::Failed);
        assert_eq!(closed.detail["resolution_note"], "never broadcast");
        assert!(store.unresolved_attempts(later, 10).await.unwrap().is_empty());

        // Already closed
        assert!(matches!(
            store
                .close_attempt(other.id, AttemptStatus::Failed, "again", Utc::now())
                .await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unmirrored_events_skip_mirrored_ones() {
        let (store, _, loan) = seeded();
        let first = event(&loan);
        let second = event(&loan);
        store.append_event(&first).await.unwrap();
        store.append_event(&second).await.unwrap();
        store.record_mirror(first.id, "rcpt-1").await.unwrap();

        let pending = store.unmirrored_events(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
    }
}
