//! Collateral custody coordinator
//!
//! Owns the lock / release / transfer side effects on custody tokens.
//! Every lock is taken under a caller-chosen reference. A retry that finds
//! the token locked under its own reference reports `AlreadyApplied`;
//! a lock under any other reference is someone else's and is never adopted
//! or released by a reference-scoped call.

use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::CustodyPolicy;
use crate::settlement::{ClientError, SettlementClient};

/// Result of a custody operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CustodyOutcome {
    Applied,
    /// The effect was already in place: a retried lock whose earlier
    /// attempt landed remotely, or an idempotent release / transfer
    AlreadyApplied,
    /// The token is held by a lock taken under another reference
    Conflict { holder: String },
    Failed {
        reason: String,
        /// The effect may have happened remotely
        uncertain: bool,
    },
}

impl CustodyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CustodyOutcome::Applied | CustodyOutcome::AlreadyApplied)
    }
}

#[derive(Debug, Clone, Copy)]
enum CustodyCall<'a> {
    Lock { owner: &'a str, lock_ref: &'a str },
    Release { lock_ref: Option<&'a str> },
    Transfer { new_owner: &'a str },
}

impl CustodyCall<'_> {
    fn as_str(&self) -> &'static str {
        match self {
            CustodyCall::Lock { .. } => "lock",
            CustodyCall::Release { .. } => "release",
            CustodyCall::Transfer { .. } => "transfer",
        }
    }
}

/// Sequences custody calls against the settlement network
#[derive(Clone)]
pub struct CustodyCoordinator {
    client: Arc<dyn SettlementClient>,
    policy: CustodyPolicy,
}

impl CustodyCoordinator {
    pub fn new(client: Arc<dyn SettlementClient>, policy: CustodyPolicy) -> Self {
        Self { client, policy }
    }

    /// Lock `token_id` to `owner` under `lock_ref`.
    pub async fn lock(&self, token_id: &str, owner: &str, lock_ref: &str) -> CustodyOutcome {
        self.run(token_id, CustodyCall::Lock { owner, lock_ref }).await
    }

    /// Release whatever lock is on `token_id`. Releasing an unlocked token
    /// succeeds.
    pub async fn release(&self, token_id: &str) -> CustodyOutcome {
        self.run(token_id, CustodyCall::Release { lock_ref: None })
            .await
    }

    /// Release `token_id` only if it is locked under `lock_ref`. A lock under
    /// another reference is left alone and reported as `Conflict`.
    pub async fn release_lock(&self, token_id: &str, lock_ref: &str) -> CustodyOutcome {
        self.run(
            token_id,
            CustodyCall::Release {
                lock_ref: Some(lock_ref),
            },
        )
        .await
    }

    /// Move `token_id` to `new_owner`, clearing any lock.
    pub async fn transfer_ownership(&self, token_id: &str, new_owner: &str) -> CustodyOutcome {
        self.run(token_id, CustodyCall::Transfer { new_owner }).await
    }

    async fn call(&self, token_id: &str, call: CustodyCall<'_>) -> Result<(), ClientError> {
        match call {
            CustodyCall::Lock { owner, lock_ref } => {
                self.client.lock_custody(token_id, owner, lock_ref).await
            }
            CustodyCall::Release { lock_ref } => {
                self.client.release_custody(token_id, lock_ref).await
            }
            CustodyCall::Transfer { new_owner } => {
                self.client.transfer_custody(token_id, new_owner).await
            }
        }
    }

    async fn run(&self, token_id: &str, call: CustodyCall<'_>) -> CustodyOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        // Set once any attempt ended in a way that may have applied remotely
        let mut uncertain = false;

        for attempt in 1..=max_attempts {
            let result = self.call(token_id, call).await;
            match classify(call, result, uncertain) {
                Step::Done(outcome) => {
                    log_outcome(call, token_id, attempt, &outcome);
                    return outcome;
                }
                Step::Retry(err) => {
                    uncertain = true;
                    tracing::warn!(
                        custody_token = %token_id,
                        op = call.as_str(),
                        attempt,
                        error = %err,
                        "Custody call failed transiently"
                    );
                    if attempt < max_attempts {
                        sleep(self.backoff()).await;
                    }
                }
            }
        }

        let outcome = CustodyOutcome::Failed {
            reason: format!(
                "custody {} did not complete after {} attempts",
                call.as_str(),
                max_attempts
            ),
            uncertain: true,
        };
        log_outcome(call, token_id, max_attempts, &outcome);
        outcome
    }

    fn backoff(&self) -> Duration {
        let base = self.policy.retry_delay;
        let jitter_cap = (base.as_millis() as u64 / 4).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap))
    }
}

enum Step {
    Done(CustodyOutcome),
    Retry(ClientError),
}

fn classify(
    call: CustodyCall<'_>,
    result: Result<(), ClientError>,
    retried_after_uncertain: bool,
) -> Step {
    let err = match result {
        Ok(()) => return Step::Done(CustodyOutcome::Applied),
        Err(err) => err,
    };

    if err.is_transient() {
        return Step::Retry(err);
    }

    let outcome = match (call, err) {
        // Only a lock under our own reference is ours
        (CustodyCall::Lock { lock_ref, .. }, ClientError::AlreadyLocked { lock_ref: held, .. })
            if held.as_deref() == Some(lock_ref) =>
        {
            CustodyOutcome::AlreadyApplied
        }
        (CustodyCall::Lock { .. }, ClientError::AlreadyLocked { holder, .. }) => {
            CustodyOutcome::Conflict { holder }
        }
        (CustodyCall::Release { .. }, ClientError::NotLocked(_)) => CustodyOutcome::AlreadyApplied,
        (CustodyCall::Release { .. }, ClientError::AlreadyLocked { holder, .. }) => {
            CustodyOutcome::Conflict { holder }
        }
        (CustodyCall::Transfer { new_owner }, ClientError::AlreadyOwned { owner, .. })
            if owner == new_owner =>
        {
            CustodyOutcome::AlreadyApplied
        }
        (_, err) => CustodyOutcome::Failed {
            reason: err.to_string(),
            uncertain: retried_after_uncertain,
        },
    };
    Step::Done(outcome)
}

fn log_outcome(call: CustodyCall<'_>, token_id: &str, attempt: u32, outcome: &CustodyOutcome) {
    let op = call.as_str();
    match outcome {
        CustodyOutcome::Applied => {
            tracing::info!(custody_token = %token_id, op, attempt, "Custody call applied");
        }
        CustodyOutcome::AlreadyApplied => {
            tracing::info!(
                custody_token = %token_id,
                op,
                attempt,
                "Custody effect already in place"
            );
        }
        CustodyOutcome::Conflict { holder } => {
            tracing::warn!(
                custody_token = %token_id,
                op,
                holder = %holder,
                "Custody token held by another lock"
            );
        }
        CustodyOutcome::Failed { reason, uncertain } => {
            tracing::error!(
                custody_token = %token_id,
                op,
                attempt,
                uncertain,
                reason = %reason,
                "Custody call failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::simulated::{Fault, SimOp, SimulatedNetwork};

    fn coordinator(net: &Arc<SimulatedNetwork>) -> CustodyCoordinator {
        CustodyCoordinator::new(
            net.clone(),
            CustodyPolicy {
                max_attempts: 3,
                retry_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_lock_then_release() {
        let net = Arc::new(SimulatedNetwork::new());
        net.mint_token("T1", "alice");
        let custody = coordinator(&net);

        assert_eq!(custody.lock("T1", "alice", "a1").await, CustodyOutcome::Applied);
        assert_eq!(net.custody("T1").unwrap().locked_by.as_deref(), Some("alice"));
        assert_eq!(custody.release("T1").await, CustodyOutcome::Applied);
        assert!(net.custody("T1").unwrap().locked_by.is_none());
    }

    #[tokio::test]
    async fn test_release_twice_is_idempotent() {
        let net = Arc::new(SimulatedNetwork::new());
        net.mint_token("T1", "alice");
        let custody = coordinator(&net);
        custody.lock("T1", "alice", "a1").await;

        assert!(custody.release("T1").await.is_success());
        assert_eq!(custody.release("T1").await, CustodyOutcome::AlreadyApplied);
        assert_eq!(net.custody("T1").unwrap().owner, "alice");
    }

    #[tokio::test]
    async fn test_lock_held_by_other_call_conflicts() {
        let net = Arc::new(SimulatedNetwork::new());
        net.mint_token("T1", "alice");
        let custody = coordinator(&net);
        custody.lock("T1", "alice", "a1").await;

        assert_eq!(
            custody.lock("T1", "alice", "a2").await,
            CustodyOutcome::Conflict {
                holder: "alice".to_string()
            }
        );
        assert_eq!(net.custody("T1").unwrap().lock_count, 1);
    }

    #[tokio::test]
    async fn test_timed_out_lock_that_landed_is_not_reapplied() {
        let net = Arc::new(SimulatedNetwork::new());
        net.mint_token("T1", "alice");
        net.inject_fault(SimOp::Lock, Fault::ApplyThenFail(ClientError::Timeout));

        assert_eq!(
            coordinator(&net).lock("T1", "alice", "a1").await,
            CustodyOutcome::AlreadyApplied
        );
        assert_eq!(net.custody("T1").unwrap().lock_count, 1);
    }

    #[tokio::test]
    async fn test_retry_after_timeout_does_not_adopt_foreign_lock() {
        let net = Arc::new(SimulatedNetwork::new());
        net.mint_token("T1", "alice");
        net.lock_custody("T1", "alice", "other").await.unwrap();
        net.inject_fault(SimOp::Lock, Fault::Fail(ClientError::Timeout));

        // Same owner address, different lock reference
        assert_eq!(
            coordinator(&net).lock("T1", "alice", "mine").await,
            CustodyOutcome::Conflict {
                holder: "alice".to_string()
            }
        );
        assert_eq!(net.custody("T1").unwrap().lock_ref.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_release_lock_leaves_foreign_lock_alone() {
        let net = Arc::new(SimulatedNetwork::new());
        net.mint_token("T1", "alice");
        let custody = coordinator(&net);
        custody.lock("T1", "alice", "other").await;

        assert_eq!(
            custody.release_lock("T1", "mine").await,
            CustodyOutcome::Conflict {
                holder: "alice".to_string()
            }
        );
        assert_eq!(net.custody("T1").unwrap().lock_ref.as_deref(), Some("other"));

        assert_eq!(custody.release_lock("T1", "other").await, CustodyOutcome::Applied);
        assert_eq!(
            custody.release_lock("T1", "other").await,
            CustodyOutcome::AlreadyApplied
        );
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let net = Arc::new(SimulatedNetwork::new());
        net.mint_token("T1", "alice");
        net.inject_fault(SimOp::Lock, Fault::Fail(ClientError::Network("reset".into())));

        assert_eq!(
            coordinator(&net).lock("T1", "alice", "a1").await,
            CustodyOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_uncertain() {
        let net = Arc::new(SimulatedNetwork::new());
        net.mint_token("T1", "alice");
        for _ in 0..3 {
            net.inject_fault(SimOp::Lock, Fault::Fail(ClientError::Timeout));
        }

        assert!(matches!(
            coordinator(&net).lock("T1", "alice", "a1").await,
            CustodyOutcome::Failed { uncertain: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_transfer_to_current_owner_is_already_applied() {
        let net = Arc::new(SimulatedNetwork::new());
        net.mint_token("T1", "alice");
        let custody = coordinator(&net);

        assert_eq!(custody.transfer_ownership("T1", "bob").await, CustodyOutcome::Applied);
        assert_eq!(
            custody.transfer_ownership("T1", "bob").await,
            CustodyOutcome::AlreadyApplied
        );
        assert_eq!(net.custody("T1").unwrap().owner, "bob");
    }

    #[tokio::test]
    async fn test_unknown_token_fails_without_retry() {
        let net = Arc::new(SimulatedNetwork::new());
        assert_eq!(
            coordinator(&net).lock("missing", "alice", "a1").await,
            CustodyOutcome::Failed {
                reason: "not found: missing".to_string(),
                uncertain: false
            }
        );
    }
}
