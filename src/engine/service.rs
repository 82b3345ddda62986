//! Settlement engine
//!
//! Sequences the loan state machine, custody coordinator, settlement
//! verifier, reputation adjuster and ledger publisher into the loan
//! lifecycle operations. External effects come first, the guarded local
//! write last. When the write fails after an external effect committed the
//! caller gets `ExternalSuccessLocalInconsistency`, never a plain error.

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::clock::{Clock, SystemClock};
use crate::config::{Config, CustodyPolicy, LoanPolicy, VerificationPolicy};
use crate::custody::{CustodyCoordinator, CustodyOutcome};
use crate::error::{EngineError, ReconciliationDetail};
use crate::ledger::LedgerPublisher;
use crate::loan::{
    CancelLoanRequest, ClaimCollateralRequest, FundLoanRequest, Loan, LoanStateMachine,
    LoanStatus, LoanTerms, RepayLoanRequest, RepaymentReceipt,
};
use crate::models::{
    AccountId, AssetStatus, AssetUpdate, AttemptStatus, ExternalAttempt, ExternalOperation,
    LifecycleEvent, LifecycleEventType,
};
use crate::reputation::{self, ReputationEvent};
use crate::settlement::{
    to_network_units, ClientError, ExpectedTransfer, SettlementClient, SettlementVerifier, TxRef,
    VerificationOutcome,
};
use crate::store::{LoanStore, Transition};

/// Policies and addresses the engine runs with
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub verification: VerificationPolicy,
    pub custody: CustodyPolicy,
    pub loan_policy: LoanPolicy,
    /// Platform treasury; pays out and receives express loans
    pub platform_settlement_address: String,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            verification: config.verification.clone(),
            custody: config.custody.clone(),
            loan_policy: config.loan_policy.clone(),
            platform_settlement_address: config.platform_settlement_address.clone(),
        }
    }
}

/// A payment that reached a verified (or accepted-unverified) confirmation
struct Settled {
    tx_ref: TxRef,
    unverified_amount: bool,
    attempts: Vec<Uuid>,
}

/// Loan lifecycle orchestrator
#[derive(Clone)]
pub struct SettlementEngine {
    store: Arc<dyn LoanStore>,
    client: Arc<dyn SettlementClient>,
    custody: CustodyCoordinator,
    verifier: SettlementVerifier,
    machine: LoanStateMachine,
    ledger: LedgerPublisher,
    clock: Arc<dyn Clock>,
    platform_address: String,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn LoanStore>,
        client: Arc<dyn SettlementClient>,
        ledger: LedgerPublisher,
        settings: EngineSettings,
    ) -> Self {
        Self {
            custody: CustodyCoordinator::new(client.clone(), settings.custody),
            verifier: SettlementVerifier::new(client.clone(), settings.verification),
            machine: LoanStateMachine::new(settings.loan_policy),
            store,
            client,
            ledger,
            clock: Arc::new(SystemClock),
            platform_address: settings.platform_settlement_address,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn LoanStore> {
        &self.store
    }

    pub fn ledger(&self) -> &LedgerPublisher {
        &self.ledger
    }

    pub async fn get_loan(&self, loan_id: Uuid) -> Result<Loan, EngineError> {
        Ok(self.store.get_loan(loan_id).await?)
    }

    /// Open a loan against `asset_id`, collateralizing the asset.
    pub async fn open_loan(
        &self,
        borrower: AccountId,
        asset_id: Uuid,
        terms: LoanTerms,
    ) -> Result<Loan, EngineError> {
        terms
            .validate()
            .map_err(|e| EngineError::Rejected(e.to_string()))?;

        let asset = self.store.get_asset(asset_id).await?;
        let loan = self.machine.open(borrower, &asset, &terms, self.clock.now())?;

        let event = LifecycleEvent::new(
            LifecycleEventType::LoanOpened,
            Some(loan.id),
            Some(asset.id),
            json!({
                "borrower_id": borrower,
                "principal": loan.principal,
                "interest_rate_bps": loan.interest_rate_bps,
                "ltv_bps": loan.ltv_bps,
                "express": loan.express,
            }),
        );
        self.store.create_loan(&loan, asset.status, &event).await?;

        tracing::info!(
            loan_id = %loan.id,
            asset_id = %asset.id,
            principal = loan.principal,
            ltv_bps = loan.ltv_bps,
            express = loan.express,
            "Loan opened"
        );
        self.ledger.publish(event);
        Ok(loan)
    }

    /// `Open -> Active`: lock the collateral, settle the principal, commit.
    pub async fn fund_loan(
        &self,
        loan_id: Uuid,
        request: FundLoanRequest,
    ) -> Result<Loan, EngineError> {
        let loan = self.store.get_loan(loan_id).await?;
        let precheck = self.machine.fund(&loan, request.lender_id, self.clock.now())?;
        let lender_id = precheck
            .lender_id
            .ok_or_else(|| EngineError::Rejected("a lender is required".to_string()))?;

        let asset = self.store.get_asset(loan.asset_id).await?;
        let token = asset.custody_token_id.clone().ok_or_else(|| {
            EngineError::Rejected("collateral asset has no custody token".to_string())
        })?;
        let borrower_address = self.address_of(loan.borrower_id).await?;
        let lender_address = if loan.express {
            self.platform_address.clone()
        } else {
            self.address_of(lender_id).await?
        };

        if !loan.express {
            self.check_payment_source(
                &lender_address,
                loan.principal,
                request.payment_reference.as_ref(),
            )
            .await?;
        }

        let lock_attempt = self
            .lock_collateral(&loan, &token, &borrower_address)
            .await?;

        let settled = if loan.express {
            None
        } else {
            match self
                .settle_payment(
                    &loan,
                    &lender_address,
                    &borrower_address,
                    loan.principal,
                    request.payment_reference,
                )
                .await
            {
                Ok(settled) => Some(settled),
                Err(err) => {
                    self.compensate_lock(&loan, &token, lock_attempt, &err).await;
                    return Err(err);
                }
            }
        };

        // Both external steps confirmed: custody stays locked from here on
        let tx_ref = settled.as_ref().map(|s| s.tx_ref.clone());
        let mut attempts = vec![lock_attempt];
        attempts.extend(settled.iter().flat_map(|s| s.attempts.iter().copied()));

        let commit = async {
            let funded = self.machine.fund(&loan, request.lender_id, self.clock.now())?;
            let mut reputations = Vec::new();
            if !loan.express {
                let lender = self.store.get_reputation(lender_id).await?;
                reputations.push(reputation::adjust(
                    &lender,
                    ReputationEvent::LenderFunded,
                    funded.updated_at,
                ));
            }
            let event = LifecycleEvent::new(
                LifecycleEventType::LoanFunded,
                Some(loan.id),
                Some(loan.asset_id),
                json!({
                    "lender_id": lender_id,
                    "principal": loan.principal,
                    "tx_ref": tx_ref,
                    "custody_token": token,
                    "unverified_amount": settled.as_ref().map_or(false, |s| s.unverified_amount),
                    "due_at": funded.due_at,
                }),
            );
            let transition = Transition {
                loan: funded,
                expected_status: LoanStatus::Open,
                asset: None,
                reputations,
                event,
            };
            self.store.apply_transition(&transition).await?;
            Ok::<_, EngineError>(transition)
        };

        match commit.await {
            Ok(transition) => {
                tracing::info!(
                    loan_id = %loan.id,
                    lender_id = %lender_id,
                    tx_ref = ?tx_ref,
                    custody_token = %token,
                    "Loan funded"
                );
                self.ledger.publish(transition.event);
                Ok(transition.loan)
            }
            Err(err) => Err(self
                .reconciliation_required(&loan, "fund", tx_ref, Some(token), &attempts, err)
                .await),
        }
    }

    /// `Active -> Repaid`: settle the amount owed, release the collateral,
    /// commit.
    pub async fn repay_loan(
        &self,
        loan_id: Uuid,
        request: RepayLoanRequest,
    ) -> Result<RepaymentReceipt, EngineError> {
        let loan = self.store.get_loan(loan_id).await?;
        let (repaid, quote) = self
            .machine
            .repay(&loan, request.payer_id, self.clock.now())?;
        let lender_id = loan
            .lender_id
            .ok_or_else(|| EngineError::Rejected("loan has no lender".to_string()))?;

        let asset = self.store.get_asset(loan.asset_id).await?;
        let token = asset.custody_token_id.clone().ok_or_else(|| {
            EngineError::Rejected("collateral asset has no custody token".to_string())
        })?;
        let borrower_address = self.address_of(loan.borrower_id).await?;
        let payee_address = if loan.express {
            self.platform_address.clone()
        } else {
            self.address_of(lender_id).await?
        };

        self.check_payment_source(
            &borrower_address,
            quote.total,
            request.payment_reference.as_ref(),
        )
        .await?;

        let settled = self
            .settle_payment(
                &loan,
                &borrower_address,
                &payee_address,
                quote.total,
                request.payment_reference,
            )
            .await?;
        let mut attempts = settled.attempts.clone();
        let tx_ref = settled.tx_ref.clone();

        // Payment landed: every failure from here on needs reconciliation
        let release = async {
            let current = self.store.get_loan(loan.id).await?;
            if current.status != LoanStatus::Active || current.version != loan.version {
                return Err(EngineError::StaleState(format!(
                    "loan moved to {} while the repayment settled",
                    current.status
                )));
            }
            let attempt = self
                .journal(&loan, ExternalOperation::CustodyRelease, &token, json!({}))
                .await?;
            attempts.push(attempt);
            match self.custody.release(&token).await {
                outcome if outcome.is_success() => {
                    self.resolve(attempt, AttemptStatus::Succeeded).await;
                    Ok::<(), EngineError>(())
                }
                outcome => {
                    self.resolve(attempt, AttemptStatus::Unresolved).await;
                    Err(EngineError::CustodyFailed(format!(
                        "collateral release failed: {:?}",
                        outcome
                    )))
                }
            }
        };
        if let Err(err) = release.await {
            return Err(self
                .reconciliation_required(&loan, "repay", Some(tx_ref), Some(token), &attempts, err)
                .await);
        }

        let commit = async {
            let mut reputations = vec![reputation::adjust(
                &self.store.get_reputation(loan.borrower_id).await?,
                ReputationEvent::BorrowerRepaid,
                repaid.updated_at,
            )];
            if !loan.express {
                reputations.push(reputation::adjust(
                    &self.store.get_reputation(lender_id).await?,
                    ReputationEvent::LenderRepaid,
                    repaid.updated_at,
                ));
            }
            let transition = Transition {
                loan: repaid.clone(),
                expected_status: LoanStatus::Active,
                asset: Some(AssetUpdate {
                    asset_id: loan.asset_id,
                    status: AssetStatus::Listed,
                    owner_id: None,
                }),
                reputations,
                event: LifecycleEvent::new(
                    LifecycleEventType::LoanRepaid,
                    Some(loan.id),
                    Some(loan.asset_id),
                    json!({
                        "payer_id": request.payer_id,
                        "tx_ref": tx_ref,
                        "principal": quote.principal,
                        "interest": quote.interest,
                        "total": quote.total,
                        "elapsed_months": quote.elapsed_months,
                        "unverified_amount": settled.unverified_amount,
                    }),
                ),
            };
            self.store.apply_transition(&transition).await?;
            Ok::<_, EngineError>(transition)
        };

        match commit.await {
            Ok(transition) => {
                tracing::info!(
                    loan_id = %loan.id,
                    tx_ref = %tx_ref,
                    total = quote.total,
                    "Loan repaid"
                );
                self.ledger.publish(transition.event);
                Ok(RepaymentReceipt {
                    loan: transition.loan,
                    total_owed: quote.total,
                    quote,
                    tx_ref,
                })
            }
            Err(err) => Err(self
                .reconciliation_required(&loan, "repay", Some(tx_ref), Some(token), &attempts, err)
                .await),
        }
    }

    /// `Active -> Liquidated`: move the collateral to the lender once overdue.
    pub async fn claim_collateral(
        &self,
        loan_id: Uuid,
        request: ClaimCollateralRequest,
    ) -> Result<Loan, EngineError> {
        let loan = self.store.get_loan(loan_id).await?;
        let liquidated = self
            .machine
            .liquidate(&loan, request.claimant_id, self.clock.now())?;
        let lender_id = request.claimant_id;

        let asset = self.store.get_asset(loan.asset_id).await?;
        let token = asset.custody_token_id.clone().ok_or_else(|| {
            EngineError::Rejected("collateral asset has no custody token".to_string())
        })?;
        let lender_address = if loan.express {
            self.platform_address.clone()
        } else {
            self.address_of(lender_id).await?
        };

        let attempt = self
            .journal(
                &loan,
                ExternalOperation::CustodyTransfer,
                &token,
                json!({ "new_owner": lender_address }),
            )
            .await?;
        match self.custody.transfer_ownership(&token, &lender_address).await {
            outcome if outcome.is_success() => {
                self.resolve(attempt, AttemptStatus::Succeeded).await;
            }
            CustodyOutcome::Failed { reason, uncertain } => {
                let status = if uncertain {
                    AttemptStatus::Unresolved
                } else {
                    AttemptStatus::Failed
                };
                self.resolve(attempt, status).await;
                return Err(EngineError::CustodyFailed(reason));
            }
            outcome => {
                self.resolve(attempt, AttemptStatus::Failed).await;
                return Err(EngineError::CustodyFailed(format!(
                    "unexpected custody outcome {:?}",
                    outcome
                )));
            }
        }

        let commit = async {
            let borrower = self.store.get_reputation(loan.borrower_id).await?;
            let transition = Transition {
                loan: liquidated.clone(),
                expected_status: LoanStatus::Active,
                asset: Some(AssetUpdate {
                    asset_id: loan.asset_id,
                    status: AssetStatus::Listed,
                    owner_id: Some(lender_id),
                }),
                reputations: vec![reputation::adjust(
                    &borrower,
                    ReputationEvent::BorrowerLiquidated,
                    liquidated.updated_at,
                )],
                event: LifecycleEvent::new(
                    LifecycleEventType::LoanLiquidated,
                    Some(loan.id),
                    Some(loan.asset_id),
                    json!({
                        "claimant_id": lender_id,
                        "custody_token": token,
                        "due_at": loan.due_at,
                    }),
                ),
            };
            self.store.apply_transition(&transition).await?;
            Ok::<_, EngineError>(transition)
        };

        match commit.await {
            Ok(transition) => {
                tracing::info!(
                    loan_id = %loan.id,
                    lender_id = %lender_id,
                    custody_token = %token,
                    "Collateral claimed"
                );
                self.ledger.publish(transition.event);
                Ok(transition.loan)
            }
            Err(err) => Err(self
                .reconciliation_required(&loan, "claim_collateral", None, Some(token), &[attempt], err)
                .await),
        }
    }

    /// `Open -> Cancelled`; no external effect.
    pub async fn cancel_loan(
        &self,
        loan_id: Uuid,
        request: CancelLoanRequest,
    ) -> Result<Loan, EngineError> {
        let loan = self.store.get_loan(loan_id).await?;
        let cancelled = self
            .machine
            .cancel(&loan, request.requester_id, self.clock.now())?;

        let transition = Transition {
            loan: cancelled,
            expected_status: LoanStatus::Open,
            asset: Some(AssetUpdate {
                asset_id: loan.asset_id,
                status: AssetStatus::Listed,
                owner_id: None,
            }),
            reputations: vec![],
            event: LifecycleEvent::new(
                LifecycleEventType::LoanCancelled,
                Some(loan.id),
                Some(loan.asset_id),
                json!({ "requester_id": request.requester_id }),
            ),
        };
        self.store.apply_transition(&transition).await?;

        tracing::info!(loan_id = %loan.id, "Loan cancelled");
        self.ledger.publish(transition.event);
        Ok(transition.loan)
    }

    /// Close a journaled attempt once an operator has reconciled it out of
    /// band. Only a final status is accepted.
    pub async fn close_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        note: &str,
    ) -> Result<ExternalAttempt, EngineError> {
        if status.is_open() {
            return Err(EngineError::Rejected(format!(
                "{:?} does not close an attempt",
                status
            )));
        }
        let attempt = self
            .store
            .close_attempt(attempt_id, status, note, self.clock.now())
            .await?;
        tracing::info!(
            attempt_id = %attempt.id,
            loan_id = %attempt.loan_id,
            operation = ?attempt.operation,
            status = ?attempt.status,
            note,
            "External attempt closed by operator"
        );
        Ok(attempt)
    }

    // ===== Private Helper Methods =====

    async fn address_of(&self, account: AccountId) -> Result<String, EngineError> {
        self.store
            .settlement_address(account)
            .await?
            .ok_or_else(|| {
                EngineError::Rejected(format!("account {} has no settlement address", account))
            })
    }

    /// A caller-supplied reference must be fresh; without one the payer must
    /// cover `amount` before anything is submitted
    async fn check_payment_source(
        &self,
        payer_address: &str,
        amount: i64,
        reference: Option<&TxRef>,
    ) -> Result<(), EngineError> {
        if let Some(reference) = reference {
            if self.store.settled_reference_exists(reference.as_str()).await? {
                return Err(EngineError::Rejected(format!(
                    "payment reference {} was already used",
                    reference
                )));
            }
            return Ok(());
        }

        let available = self
            .client
            .check_balance(payer_address)
            .await
            .map_err(settlement_error)?;
        if available < amount {
            return Err(EngineError::Rejected(format!(
                "insufficient balance: {} available, {} required",
                to_network_units(available),
                to_network_units(amount)
            )));
        }
        Ok(())
    }

    /// Lock the collateral under the lock attempt's journal id, which is what
    /// tells this attempt's lock apart from a concurrent funder's.
    async fn lock_collateral(
        &self,
        loan: &Loan,
        token: &str,
        owner_address: &str,
    ) -> Result<Uuid, EngineError> {
        let attempt = self
            .journal(
                loan,
                ExternalOperation::CustodyLock,
                token,
                json!({ "owner": owner_address }),
            )
            .await?;
        let lock_ref = attempt.to_string();

        match self.custody.lock(token, owner_address, &lock_ref).await {
            CustodyOutcome::Applied | CustodyOutcome::AlreadyApplied => {
                self.resolve(attempt, AttemptStatus::Succeeded).await;
                Ok(attempt)
            }
            CustodyOutcome::Conflict { holder } => {
                self.resolve(attempt, AttemptStatus::Failed).await;
                Err(EngineError::StaleState(format!(
                    "collateral {} is already locked by {}",
                    token, holder
                )))
            }
            CustodyOutcome::Failed {
                reason,
                uncertain: false,
            } => {
                self.resolve(attempt, AttemptStatus::Failed).await;
                Err(EngineError::CustodyFailed(reason))
            }
            CustodyOutcome::Failed {
                reason,
                uncertain: true,
            } => {
                // Undo only a lock taken under our own reference
                match self.custody.release_lock(token, &lock_ref).await {
                    CustodyOutcome::Applied => {
                        self.resolve(attempt, AttemptStatus::Compensated).await;
                        Err(EngineError::CustodyFailed(reason))
                    }
                    CustodyOutcome::AlreadyApplied => {
                        self.resolve(attempt, AttemptStatus::Failed).await;
                        Err(EngineError::CustodyFailed(reason))
                    }
                    CustodyOutcome::Conflict { holder } => {
                        tracing::warn!(
                            loan_id = %loan.id,
                            custody_token = %token,
                            holder = %holder,
                            "Collateral locked by a concurrent operation; left in place"
                        );
                        self.resolve(attempt, AttemptStatus::Failed).await;
                        Err(EngineError::StaleState(format!(
                            "collateral {} is already locked by {}",
                            token, holder
                        )))
                    }
                    CustodyOutcome::Failed { .. } => {
                        self.resolve(attempt, AttemptStatus::Unresolved).await;
                        Err(EngineError::CustodyFailed(reason))
                    }
                }
            }
        }
    }

    /// Reverse a lock after the payment step failed. Logged whatever happens.
    async fn compensate_lock(&self, loan: &Loan, token: &str, lock_attempt: Uuid, cause: &EngineError) {
        let attempt = self
            .journal(loan, ExternalOperation::CustodyRelease, token, json!({ "compensating": true }))
            .await
            .ok();
        let outcome = self
            .custody
            .release_lock(token, &lock_attempt.to_string())
            .await;

        if outcome.is_success() {
            tracing::warn!(
                loan_id = %loan.id,
                custody_token = %token,
                cause = %cause,
                "Funding aborted; collateral lock released"
            );
            self.resolve(lock_attempt, AttemptStatus::Compensated).await;
            if let Some(attempt) = attempt {
                self.resolve(attempt, AttemptStatus::Succeeded).await;
            }
        } else {
            tracing::error!(
                loan_id = %loan.id,
                custody_token = %token,
                cause = %cause,
                outcome = ?outcome,
                "Funding aborted but the collateral lock could not be released"
            );
            self.resolve(lock_attempt, AttemptStatus::Unresolved).await;
            if let Some(attempt) = attempt {
                self.resolve(attempt, AttemptStatus::Unresolved).await;
            }
        }
    }

    /// Submit (or adopt) a transfer and run it through the verifier
    async fn settle_payment(
        &self,
        loan: &Loan,
        payer: &str,
        payee: &str,
        amount: i64,
        reference: Option<TxRef>,
    ) -> Result<Settled, EngineError> {
        let mut attempts = Vec::new();

        let tx_ref = match reference {
            Some(tx_ref) => tx_ref,
            None => {
                let attempt = self
                    .journal(
                        loan,
                        ExternalOperation::TransferSubmit,
                        &format!("{}->{}", payer, payee),
                        json!({ "from": payer, "to": payee, "amount": amount }),
                    )
                    .await?;
                match self.client.submit_transfer(payer, payee, amount).await {
                    Ok(tx_ref) => {
                        self.resolve(attempt, AttemptStatus::Succeeded).await;
                        attempts.push(attempt);
                        tx_ref
                    }
                    Err(err) => {
                        // A timed-out submit may still have gone through
                        let status = if err.is_transient() {
                            AttemptStatus::Unresolved
                        } else {
                            AttemptStatus::Failed
                        };
                        self.resolve(attempt, status).await;
                        return Err(settlement_error(err));
                    }
                }
            }
        };

        let attempt = self
            .journal(
                loan,
                ExternalOperation::SettlementVerify,
                tx_ref.as_str(),
                json!({ "amount": amount, "payer": payer, "payee": payee }),
            )
            .await?;
        attempts.push(attempt);

        let record = self
            .verifier
            .confirm(ExpectedTransfer {
                tx_ref: tx_ref.clone(),
                amount,
                payer: payer.to_string(),
                payee: payee.to_string(),
            })
            .await;

        match record.outcome {
            VerificationOutcome::Confirmed { unverified_amount } => {
                self.resolve(attempt, AttemptStatus::Succeeded).await;
                // Earlier checks of this reference that ended Pending
                match self
                    .store
                    .resolve_open_attempts(
                        ExternalOperation::SettlementVerify,
                        tx_ref.as_str(),
                        AttemptStatus::Succeeded,
                        self.clock.now(),
                    )
                    .await
                {
                    Ok(0) => {}
                    Ok(closed) => {
                        tracing::info!(
                            loan_id = %loan.id,
                            tx_ref = %tx_ref,
                            closed,
                            "Earlier pending settlement checks resolved"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            tx_ref = %tx_ref,
                            error = %e,
                            "Failed to resolve earlier settlement checks"
                        );
                    }
                }
                Ok(Settled {
                    tx_ref,
                    unverified_amount,
                    attempts,
                })
            }
            VerificationOutcome::Pending => {
                // May still land; stays open for the reconciliation monitor
                self.resolve(attempt, AttemptStatus::Unresolved).await;
                tracing::warn!(
                    loan_id = %loan.id,
                    tx_ref = %tx_ref,
                    retries = record.retry_count,
                    "Settlement still pending"
                );
                Err(EngineError::Pending {
                    tx_ref,
                    retry_after: self.verifier.policy().confirmation_window(),
                })
            }
            VerificationOutcome::Mismatched {
                expected_amount,
                actual_amount,
                reason,
            } => {
                self.resolve(attempt, AttemptStatus::Failed).await;
                Err(EngineError::MismatchedAmount {
                    tx_ref,
                    expected: expected_amount,
                    actual: actual_amount,
                    reason,
                })
            }
            VerificationOutcome::Failed { reason } => {
                self.resolve(attempt, AttemptStatus::Failed).await;
                Err(EngineError::Rejected(format!(
                    "settlement {} failed: {}",
                    tx_ref, reason
                )))
            }
        }
    }

    /// Journal an external call before it is issued
    async fn journal(
        &self,
        loan: &Loan,
        operation: ExternalOperation,
        reference: &str,
        detail: serde_json::Value,
    ) -> Result<Uuid, EngineError> {
        let attempt = ExternalAttempt::start(loan.id, operation, reference, detail);
        self.store.record_attempt(&attempt).await?;
        tracing::debug!(
            loan_id = %loan.id,
            attempt_id = %attempt.id,
            operation = ?operation,
            reference = %reference,
            "External attempt journaled"
        );
        Ok(attempt.id)
    }

    async fn resolve(&self, attempt_id: Uuid, status: AttemptStatus) {
        if let Err(e) = self
            .store
            .resolve_attempt(attempt_id, status, self.clock.now())
            .await
        {
            tracing::warn!(
                attempt_id = %attempt_id,
                status = ?status,
                error = %e,
                "Failed to resolve external attempt"
            );
        }
    }

    /// Surface an external effect that has no local commit
    async fn reconciliation_required(
        &self,
        loan: &Loan,
        operation: &'static str,
        tx_ref: Option<TxRef>,
        custody_token: Option<String>,
        attempts: &[Uuid],
        cause: EngineError,
    ) -> EngineError {
        let detail = ReconciliationDetail {
            reference: Uuid::new_v4(),
            loan_id: loan.id,
            operation,
            tx_ref,
            custody_token,
            cause: cause.to_string(),
        };

        tracing::error!(
            reconciliation_ref = %detail.reference,
            loan_id = %detail.loan_id,
            operation = detail.operation,
            tx_ref = ?detail.tx_ref,
            custody_token = ?detail.custody_token,
            cause = %detail.cause,
            "External effect committed but local write failed; manual reconciliation required"
        );

        for attempt in attempts {
            self.resolve(*attempt, AttemptStatus::Unresolved).await;
        }

        let event = LifecycleEvent::new(
            LifecycleEventType::ReconciliationRequired,
            Some(loan.id),
            Some(loan.asset_id),
            serde_json::to_value(&detail).unwrap_or_default(),
        );
        match self.store.append_event(&event).await {
            Ok(()) => {
                self.ledger.publish(event);
            }
            Err(e) => {
                tracing::error!(
                    reconciliation_ref = %detail.reference,
                    error = %e,
                    "Failed to record reconciliation event"
                );
            }
        }

        EngineError::ExternalSuccessLocalInconsistency(Box::new(detail))
    }
}

fn settlement_error(err: ClientError) -> EngineError {
    match err {
        ClientError::Rejected(reason) => EngineError::Rejected(reason),
        ClientError::NotFound(what) => {
            EngineError::Rejected(format!("unknown on settlement network: {}", what))
        }
        other => EngineError::SettlementUnavailable(other.to_string()),
    }
}
