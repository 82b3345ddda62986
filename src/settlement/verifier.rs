//! Settlement verifier
//!
//! Turns a transfer reference into a verdict: `Confirmed`, `Mismatched`,
//! `Failed`, or `Pending` when no terminal receipt arrived inside the retry
//! budget. Pending is never a rejection: the transfer may still land.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use super::client::{ClientError, SettlementClient};
use super::model::{
    to_network_units, ExpectedTransfer, ReceiptStatus, SettlementRecord, VerificationOutcome,
};
use crate::config::VerificationPolicy;

/// Confirms external transfers against their expected amount and parties
#[derive(Clone)]
pub struct SettlementVerifier {
    client: Arc<dyn SettlementClient>,
    policy: VerificationPolicy,
}

impl SettlementVerifier {
    pub fn new(client: Arc<dyn SettlementClient>, policy: VerificationPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    /// Run the confirmation protocol for `expected`.
    ///
    /// Suspends the calling task for at most the policy's confirmation window.
    pub async fn confirm(&self, expected: ExpectedTransfer) -> SettlementRecord {
        let created_at = Utc::now();
        let (receipt, retry_count) = match self.client.subscribe_receipt(&expected.tx_ref) {
            Some(rx) => (self.await_pushed_receipt(rx).await, 0),
            None => self.poll_receipt(&expected).await,
        };

        let outcome = match receipt {
            None => {
                tracing::warn!(
                    tx_ref = %expected.tx_ref,
                    attempts = retry_count,
                    "Settlement receipt not terminal within the retry budget"
                );
                VerificationOutcome::Pending
            }
            Some(ReceiptStatus::Failure) => VerificationOutcome::Failed {
                reason: "settlement network reported the transfer as failed".to_string(),
            },
            Some(_) => self.reconcile_amount(&expected).await,
        };

        let confirmed_at = matches!(outcome, VerificationOutcome::Confirmed { .. })
            .then(Utc::now);
        SettlementRecord {
            expected,
            outcome,
            retry_count,
            created_at,
            confirmed_at,
        }
    }

    /// Bounded polling: fixed attempt count, fixed delay between attempts
    async fn poll_receipt(&self, expected: &ExpectedTransfer) -> (Option<ReceiptStatus>, u32) {
        let mut attempts = 0;
        while attempts < self.policy.max_attempts {
            if attempts > 0 {
                sleep(self.policy.poll_interval).await;
            }
            attempts += 1;

            match self.client.get_receipt(&expected.tx_ref).await {
                Ok(status) if status.is_terminal() => return (Some(status), attempts),
                Ok(_) => {
                    tracing::debug!(
                        tx_ref = %expected.tx_ref,
                        attempt = attempts,
                        "Settlement receipt not yet terminal"
                    );
                }
                // An unknown reference may simply not be ingested yet
                Err(e @ (ClientError::NotFound(_) | ClientError::Timeout | ClientError::Network(_))) => {
                    tracing::debug!(
                        tx_ref = %expected.tx_ref,
                        attempt = attempts,
                        error = %e,
                        "Settlement receipt poll failed, retrying"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        tx_ref = %expected.tx_ref,
                        attempt = attempts,
                        error = %e,
                        "Unexpected settlement receipt error, retrying"
                    );
                }
            }
        }
        (None, attempts)
    }

    /// Wait on a pushed receipt within the same bounded window
    async fn await_pushed_receipt(
        &self,
        mut rx: watch::Receiver<ReceiptStatus>,
    ) -> Option<ReceiptStatus> {
        let window = self.policy.confirmation_window();
        let wait = async {
            loop {
                let current = *rx.borrow_and_update();
                if current.is_terminal() {
                    return Some(current);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        timeout(window, wait).await.ok().flatten()
    }

    /// Compare the moved amount against the expected amount within tolerance
    async fn reconcile_amount(&self, expected: &ExpectedTransfer) -> VerificationOutcome {
        let expected_units = to_network_units(expected.amount);

        let record = match self.client.get_record(&expected.tx_ref).await {
            Ok(record) => record,
            Err(e) if self.policy.accept_unverified_amount => {
                tracing::warn!(
                    tx_ref = %expected.tx_ref,
                    expected_amount = expected_units,
                    error = %e,
                    "Accepting settlement WITHOUT amount verification: receipt succeeded but the transfer record is unavailable"
                );
                return VerificationOutcome::Confirmed {
                    unverified_amount: true,
                };
            }
            Err(e) => {
                tracing::warn!(
                    tx_ref = %expected.tx_ref,
                    error = %e,
                    "Transfer record unavailable and unverified acceptance disabled"
                );
                return VerificationOutcome::Pending;
            }
        };

        if record.from != expected.payer || record.to != expected.payee {
            return VerificationOutcome::Mismatched {
                expected_amount: expected_units,
                actual_amount: record.actual_amount,
                reason: format!(
                    "transfer moved funds {} -> {}, expected {} -> {}",
                    record.from, record.to, expected.payer, expected.payee
                ),
            };
        }

        let diff = (record.actual_amount - expected_units).abs();
        if diff > self.policy.amount_tolerance {
            tracing::warn!(
                tx_ref = %expected.tx_ref,
                expected_amount = expected_units,
                actual_amount = record.actual_amount,
                "Settlement amount mismatch"
            );
            return VerificationOutcome::Mismatched {
                expected_amount: expected_units,
                actual_amount: record.actual_amount,
                reason: format!(
                    "expected {} but {} was transferred",
                    expected_units, record.actual_amount
                ),
            };
        }

        tracing::info!(
            tx_ref = %expected.tx_ref,
            amount = record.actual_amount,
            "Settlement confirmed and amount verified"
        );
        VerificationOutcome::Confirmed {
            unverified_amount: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::simulated::{Fault, RecordScript, SimOp, SimulatedNetwork, TransferScript};
    use std::time::Duration;

    fn policy() -> VerificationPolicy {
        VerificationPolicy {
            max_attempts: 3,
            poll_interval: Duration::from_millis(1),
            amount_tolerance: 0.0001,
            accept_unverified_amount: true,
        }
    }

    async fn submit(net: &SimulatedNetwork, script: TransferScript) -> ExpectedTransfer {
        net.fund_account("lender", 1_000_000);
        net.script_next_transfer(script);
        let tx_ref = net.submit_transfer("lender", "borrower", 100_000).await.unwrap();
        ExpectedTransfer {
            tx_ref,
            amount: 100_000, // 1000.00
            payer: "lender".to_string(),
            payee: "borrower".to_string(),
        }
    }

    #[tokio::test]
    async fn test_amount_within_tolerance_confirms() {
        let net = Arc::new(SimulatedNetwork::new());
        let expected = submit(
            &net,
            TransferScript::confirmed().with_record(RecordScript::Amount(1000.00000001)),
        )
        .await;

        let record = SettlementVerifier::new(net.clone(), policy()).confirm(expected).await;
        assert_eq!(
            record.outcome,
            VerificationOutcome::Confirmed {
                unverified_amount: false
            }
        );
        assert!(record.confirmed_at.is_some());
    }

    #[tokio::test]
    async fn test_amount_outside_tolerance_mismatches() {
        let net = Arc::new(SimulatedNetwork::new());
        let expected = submit(
            &net,
            TransferScript::confirmed().with_record(RecordScript::Amount(1005.00)),
        )
        .await;

        let record = SettlementVerifier::new(net.clone(), policy()).confirm(expected).await;
        assert!(matches!(
            record.outcome,
            VerificationOutcome::Mismatched { actual_amount, .. } if actual_amount == 1005.0
        ));
        assert!(record.confirmed_at.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_pending_not_failed() {
        let net = Arc::new(SimulatedNetwork::new());
        let expected = submit(&net, TransferScript::never_settles()).await;

        let record = SettlementVerifier::new(net.clone(), policy()).confirm(expected).await;
        assert_eq!(record.outcome, VerificationOutcome::Pending);
        assert_eq!(record.retry_count, 3);
    }

    #[tokio::test]
    async fn test_receipt_arriving_within_budget_confirms() {
        let net = Arc::new(SimulatedNetwork::new());
        let expected = submit(&net, TransferScript::settles_after(2)).await;

        let record = SettlementVerifier::new(net.clone(), policy()).confirm(expected).await;
        assert!(record.is_confirmed());
        assert_eq!(record.retry_count, 3);
    }

    #[tokio::test]
    async fn test_transient_poll_errors_are_retried() {
        let net = Arc::new(SimulatedNetwork::new());
        let expected = submit(&net, TransferScript::confirmed()).await;
        net.inject_fault(SimOp::Receipt, Fault::Fail(ClientError::Timeout));

        let record = SettlementVerifier::new(net.clone(), policy()).confirm(expected).await;
        assert!(record.is_confirmed());
        assert_eq!(record.retry_count, 2);
    }

    #[tokio::test]
    async fn test_failed_receipt_is_failed() {
        let net = Arc::new(SimulatedNetwork::new());
        let expected = submit(
            &net,
            TransferScript {
                receipts: vec![ReceiptStatus::Failure],
                record: RecordScript::Exact,
            },
        )
        .await;

        let record = SettlementVerifier::new(net.clone(), policy()).confirm(expected).await;
        assert!(matches!(record.outcome, VerificationOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_missing_record_accepted_as_unverified() {
        let net = Arc::new(SimulatedNetwork::new());
        let expected = submit(
            &net,
            TransferScript::confirmed().with_record(RecordScript::Unavailable),
        )
        .await;

        let record = SettlementVerifier::new(net.clone(), policy())
            .confirm(expected.clone())
            .await;
        assert_eq!(
            record.outcome,
            VerificationOutcome::Confirmed {
                unverified_amount: true
            }
        );

        let strict = VerificationPolicy {
            accept_unverified_amount: false,
            ..policy()
        };
        let record = SettlementVerifier::new(net.clone(), strict).confirm(expected).await;
        assert_eq!(record.outcome, VerificationOutcome::Pending);
    }

    #[tokio::test]
    async fn test_wrong_payee_mismatches() {
        let net = Arc::new(SimulatedNetwork::new());
        let mut expected = submit(&net, TransferScript::confirmed()).await;
        expected.payee = "someone-else".to_string();

        let record = SettlementVerifier::new(net.clone(), policy()).confirm(expected).await;
        assert!(matches!(record.outcome, VerificationOutcome::Mismatched { .. }));
    }

    #[tokio::test]
    async fn test_pushed_receipt_is_used_when_offered() {
        let net = Arc::new(SimulatedNetwork::new().with_push_receipts());
        let expected = submit(&net, TransferScript::never_settles()).await;
        let verifier = SettlementVerifier::new(
            net.clone(),
            VerificationPolicy {
                max_attempts: 1,
                poll_interval: Duration::from_millis(20),
                ..policy()
            },
        );

        // Nothing delivered: the bounded window elapses into Pending
        let record = verifier.confirm(expected.clone()).await;
        assert_eq!(record.outcome, VerificationOutcome::Pending);

        let confirmed = submit(&net, TransferScript::confirmed()).await;
        let record = verifier.confirm(confirmed).await;
        assert!(record.is_confirmed());
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn test_receipt_pushed_mid_window_confirms() {
        let net = Arc::new(SimulatedNetwork::new().with_push_receipts());
        let expected = submit(&net, TransferScript::settles_after(10)).await;
        let verifier = SettlementVerifier::new(
            net.clone(),
            VerificationPolicy {
                max_attempts: 1,
                poll_interval: Duration::from_millis(500),
                ..policy()
            },
        );

        let pusher = net.clone();
        let tx_ref = expected.tx_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pusher.deliver_receipt(&tx_ref);
        });

        let record = verifier.confirm(expected).await;
        assert_eq!(
            record.outcome,
            VerificationOutcome::Confirmed {
                unverified_amount: false
            }
        );
        assert_eq!(record.retry_count, 0);
    }
}
