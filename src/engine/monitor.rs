//! Reconciliation monitor
//!
//! Background pass that reports journaled external attempts nobody resolved
//! and re-publishes lifecycle events the ledger has not acknowledged.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::ledger::LedgerPublisher;
use crate::store::{LoanStore, StoreError};

/// Events re-published per pass
const REPUBLISH_BATCH: i64 = 100;

/// Stale attempts reported per pass, oldest first
const STALE_ATTEMPT_BATCH: i64 = 100;

/// Summary of one monitor pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub stale_attempts: usize,
    pub republished: usize,
}

#[derive(Clone)]
pub struct ReconciliationMonitor {
    store: Arc<dyn LoanStore>,
    ledger: LedgerPublisher,
    stale_after: Duration,
    interval: Duration,
}

impl ReconciliationMonitor {
    pub fn new(
        store: Arc<dyn LoanStore>,
        ledger: LedgerPublisher,
        stale_after: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            stale_after,
            interval,
        }
    }

    /// One pass. Attempts older than `stale_after` are logged for operators
    /// until an operation or an operator closes them.
    pub async fn run_once(&self, now: chrono::DateTime<Utc>) -> Result<MonitorReport, StoreError> {
        let stale_after =
            chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let stale = self
            .store
            .unresolved_attempts(now - stale_after, STALE_ATTEMPT_BATCH)
            .await?;

        for attempt in &stale {
            tracing::error!(
                attempt_id = %attempt.id,
                loan_id = %attempt.loan_id,
                operation = ?attempt.operation,
                reference = %attempt.reference,
                status = ?attempt.status,
                started_at = %attempt.created_at,
                "External attempt needs reconciliation"
            );
        }

        let republished = match self.ledger.republish_pending(REPUBLISH_BATCH).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Ledger re-publish pass failed");
                0
            }
        };

        Ok(MonitorReport {
            stale_attempts: stale.len(),
            republished,
        })
    }
}

/// Run the monitor forever at its configured interval
pub async fn reconciliation_monitor(monitor: ReconciliationMonitor) {
    tracing::info!(
        interval_secs = monitor.interval.as_secs(),
        "Starting reconciliation monitor"
    );

    loop {
        tokio::time::sleep(monitor.interval).await;

        match monitor.run_once(Utc::now()).await {
            Ok(report) if report.stale_attempts > 0 || report.republished > 0 => {
                tracing::info!(
                    stale_attempts = report.stale_attempts,
                    republished = report.republished,
                    "Reconciliation pass finished"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Error during reconciliation pass: {}", e);
            }
        }
    }
}
