//! Ledger publisher
//!
//! Mirrors lifecycle events to an external immutable log. Publishing is
//! fire-and-forget: failures are logged and the event stays unmirrored until
//! the reconciliation monitor re-publishes it.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::{LifecycleEvent, LifecycleEventType};
use crate::store::{LoanStore, StoreError};

/// Hex SHA-256 over the identifying content of an event.
///
/// Used as the idempotency key for the external mirror.
pub fn event_digest(
    id: Uuid,
    event_type: LifecycleEventType,
    loan_id: Option<Uuid>,
    asset_id: Option<Uuid>,
    metadata: &serde_json::Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(format!("{:?}", event_type).as_bytes());
    hasher.update(loan_id.unwrap_or_default().as_bytes());
    hasher.update(asset_id.unwrap_or_default().as_bytes());
    hasher.update(metadata.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Network(String),

    #[error("ledger rejected event: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        LedgerError::Network(err.to_string())
    }
}

/// External immutable log
#[async_trait]
pub trait LedgerSink: Send + Sync {
    /// Append `event`, returning the ledger's receipt
    async fn append(&self, event: &LifecycleEvent) -> Result<String, LedgerError>;
}

#[derive(Debug, Deserialize)]
struct AppendResponse {
    receipt: String,
}

/// HTTP ledger endpoint
#[derive(Clone)]
pub struct HttpLedgerSink {
    client: Client,
    base_url: String,
}

impl HttpLedgerSink {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LedgerSink for HttpLedgerSink {
    async fn append(&self, event: &LifecycleEvent) -> Result<String, LedgerError> {
        let resp = self
            .client
            .post(format!("{}/events", self.base_url))
            .header("Idempotency-Key", &event.digest)
            .json(event)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(LedgerError::Rejected(format!(
                "ledger returned {}",
                resp.status()
            )));
        }
        let body: AppendResponse = resp.json().await?;
        Ok(body.receipt)
    }
}

/// In-process ledger for simulated mode and tests
#[derive(Default)]
pub struct MemoryLedgerSink {
    entries: Mutex<Vec<LifecycleEvent>>,
    failures: Mutex<u32>,
}

impl MemoryLedgerSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` appends
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock().unwrap_or_else(|p| p.into_inner()) = count;
    }

    pub fn entries(&self) -> Vec<LifecycleEvent> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl LedgerSink for MemoryLedgerSink {
    async fn append(&self, event: &LifecycleEvent) -> Result<String, LedgerError> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
            if *failures > 0 {
                *failures -= 1;
                return Err(LedgerError::Network("ledger offline".to_string()));
            }
        }
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        // Idempotent on digest
        if !entries.iter().any(|e| e.digest == event.digest) {
            entries.push(event.clone());
        }
        Ok(format!("mem_{}", &event.digest[..16]))
    }
}

/// Fire-and-forget publisher
#[derive(Clone)]
pub struct LedgerPublisher {
    sink: Option<Arc<dyn LedgerSink>>,
    store: Arc<dyn LoanStore>,
}

impl LedgerPublisher {
    pub fn new(sink: Option<Arc<dyn LedgerSink>>, store: Arc<dyn LoanStore>) -> Self {
        Self { sink, store }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Mirror `event` on a background task. Never fails the caller.
    pub fn publish(&self, event: LifecycleEvent) -> JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.mirror(&event).await {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = ?event.event_type,
                    error = %e,
                    "Failed to mirror lifecycle event; will retry"
                );
            }
        })
    }

    /// Re-publish events that have no mirror receipt yet. Returns how many
    /// were mirrored.
    pub async fn republish_pending(&self, limit: i64) -> Result<usize, LedgerError> {
        if self.sink.is_none() {
            return Ok(0);
        }
        let pending = self.store.unmirrored_events(limit).await?;
        let mut mirrored = 0;
        for event in &pending {
            match self.mirror(event).await {
                Ok(()) => mirrored += 1,
                Err(e) => {
                    tracing::warn!(event_id = %event.id, error = %e, "Re-publish failed");
                    // Ledger is likely down; try again next round
                    break;
                }
            }
        }
        Ok(mirrored)
    }

    async fn mirror(&self, event: &LifecycleEvent) -> Result<(), LedgerError> {
        let Some(sink) = &self.sink else {
            tracing::debug!(event_id = %event.id, "Ledger mirroring disabled");
            return Ok(());
        };
        let receipt = sink.append(event).await?;
        self.store.record_mirror(event.id, &receipt).await?;
        tracing::debug!(event_id = %event.id, receipt = %receipt, "Lifecycle event mirrored");
        Ok(())
    }
}
