//! Settlement network client
//!
//! `SettlementClient` is the seam between the engine and the external value
//! transfer network. `HttpSettlementClient` talks to the settlement gateway
//! (transfers, balances, custody tokens) and reads receipts and payment
//! records from Horizon.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use super::model::{to_network_units, ReceiptStatus, TransferRecord, TxRef, MINOR_UNITS_PER_UNIT};

/// Settlement network errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClientError {
    #[error("settlement network request timed out")]
    Timeout,

    #[error("settlement network unreachable: {0}")]
    Network(String),

    #[error("rejected by settlement network: {0}")]
    Rejected(String),

    #[error("custody token {token} is already locked by {holder}")]
    AlreadyLocked {
        token: String,
        holder: String,
        /// Reference the holding lock was taken under, when the network reports it
        lock_ref: Option<String>,
    },

    #[error("custody token {0} is not locked")]
    NotLocked(String),

    #[error("custody token {token} is already owned by {owner}")]
    AlreadyOwned { token: String, owner: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transfer record unavailable: {0}")]
    RecordUnavailable(String),

    #[error("invalid response from settlement network: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// Errors after which the call may or may not have taken effect
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Timeout | ClientError::Network(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_decode() {
            ClientError::InvalidResponse(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

/// Primitives offered by the external settlement network.
///
/// Amounts crossing this boundary are in minor units; the network's own
/// records report network units.
#[async_trait]
pub trait SettlementClient: Send + Sync {
    async fn submit_transfer(&self, from: &str, to: &str, amount: i64)
        -> Result<TxRef, ClientError>;

    async fn get_receipt(&self, tx_ref: &TxRef) -> Result<ReceiptStatus, ClientError>;

    async fn get_record(&self, tx_ref: &TxRef) -> Result<TransferRecord, ClientError>;

    /// Available balance in minor units
    async fn check_balance(&self, account: &str) -> Result<i64, ClientError>;

    /// Lock `token_id` for `owner` under `lock_ref`, which identifies the
    /// lock to later conditional releases and to `AlreadyLocked` errors.
    async fn lock_custody(
        &self,
        token_id: &str,
        owner: &str,
        lock_ref: &str,
    ) -> Result<(), ClientError>;

    /// Release the lock on `token_id`. With `lock_ref` set, a lock taken
    /// under a different reference is left in place and reported as
    /// `AlreadyLocked`.
    async fn release_custody(
        &self,
        token_id: &str,
        lock_ref: Option<&str>,
    ) -> Result<(), ClientError>;

    async fn transfer_custody(&self, token_id: &str, new_owner: &str) -> Result<(), ClientError>;

    /// Push channel that yields the receipt once it turns terminal, for
    /// networks that support subscriptions. `None` means poll.
    fn subscribe_receipt(&self, _tx_ref: &TxRef) -> Option<watch::Receiver<ReceiptStatus>> {
        None
    }
}

/// Gateway error body
#[derive(Debug, Deserialize)]
struct GatewayError {
    error: String,
    #[serde(default)]
    holder: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    lock_ref: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_ref: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    available: String,
}

#[derive(Debug, Deserialize)]
struct HorizonTransaction {
    successful: bool,
}

#[derive(Debug, Deserialize)]
struct HorizonPayments {
    #[serde(rename = "_embedded")]
    embedded: HorizonEmbedded,
}

#[derive(Debug, Deserialize)]
struct HorizonEmbedded {
    records: Vec<HorizonPayment>,
}

#[derive(Debug, Deserialize)]
struct HorizonPayment {
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

/// Settlement gateway + Horizon client
#[derive(Clone)]
pub struct HttpSettlementClient {
    client: Client,
    gateway_url: String,
    horizon_url: String,
}

impl HttpSettlementClient {
    pub fn new(gateway_url: String, horizon_url: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_else(|_| Client::new()),
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            horizon_url: horizon_url.trim_end_matches('/').to_string(),
        }
    }

    async fn gateway_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ClientError> {
        let resp = self
            .client
            .post(format!("{}{}", self.gateway_url, path))
            .json(&body)
            .send()
            .await?;
        Ok(resp)
    }

    /// Map a non-success gateway response to a typed error
    async fn gateway_error(resp: reqwest::Response, token: &str) -> ClientError {
        let status = resp.status();
        let body = match resp.json::<GatewayError>().await {
            Ok(body) => body,
            Err(_) => return ClientError::Rejected(format!("gateway returned {}", status)),
        };
        match body.error.as_str() {
            "already_locked" => ClientError::AlreadyLocked {
                token: token.to_string(),
                holder: body.holder.unwrap_or_default(),
                lock_ref: body.lock_ref,
            },
            "not_locked" => ClientError::NotLocked(token.to_string()),
            "already_owned" => ClientError::AlreadyOwned {
                token: token.to_string(),
                owner: body.owner.unwrap_or_default(),
            },
            "not_found" => ClientError::NotFound(token.to_string()),
            other => ClientError::Rejected(body.message.unwrap_or_else(|| other.to_string())),
        }
    }

    async fn custody_call(
        &self,
        token_id: &str,
        action: &str,
        body: serde_json::Value,
    ) -> Result<(), ClientError> {
        let resp = self
            .gateway_post(&format!("/custody/{}/{}", token_id, action), body)
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::gateway_error(resp, token_id).await)
        }
    }
}

fn parse_units(raw: &str) -> Result<f64, ClientError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| ClientError::InvalidResponse(format!("unparsable amount '{}'", raw)))
}

#[async_trait]
impl SettlementClient for HttpSettlementClient {
    async fn submit_transfer(
        &self,
        from: &str,
        to: &str,
        amount: i64,
    ) -> Result<TxRef, ClientError> {
        let resp = self
            .gateway_post(
                "/transfers",
                json!({
                    "from": from,
                    "to": to,
                    "amount": format!("{:.2}", to_network_units(amount)),
                }),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(Self::gateway_error(resp, "").await);
        }
        let body: SubmitResponse = resp.json().await?;
        Ok(TxRef(body.tx_ref))
    }

    async fn get_receipt(&self, tx_ref: &TxRef) -> Result<ReceiptStatus, ClientError> {
        let resp = self
            .client
            .get(format!("{}/transactions/{}", self.horizon_url, tx_ref))
            .send()
            .await?;
        match resp.status() {
            // Horizon only serves ingested transactions
            StatusCode::NOT_FOUND => Ok(ReceiptStatus::Unknown),
            s if s.is_success() => {
                let tx: HorizonTransaction = resp.json().await?;
                Ok(if tx.successful {
                    ReceiptStatus::Success
                } else {
                    ReceiptStatus::Failure
                })
            }
            s => Err(ClientError::Network(format!("horizon returned {}", s))),
        }
    }

    async fn get_record(&self, tx_ref: &TxRef) -> Result<TransferRecord, ClientError> {
        let resp = self
            .client
            .get(format!("{}/transactions/{}/payments", self.horizon_url, tx_ref))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::RecordUnavailable(tx_ref.to_string()));
        }
        if !resp.status().is_success() {
            return Err(ClientError::Network(format!(
                "horizon returned {}",
                resp.status()
            )));
        }
        let payments: HorizonPayments = resp.json().await?;
        let payment = payments
            .embedded
            .records
            .into_iter()
            .find(|p| p.amount.is_some())
            .ok_or_else(|| ClientError::RecordUnavailable(tx_ref.to_string()))?;
        let amount = payment.amount.unwrap_or_default();

        Ok(TransferRecord {
            tx_ref: tx_ref.clone(),
            actual_amount: parse_units(&amount)?,
            from: payment.from.unwrap_or_default(),
            to: payment.to.unwrap_or_default(),
        })
    }

    async fn check_balance(&self, account: &str) -> Result<i64, ClientError> {
        let resp = self
            .client
            .get(format!("{}/accounts/{}/balance", self.gateway_url, account))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(account.to_string()));
        }
        if !resp.status().is_success() {
            return Err(ClientError::Network(format!(
                "gateway returned {}",
                resp.status()
            )));
        }
        let body: BalanceResponse = resp.json().await?;
        let units = parse_units(&body.available)?;
        Ok((units * MINOR_UNITS_PER_UNIT as f64).floor() as i64)
    }

    async fn lock_custody(
        &self,
        token_id: &str,
        owner: &str,
        lock_ref: &str,
    ) -> Result<(), ClientError> {
        self.custody_call(
            token_id,
            "lock",
            json!({ "owner": owner, "lock_ref": lock_ref }),
        )
        .await
    }

    async fn release_custody(
        &self,
        token_id: &str,
        lock_ref: Option<&str>,
    ) -> Result<(), ClientError> {
        self.custody_call(token_id, "release", json!({ "lock_ref": lock_ref }))
            .await
    }

    async fn transfer_custody(&self, token_id: &str, new_owner: &str) -> Result<(), ClientError> {
        self.custody_call(token_id, "transfer", json!({ "new_owner": new_owner }))
            .await
    }
}
