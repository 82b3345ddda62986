//! In-process simulated settlement network
//!
//! Deterministic stand-in for the gateway used in development mode and in
//! tests. Transfers follow a script (a receipt sequence plus record
//! behaviour), and faults can be queued per primitive, including faults that
//! take effect remotely before the caller sees the error.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use uuid::Uuid;

use super::client::{ClientError, SettlementClient};
use super::model::{to_network_units, ReceiptStatus, TransferRecord, TxRef};

/// How the detailed record of a scripted transfer behaves
#[derive(Debug, Clone, PartialEq)]
pub enum RecordScript {
    /// Reports exactly the submitted amount
    Exact,
    /// Reports this many network units regardless of the submitted amount
    Amount(f64),
    /// Record endpoint never serves this transfer
    Unavailable,
}

/// Behaviour of the next submitted transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferScript {
    /// Receipts returned on successive polls; the last one repeats
    pub receipts: Vec<ReceiptStatus>,
    pub record: RecordScript,
}

impl TransferScript {
    pub fn confirmed() -> Self {
        Self {
            receipts: vec![ReceiptStatus::Success],
            record: RecordScript::Exact,
        }
    }

    pub fn never_settles() -> Self {
        Self {
            receipts: vec![ReceiptStatus::Unknown],
            record: RecordScript::Exact,
        }
    }

    pub fn settles_after(polls: usize) -> Self {
        let mut receipts = vec![ReceiptStatus::Unknown; polls];
        receipts.push(ReceiptStatus::Success);
        Self {
            receipts,
            record: RecordScript::Exact,
        }
    }

    pub fn with_record(mut self, record: RecordScript) -> Self {
        self.record = record;
        self
    }

    fn final_status(&self) -> ReceiptStatus {
        self.receipts
            .last()
            .copied()
            .unwrap_or(ReceiptStatus::Unknown)
    }
}

impl Default for TransferScript {
    fn default() -> Self {
        Self::confirmed()
    }
}

/// Primitive a fault is queued against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Submit,
    Receipt,
    Record,
    Balance,
    Lock,
    Release,
    Transfer,
}

/// Queued fault
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail without any remote effect
    Fail(ClientError),
    /// Apply the effect remotely, then report the error to the caller
    ApplyThenFail(ClientError),
}

/// Custody state of a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodySnapshot {
    pub owner: String,
    pub locked_by: Option<String>,
    /// Reference of the current lock
    pub lock_ref: Option<String>,
    /// Locks ever applied to this token
    pub lock_count: u32,
}

struct SimTransfer {
    from: String,
    to: String,
    amount: i64,
    script: TransferScript,
    polls: usize,
    push: Option<watch::Sender<ReceiptStatus>>,
}

#[derive(Default)]
struct SimState {
    balances: HashMap<String, i64>,
    custody: HashMap<String, CustodySnapshot>,
    transfers: HashMap<TxRef, SimTransfer>,
    scripts: VecDeque<TransferScript>,
    faults: HashMap<SimOp, VecDeque<Fault>>,
    push_receipts: bool,
}

/// Simulated settlement network
#[derive(Default)]
pub struct SimulatedNetwork {
    state: Mutex<SimState>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver receipts through `subscribe_receipt` instead of polling only
    pub fn with_push_receipts(self) -> Self {
        self.lock_state().push_receipts = true;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, SimState> {
        // A panicked test thread must not wedge every other caller
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fund_account(&self, account: &str, amount: i64) {
        *self
            .lock_state()
            .balances
            .entry(account.to_string())
            .or_insert(0) += amount;
    }

    pub fn balance(&self, account: &str) -> i64 {
        self.lock_state()
            .balances
            .get(account)
            .copied()
            .unwrap_or(0)
    }

    pub fn mint_token(&self, token_id: &str, owner: &str) {
        self.lock_state().custody.insert(
            token_id.to_string(),
            CustodySnapshot {
                owner: owner.to_string(),
                locked_by: None,
                lock_ref: None,
                lock_count: 0,
            },
        );
    }

    pub fn custody(&self, token_id: &str) -> Option<CustodySnapshot> {
        self.lock_state().custody.get(token_id).cloned()
    }

    pub fn script_next_transfer(&self, script: TransferScript) {
        self.lock_state().scripts.push_back(script);
    }

    pub fn inject_fault(&self, op: SimOp, fault: Fault) {
        self.lock_state()
            .faults
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    pub fn submitted_transfers(&self) -> usize {
        self.lock_state().transfers.len()
    }

    /// Register a transfer made outside the engine, e.g. by a lender's wallet
    pub fn register_transfer(
        &self,
        from: &str,
        to: &str,
        amount: i64,
        script: TransferScript,
    ) -> TxRef {
        let mut state = self.lock_state();
        insert_transfer(&mut state, from, to, amount, script)
    }

    /// Push the final scripted receipt to subscribers
    pub fn deliver_receipt(&self, tx_ref: &TxRef) {
        let mut state = self.lock_state();
        if let Some(transfer) = state.transfers.get_mut(tx_ref) {
            let status = transfer.script.final_status();
            transfer.polls = transfer.script.receipts.len();
            if let Some(push) = &transfer.push {
                push.send_replace(status);
            }
        }
    }

    fn take_fault(state: &mut SimState, op: SimOp) -> Option<Fault> {
        state.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }
}

fn insert_transfer(
    state: &mut SimState,
    from: &str,
    to: &str,
    amount: i64,
    script: TransferScript,
) -> TxRef {
    let tx_ref = TxRef(format!("sim_{}", Uuid::new_v4().simple()));
    let push = if state.push_receipts {
        let initial = if script.receipts.first().map_or(false, |r| r.is_terminal()) {
            script.final_status()
        } else {
            ReceiptStatus::Unknown
        };
        Some(watch::channel(initial).0)
    } else {
        None
    };
    if script.final_status() == ReceiptStatus::Success {
        *state.balances.entry(from.to_string()).or_insert(0) -= amount;
        *state.balances.entry(to.to_string()).or_insert(0) += amount;
    }
    state.transfers.insert(
        tx_ref.clone(),
        SimTransfer {
            from: from.to_string(),
            to: to.to_string(),
            amount,
            script,
            polls: 0,
            push,
        },
    );
    tx_ref
}

fn lock_token(
    state: &mut SimState,
    token_id: &str,
    owner: &str,
    lock_ref: &str,
) -> Result<(), ClientError> {
    let custody = state
        .custody
        .get_mut(token_id)
        .ok_or_else(|| ClientError::NotFound(token_id.to_string()))?;
    if let Some(holder) = &custody.locked_by {
        return Err(ClientError::AlreadyLocked {
            token: token_id.to_string(),
            holder: holder.clone(),
            lock_ref: custody.lock_ref.clone(),
        });
    }
    if custody.owner != owner {
        return Err(ClientError::Rejected(format!(
            "token {} is not owned by {}",
            token_id, owner
        )));
    }
    custody.locked_by = Some(owner.to_string());
    custody.lock_ref = Some(lock_ref.to_string());
    custody.lock_count += 1;
    Ok(())
}

fn release_token(
    state: &mut SimState,
    token_id: &str,
    lock_ref: Option<&str>,
) -> Result<(), ClientError> {
    let custody = state
        .custody
        .get_mut(token_id)
        .ok_or_else(|| ClientError::NotFound(token_id.to_string()))?;
    let holder = match &custody.locked_by {
        Some(holder) => holder.clone(),
        None => return Err(ClientError::NotLocked(token_id.to_string())),
    };
    if let Some(expected) = lock_ref {
        if custody.lock_ref.as_deref() != Some(expected) {
            return Err(ClientError::AlreadyLocked {
                token: token_id.to_string(),
                holder,
                lock_ref: custody.lock_ref.clone(),
            });
        }
    }
    custody.locked_by = None;
    custody.lock_ref = None;
    Ok(())
}

fn transfer_token(state: &mut SimState, token_id: &str, new_owner: &str) -> Result<(), ClientError> {
    let custody = state
        .custody
        .get_mut(token_id)
        .ok_or_else(|| ClientError::NotFound(token_id.to_string()))?;
    if custody.owner == new_owner && custody.locked_by.is_none() {
        return Err(ClientError::AlreadyOwned {
            token: token_id.to_string(),
            owner: new_owner.to_string(),
        });
    }
    custody.owner = new_owner.to_string();
    custody.locked_by = None;
    custody.lock_ref = None;
    Ok(())
}

/// Run `apply` unless a fault is queued for `op`
fn with_fault<T>(
    state: &mut SimState,
    op: SimOp,
    apply: impl FnOnce(&mut SimState) -> Result<T, ClientError>,
) -> Result<T, ClientError> {
    match SimulatedNetwork::take_fault(state, op) {
        Some(Fault::Fail(err)) => Err(err),
        Some(Fault::ApplyThenFail(err)) => {
            apply(state)?;
            Err(err)
        }
        None => apply(state),
    }
}

#[async_trait]
impl SettlementClient for SimulatedNetwork {
    async fn submit_transfer(
        &self,
        from: &str,
        to: &str,
        amount: i64,
    ) -> Result<TxRef, ClientError> {
        let mut state = self.lock_state();
        with_fault(&mut state, SimOp::Submit, |state| {
            let available = state.balances.get(from).copied().unwrap_or(0);
            if available < amount {
                return Err(ClientError::Rejected(format!(
                    "insufficient funds in {}",
                    from
                )));
            }
            let script = state.scripts.pop_front().unwrap_or_default();
            Ok(insert_transfer(state, from, to, amount, script))
        })
    }

    async fn get_receipt(&self, tx_ref: &TxRef) -> Result<ReceiptStatus, ClientError> {
        let mut state = self.lock_state();
        with_fault(&mut state, SimOp::Receipt, |state| {
            let transfer = state
                .transfers
                .get_mut(tx_ref)
                .ok_or_else(|| ClientError::NotFound(tx_ref.to_string()))?;
            let receipts = &transfer.script.receipts;
            let idx = transfer.polls.min(receipts.len().saturating_sub(1));
            transfer.polls += 1;
            Ok(receipts.get(idx).copied().unwrap_or(ReceiptStatus::Unknown))
        })
    }

    async fn get_record(&self, tx_ref: &TxRef) -> Result<TransferRecord, ClientError> {
        let mut state = self.lock_state();
        with_fault(&mut state, SimOp::Record, |state| {
            let transfer = state
                .transfers
                .get(tx_ref)
                .ok_or_else(|| ClientError::RecordUnavailable(tx_ref.to_string()))?;
            let actual_amount = match transfer.script.record {
                RecordScript::Exact => to_network_units(transfer.amount),
                RecordScript::Amount(units) => units,
                RecordScript::Unavailable => {
                    return Err(ClientError::RecordUnavailable(tx_ref.to_string()))
                }
            };
            Ok(TransferRecord {
                tx_ref: tx_ref.clone(),
                actual_amount,
                from: transfer.from.clone(),
                to: transfer.to.clone(),
            })
        })
    }

    async fn check_balance(&self, account: &str) -> Result<i64, ClientError> {
        let mut state = self.lock_state();
        with_fault(&mut state, SimOp::Balance, |state| {
            Ok(state.balances.get(account).copied().unwrap_or(0))
        })
    }

    async fn lock_custody(
        &self,
        token_id: &str,
        owner: &str,
        lock_ref: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.lock_state();
        with_fault(&mut state, SimOp::Lock, |state| {
            lock_token(state, token_id, owner, lock_ref)
        })
    }

    async fn release_custody(
        &self,
        token_id: &str,
        lock_ref: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut state = self.lock_state();
        with_fault(&mut state, SimOp::Release, |state| {
            release_token(state, token_id, lock_ref)
        })
    }

    async fn transfer_custody(&self, token_id: &str, new_owner: &str) -> Result<(), ClientError> {
        let mut state = self.lock_state();
        with_fault(&mut state, SimOp::Transfer, |state| {
            transfer_token(state, token_id, new_owner)
        })
    }

    fn subscribe_receipt(&self, tx_ref: &TxRef) -> Option<watch::Receiver<ReceiptStatus>> {
        let state = self.lock_state();
        state
            .transfers
            .get(tx_ref)
            .and_then(|t| t.push.as_ref())
            .map(|push| push.subscribe())
    }
}
