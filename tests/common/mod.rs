//! Shared fixtures: an engine wired to the in-memory store, the simulated
//! network and an in-memory ledger, on a manual clock.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use parcelvault_server::config::{CustodyPolicy, LoanPolicy, VerificationPolicy};
use parcelvault_server::engine::{EngineSettings, ManualClock, SettlementEngine};
use parcelvault_server::ledger::{LedgerPublisher, LedgerSink, MemoryLedgerSink};
use parcelvault_server::loan::LoanTerms;
use parcelvault_server::models::{Asset, AssetStatus};
use parcelvault_server::settlement::simulated::SimulatedNetwork;
use parcelvault_server::store::InMemoryStore;

pub const BORROWER_ADDR: &str = "GBORROWER";
pub const LENDER_ADDR: &str = "GLENDER";
pub const PLATFORM_ADDR: &str = "GTREASURY";
pub const TOKEN: &str = "PARCEL-1";

pub struct Harness {
    pub engine: Arc<SettlementEngine>,
    pub store: Arc<InMemoryStore>,
    pub network: Arc<SimulatedNetwork>,
    pub sink: Arc<MemoryLedgerSink>,
    pub clock: Arc<ManualClock>,
    pub borrower: Uuid,
    pub lender: Uuid,
    pub asset: Asset,
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        verification: VerificationPolicy {
            max_attempts: 3,
            poll_interval: Duration::from_millis(5),
            amount_tolerance: 0.0001,
            accept_unverified_amount: true,
        },
        custody: CustodyPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
        },
        loan_policy: LoanPolicy::default(),
        platform_settlement_address: PLATFORM_ADDR.to_string(),
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let network = Arc::new(SimulatedNetwork::new());
        let sink = Arc::new(MemoryLedgerSink::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap(),
        ));

        let borrower = Uuid::new_v4();
        let lender = Uuid::new_v4();
        store.register_account(borrower, BORROWER_ADDR);
        store.register_account(lender, LENDER_ADDR);
        network.fund_account(LENDER_ADDR, 50_000_000);
        network.fund_account(BORROWER_ADDR, 5_000_000);

        let ledger = LedgerPublisher::new(
            Some(sink.clone() as Arc<dyn LedgerSink>),
            store.clone(),
        );
        let engine = SettlementEngine::new(store.clone(), network.clone(), ledger, settings)
            .with_clock(clock.clone());

        let asset = listed_asset(&store, &network, borrower, TOKEN, 10_000_000);

        Self {
            engine: Arc::new(engine),
            store,
            network,
            sink,
            clock,
            borrower,
            lender,
            asset,
        }
    }

    pub fn add_asset(&self, token: &str, value: i64) -> Asset {
        listed_asset(&self.store, &self.network, self.borrower, token, value)
    }
}

/// Listed asset owned by `owner`, with its token minted to the borrower address
fn listed_asset(
    store: &InMemoryStore,
    network: &SimulatedNetwork,
    owner: Uuid,
    token: &str,
    value: i64,
) -> Asset {
    let now = Utc::now();
    let asset = Asset {
        id: Uuid::new_v4(),
        owner_id: owner,
        custody_token_id: Some(token.to_string()),
        value,
        status: AssetStatus::Listed,
        created_at: now,
        updated_at: now,
    };
    store.insert_asset(asset.clone());
    network.mint_token(token, BORROWER_ADDR);
    asset
}

/// 10,000.00 at 8.5% for 30 days, no grace
pub fn terms() -> LoanTerms {
    LoanTerms {
        principal: 1_000_000,
        interest_rate_bps: 850,
        duration_days: 30,
        grace_period_days: 0,
        express: false,
    }
}

pub fn express_terms() -> LoanTerms {
    LoanTerms {
        express: true,
        ..terms()
    }
}

/// Let spawned ledger publishes run
pub async fn settle_background() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
