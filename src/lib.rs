//! ParcelVault Settlement Engine
//!
//! Loan and collateral settlement for tokenized real-estate parcels: the
//! loan state machine, custody and settlement coordination against an
//! external value network, reputation, and the lifecycle ledger mirror.

pub mod config;
pub mod custody;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod loan;
pub mod middleware;
pub mod models;
pub mod reputation;
pub mod routes;
pub mod settlement;
pub mod state;
pub mod store;

use axum::{routing::get, Router};

use state::AppState;

/// API router with the per-request middleware; CORS is added by the binary
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(handlers::health_check))
        .merge(routes::loan_routes())
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(axum::middleware::from_fn(middleware::request_tracing))
}

async fn root() -> &'static str {
    "ParcelVault Settlement Engine"
}
