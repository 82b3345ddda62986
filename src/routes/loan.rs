//! Loan route definitions

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::*;
use crate::state::AppState;

pub fn loan_routes() -> Router<AppState> {
    Router::new()
        .route("/api/loans", post(open_loan))
        .route("/api/loans/:id", get(get_loan))
        .route("/api/loans/:id/fund", post(fund_loan))
        .route("/api/loans/:id/repay", post(repay_loan))
        .route("/api/loans/:id/claim", post(claim_collateral))
        .route("/api/loans/:id/cancel", post(cancel_loan))
}
