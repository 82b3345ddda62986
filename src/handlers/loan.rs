//! Loan lifecycle handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::engine::SettlementEngine;
use crate::error::ApiError;
use crate::loan::{
    CancelLoanRequest, ClaimCollateralRequest, FundLoanRequest, Loan, OpenLoanRequest,
    RepayLoanRequest, RepaymentReceipt,
};
use crate::models::ApiResponse;

pub async fn open_loan(
    State(engine): State<Arc<SettlementEngine>>,
    Json(request): Json<OpenLoanRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Loan>>), ApiError> {
    request.validate()?;

    let loan = engine
        .open_loan(request.borrower_id, request.asset_id, request.terms)
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::ok(loan))))
}

pub async fn get_loan(
    State(engine): State<Arc<SettlementEngine>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Loan>>, ApiError> {
    let loan = engine.get_loan(id).await?;
    Ok(Json(ApiResponse::ok(loan)))
}

pub async fn fund_loan(
    State(engine): State<Arc<SettlementEngine>>,
    Path(id): Path<Uuid>,
    Json(request): Json<FundLoanRequest>,
) -> Result<Json<ApiResponse<Loan>>, ApiError> {
    let loan = engine.fund_loan(id, request).await?;
    Ok(Json(ApiResponse::ok(loan)))
}

pub async fn repay_loan(
    State(engine): State<Arc<SettlementEngine>>,
    Path(id): Path<Uuid>,
    Json(request): Json<RepayLoanRequest>,
) -> Result<Json<ApiResponse<RepaymentReceipt>>, ApiError> {
    let receipt = engine.repay_loan(id, request).await?;
    Ok(Json(ApiResponse::ok(receipt)))
}

pub async fn claim_collateral(
    State(engine): State<Arc<SettlementEngine>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ClaimCollateralRequest>,
) -> Result<Json<ApiResponse<Loan>>, ApiError> {
    let loan = engine.claim_collateral(id, request).await?;
    Ok(Json(ApiResponse::ok(loan)))
}

pub async fn cancel_loan(
    State(engine): State<Arc<SettlementEngine>>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelLoanRequest>,
) -> Result<Json<ApiResponse<Loan>>, ApiError> {
    let loan = engine.cancel_loan(id, request).await?;
    Ok(Json(ApiResponse::ok(loan)))
}
