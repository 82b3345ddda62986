//! Health check handler

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::engine::SettlementEngine;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: String,
    ledger_mirroring: bool,
    version: String,
}

pub async fn health_check(
    State(engine): State<Arc<SettlementEngine>>,
) -> (StatusCode, Json<HealthResponse>) {
    let (status, database) = match engine.store().health_check().await {
        Ok(()) => (StatusCode::OK, "connected".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("error: {}", e)),
    };

    let body = HealthResponse {
        status: if status == StatusCode::OK {
            "healthy"
        } else {
            "unhealthy"
        }
        .to_string(),
        database,
        ledger_mirroring: engine.ledger().is_enabled(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status, Json(body))
}
