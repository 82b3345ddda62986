//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::engine::SettlementEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SettlementEngine>) -> Self {
        Self { engine }
    }
}

impl FromRef<AppState> for Arc<SettlementEngine> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.engine.clone()
    }
}
