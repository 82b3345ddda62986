//! Postgres bootstrap for the loan store: pool, schema and ping.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::Config;

/// Seconds a request may wait for a pooled connection
const ACQUIRE_TIMEOUT_SECS: u64 = 5;
/// Idle connections are dropped after ten minutes
const IDLE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("loan store unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("loan store schema could not be applied: {0}")]
    Schema(String),

    #[error("loan store did not answer: {0}")]
    Ping(String),
}

/// Connect and bring the schema up to date. The store is unusable until both succeed.
pub async fn open(config: &Config) -> Result<PgPool, DbError> {
    let url = config.database_url_masked();
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
        .idle_timeout(Duration::from_secs(IDLE_TIMEOUT_SECS))
        .connect(&config.database_url)
        .await
        .map_err(|e| DbError::Unreachable {
            url: url.clone(),
            reason: e.to_string(),
        })?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| DbError::Schema(e.to_string()))?;

    tracing::info!(
        database = %url,
        max_connections = config.db_max_connections,
        "Loan store ready"
    );
    Ok(pool)
}

/// Round trip used by the store's health check
pub async fn ping(pool: &PgPool) -> Result<(), DbError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(|e| DbError::Ping(e.to_string()))
}
