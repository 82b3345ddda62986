//! PostgreSQL store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{LoanStore, StoreError, Transition};
use crate::loan::Loan;
use crate::models::{
    AccountId, Asset, AssetStatus, AttemptStatus, ExternalAttempt, ExternalOperation,
    LifecycleEvent, Reputation,
};

/// sqlx-backed `LoanStore`
#[derive(Clone)]
pub struct PgLoanStore {
    pool: PgPool,
}

impl PgLoanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_event<'e, E>(executor: E, event: &LifecycleEvent) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO lifecycle_events (id, event_type, loan_id, asset_id, metadata, digest, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(event.id)
    .bind(event.event_type)
    .bind(event.loan_id)
    .bind(event.asset_id)
    .bind(&event.metadata)
    .bind(&event.digest)
    .bind(event.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl LoanStore for PgLoanStore {
    async fn get_loan(&self, id: Uuid) -> Result<Loan, StoreError> {
        sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { entity: "loan", id })
    }

    async fn get_asset(&self, id: Uuid) -> Result<Asset, StoreError> {
        sqlx::query_as::<_, Asset>("SELECT * FROM assets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { entity: "asset", id })
    }

    async fn get_reputation(&self, account: AccountId) -> Result<Reputation, StoreError> {
        let reputation =
            sqlx::query_as::<_, Reputation>("SELECT * FROM reputations WHERE account_id = $1")
                .bind(account)
                .fetch_optional(&self.pool)
                .await?;
        Ok(reputation.unwrap_or_else(|| Reputation::new(account)))
    }

    async fn settlement_address(&self, account: AccountId) -> Result<Option<String>, StoreError> {
        let row = sqlx::query_as::<_, (Option<String>,)>(
            "SELECT settlement_address FROM accounts WHERE id = $1",
        )
        .bind(account)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(address,)| address))
    }

    async fn create_loan(
        &self,
        loan: &Loan,
        expected_asset_status: AssetStatus,
        event: &LifecycleEvent,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE assets
            SET status = 'collateralized', updated_at = $1
            WHERE id = $2 AND status = $3
            "#,
        )
        .bind(loan.created_at)
        .bind(loan.asset_id)
        .bind(expected_asset_status)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::AssetChanged {
                asset_id: loan.asset_id,
                expected: expected_asset_status,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO loans (
                id, borrower_id, lender_id, asset_id, principal, interest_rate_bps,
                duration_days, grace_period_days, ltv_bps, express, status, version,
                funded_at, due_at, resolved_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(loan.id)
        .bind(loan.borrower_id)
        .bind(loan.lender_id)
        .bind(loan.asset_id)
        .bind(loan.principal)
        .bind(loan.interest_rate_bps)
        .bind(loan.duration_days)
        .bind(loan.grace_period_days)
        .bind(loan.ltv_bps)
        .bind(loan.express)
        .bind(loan.status)
        .bind(loan.version)
        .bind(loan.funded_at)
        .bind(loan.due_at)
        .bind(loan.resolved_at)
        .bind(loan.created_at)
        .bind(loan.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_event(&mut *tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_transition(&self, transition: &Transition) -> Result<(), StoreError> {
        let loan = &transition.loan;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE loans
            SET status = $1, lender_id = $2, funded_at = $3, due_at = $4,
                resolved_at = $5, version = $6, updated_at = $7
            WHERE id = $8 AND status = $9 AND version = $10
            "#,
        )
        .bind(loan.status)
        .bind(loan.lender_id)
        .bind(loan.funded_at)
        .bind(loan.due_at)
        .bind(loan.resolved_at)
        .bind(loan.version)
        .bind(loan.updated_at)
        .bind(loan.id)
        .bind(transition.expected_status)
        .bind(transition.expected_version())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::StaleState {
                loan_id: loan.id,
                expected: transition.expected_status,
                version: transition.expected_version(),
            });
        }

        if let Some(asset) = &transition.asset {
            sqlx::query(
                r#"
                UPDATE assets
                SET status = $1, owner_id = COALESCE($2, owner_id), updated_at = $3
                WHERE id = $4
                "#,
            )
            .bind(asset.status)
            .bind(asset.owner_id)
            .bind(loan.updated_at)
            .bind(asset.asset_id)
            .execute(&mut *tx)
            .await?;
        }

        for reputation in &transition.reputations {
            sqlx::query(
                r#"
                INSERT INTO reputations (
                    account_id, completed_loans, defaulted_loans, verified_transactions,
                    score, risk_tier, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (account_id) DO UPDATE SET
                    completed_loans = EXCLUDED.completed_loans,
                    defaulted_loans = EXCLUDED.defaulted_loans,
                    verified_transactions = EXCLUDED.verified_transactions,
                    score = EXCLUDED.score,
                    risk_tier = EXCLUDED.risk_tier,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(reputation.account_id)
            .bind(reputation.completed_loans)
            .bind(reputation.defaulted_loans)
            .bind(reputation.verified_transactions)
            .bind(reputation.score)
            .bind(reputation.risk_tier)
            .bind(reputation.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        insert_event(&mut *tx, &transition.event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_event(&self, event: &LifecycleEvent) -> Result<(), StoreError> {
        insert_event(&self.pool, event).await?;
        Ok(())
    }

    async fn record_mirror(&self, event_id: Uuid, receipt: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_mirrors (event_id, receipt, mirrored_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(receipt)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unmirrored_events(&self, limit: i64) -> Result<Vec<LifecycleEvent>, StoreError> {
        let events = sqlx::query_as::<_, LifecycleEvent>(
            r#"
            SELECT e.*
            FROM lifecycle_events e
            LEFT JOIN ledger_mirrors m ON m.event_id = e.id
            WHERE m.event_id IS NULL
            ORDER BY e.created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn record_attempt(&self, attempt: &ExternalAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO external_attempts (
                id, loan_id, operation, reference, detail, status, created_at, resolved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.loan_id)
        .bind(attempt.operation)
        .bind(&attempt.reference)
        .bind(&attempt.detail)
        .bind(attempt.status)
        .bind(attempt.created_at)
        .bind(attempt.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        resolved_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // Unresolved attempts stay open for the reconciliation monitor
        let resolved_at = (status != AttemptStatus::Unresolved).then_some(resolved_at);
        sqlx::query("UPDATE external_attempts SET status = $1, resolved_at = $2 WHERE id = $3")
            .bind(status)
            .bind(resolved_at)
            .bind(attempt_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn resolve_open_attempts(
        &self,
        operation: ExternalOperation,
        reference: &str,
        status: AttemptStatus,
        resolved_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let resolved_at = (status != AttemptStatus::Unresolved).then_some(resolved_at);
        let result = sqlx::query(
            r#"
            UPDATE external_attempts
            SET status = $1, resolved_at = $2
            WHERE operation = $3 AND reference = $4 AND status IN ('started', 'unresolved')
            "#,
        )
        .bind(status)
        .bind(resolved_at)
        .bind(operation)
        .bind(reference)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn close_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        note: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<ExternalAttempt, StoreError> {
        sqlx::query_as::<_, ExternalAttempt>(
            r#"
            UPDATE external_attempts
            SET status = $1,
                resolved_at = $2,
                detail = detail || jsonb_build_object('resolution_note', $3::text)
            WHERE id = $4 AND status IN ('started', 'unresolved')
            RETURNING *
            "#,
        )
        .bind(status)
        .bind(resolved_at)
        .bind(note)
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "open attempt",
            id: attempt_id,
        })
    }

    async fn unresolved_attempts(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ExternalAttempt>, StoreError> {
        let attempts = sqlx::query_as::<_, ExternalAttempt>(
            r#"
            SELECT * FROM external_attempts
            WHERE status IN ('started', 'unresolved') AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    async fn settled_reference_exists(&self, reference: &str) -> Result<bool, StoreError> {
        let (exists,) = sqlx::query_as::<_, (bool,)>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM external_attempts
                WHERE operation = 'settlement_verify' AND status = 'succeeded' AND reference = $1
            )
            "#,
        )
        .bind(reference)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        crate::db::ping(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Requires a migrated database:
    //   TEST_DATABASE_URL=postgres://... cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_missing_loan_is_not_found() {
        let url = std::env::var("TEST_DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();
        let store = PgLoanStore::new(pool);

        let id = Uuid::new_v4();
        assert_eq!(
            store.get_loan(id).await,
            Err(StoreError::NotFound { entity: "loan", id })
        );
        store.health_check().await.unwrap();
    }
}
