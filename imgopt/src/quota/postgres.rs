//! PostgreSQL-backed [`CreditStore`].
//!
//! The conditional `UPDATE ... WHERE balance = $expected` is the compare-and-swap; no row lock is
//! held between the ledger's read and its write.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

use super::{CreditStore, StoreError};
use crate::types::{UserId, abbrev_uuid};

#[derive(Debug, Clone)]
pub struct PostgresCreditStore {
    pool: PgPool,
}

impl PostgresCreditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))?;
        info!("credit store migrations applied");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CreditStore for PostgresCreditStore {
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    async fn open_account(&self, user_id: UserId, initial: i64) -> Result<i64, StoreError> {
        sqlx::query("INSERT INTO credit_accounts (user_id, balance) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .bind(initial)
            .execute(&self.pool)
            .await?;

        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM credit_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(balance)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    async fn balance(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM credit_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    async fn compare_and_swap(&self, user_id: UserId, expected: i64, new: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE credit_accounts SET balance = $3, updated_at = NOW() WHERE user_id = $1 AND balance = $2",
        )
        .bind(user_id)
        .bind(expected)
        .bind(new)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
