//! PostgreSQL lock store
//!
//! The acquire path is a single `INSERT .. ON CONFLICT .. DO UPDATE .. WHERE`
//! statement: insert wins when no row exists, the conditional update wins
//! when the existing row has expired, and a held lock leaves zero rows
//! affected. No read-then-write window exists.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};

use conveyor_core::status::LockType;

use crate::error::StoreError;
use crate::models::{LockRow, LockStats};
use crate::store::LockStore;

/// PostgreSQL implementation of [`LockStore`].
#[derive(Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    #[instrument(skip(self, lock_data))]
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        lock_type: LockType,
        lock_data: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        let result = sqlx::query(
            r#"
            INSERT INTO locks (lock_key, owner, lock_type, expires_at, lock_data)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (lock_key) DO UPDATE
            SET owner = EXCLUDED.owner,
                lock_type = EXCLUDED.lock_type,
                expires_at = EXCLUDED.expires_at,
                lock_data = EXCLUDED.lock_data,
                updated_at = NOW()
            WHERE locks.expires_at < NOW()
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(lock_type.to_string())
        .bind(expires_at)
        .bind(&lock_data)
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() > 0;
        if acquired {
            debug!(key, owner, "acquired lock");
        }
        Ok(acquired)
    }

    #[instrument(skip(self))]
    async fn release(&self, key: &str, owner: Option<&str>) -> Result<bool, StoreError> {
        let result = match owner {
            Some(owner) => {
                sqlx::query("DELETE FROM locks WHERE lock_key = $1 AND owner = $2")
                    .bind(key)
                    .bind(owner)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM locks WHERE lock_key = $1")
                    .bind(key)
                    .execute(&self.pool)
                    .await?
            }
        };

        let released = result.rows_affected() > 0;
        if released {
            debug!(key, "released lock");
        }
        Ok(released)
    }

    #[instrument(skip(self, lock_data))]
    async fn renew(
        &self,
        key: &str,
        owner: &str,
        new_expires_at: DateTime<Utc>,
        lock_data: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE locks
            SET expires_at = $3,
                lock_data = COALESCE($4, lock_data),
                updated_at = NOW()
            WHERE lock_key = $1 AND owner = $2 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(new_expires_at)
        .bind(&lock_data)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM locks WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(count = removed, "cleaned up expired locks");
        }
        Ok(removed)
    }

    async fn get(&self, key: &str) -> Result<Option<LockRow>, StoreError> {
        let row = sqlx::query_as::<_, LockRow>(
            r#"
            SELECT lock_key, owner, lock_type, expires_at, lock_data, created_at, updated_at
            FROM locks
            WHERE lock_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_by_owner(&self, owner: &str) -> Result<Vec<LockRow>, StoreError> {
        let rows = sqlx::query_as::<_, LockRow>(
            r#"
            SELECT lock_key, owner, lock_type, expires_at, lock_data, created_at, updated_at
            FROM locks
            WHERE owner = $1
            ORDER BY lock_key
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_by_lock_type(&self, lock_type: LockType) -> Result<Vec<LockRow>, StoreError> {
        let rows = sqlx::query_as::<_, LockRow>(
            r#"
            SELECT lock_key, owner, lock_type, expires_at, lock_data, created_at, updated_at
            FROM locks
            WHERE lock_type = $1
            ORDER BY lock_key
            "#,
        )
        .bind(lock_type.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn statistics(&self) -> Result<LockStats, StoreError> {
        use sqlx::Row;

        let rows = sqlx::query(
            r#"
            SELECT lock_type,
                   COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE expires_at < NOW()) AS expired
            FROM locks
            GROUP BY lock_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = LockStats::default();
        for row in rows {
            let lock_type: String = row.get("lock_type");
            let total: i64 = row.get("total");
            let expired: i64 = row.get("expired");
            stats.total += total;
            stats.expired += expired;
            stats.by_type.insert(lock_type, total);
        }
        Ok(stats)
    }
}

