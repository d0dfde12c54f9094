//! General-purpose key-value cache table, used when no broadcast backend
//! is configured.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::PgPool;

/// PostgreSQL-backed key-value cache with TTL rows.
#[derive(Clone)]
pub struct DbCache {
    pool: PgPool,
}

impl DbCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: u64) -> Result<()> {
        let expires_at = Utc::now() + Duration::seconds(ttl_seconds as i64);
        let serialized = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO cache (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = $2, expires_at = $3
            "#,
        )
        .bind(key)
        .bind(serialized)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a live entry; expired rows read as absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM cache WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((value,)) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Delete expired rows. Returns the number deleted.
    pub async fn cleanup_expired(&self) -> Result<i64> {
        let result = sqlx::query("DELETE FROM cache WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as i64)
    }
}
