//! User rows: an opaque encrypted config blob per user handle.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub uuid: Uuid,
    pub password_hash: String,
    pub config_ciphertext: String,
    pub config_salt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

pub async fn find_by_uuid(pool: &PgPool, uuid: Uuid) -> Result<Option<UserRow>> {
    let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE uuid = $1")
        .bind(uuid)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn upsert(
    pool: &PgPool,
    uuid: Uuid,
    password_hash: &str,
    config_ciphertext: &str,
    config_salt: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO users (uuid, password_hash, config_ciphertext, config_salt)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (uuid) DO UPDATE
            SET config_ciphertext = $3, config_salt = $4, updated_at = NOW()
        "#,
    )
    .bind(uuid)
    .bind(password_hash)
    .bind(config_ciphertext)
    .bind(config_salt)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record that the user's config was read, for pruning stale accounts.
pub async fn touch_accessed(pool: &PgPool, uuid: Uuid) -> Result<()> {
    sqlx::query("UPDATE users SET accessed_at = NOW() WHERE uuid = $1")
        .bind(uuid)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete users not accessed for `max_days`. Returns the number deleted.
pub async fn prune_stale(pool: &PgPool, max_days: i64) -> Result<i64> {
    let result = sqlx::query(
        "DELETE FROM users WHERE accessed_at < NOW() - make_interval(days => $1::int)",
    )
    .bind(max_days)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() as i64)
}
