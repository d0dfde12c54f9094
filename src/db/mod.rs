//! Database module
//!
//! PostgreSQL backs the transactional memoizer, the key-value cache and
//! the user-config store. The pool is created once at startup; expired
//! rows and stale users are pruned periodically.

pub mod cache;
pub mod users;

pub use cache::DbCache;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

/// Open the pool behind the lock, cache and user tables.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    info!("lock/cache store online ({} connections max)", max_connections);

    Ok(pool)
}

/// Apply the embedded schema (users, distributed_locks, cache).
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("schema up to date");
    Ok(())
}

/// Cheap liveness probe used by the health endpoint.
pub async fn health_check(pool: &PgPool) -> bool {
    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => true,
        Err(e) => {
            error!("postgres probe failed: {}", e);
            false
        }
    }
}

/// Configuration for the prune task
#[derive(Debug, Clone)]
pub struct PruneConfig {
    /// How often to run pruning (in seconds)
    pub interval_secs: u64,
    /// Users not accessed for this many days are deleted
    pub max_days: i64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            max_days: 30,
        }
    }
}

/// Run a single prune cycle over cache rows, expired locks and stale users.
pub async fn run_prune(pool: &PgPool, config: &PruneConfig) {
    match cache::DbCache::new(pool.clone()).cleanup_expired().await {
        Ok(count) if count > 0 => tracing::info!("Prune: deleted {} expired cache rows", count),
        Ok(_) => {}
        Err(e) => tracing::warn!("Prune: cache cleanup failed: {}", e),
    }

    match sqlx::query("DELETE FROM distributed_locks WHERE expires_at < NOW()")
        .execute(pool)
        .await
    {
        Ok(result) if result.rows_affected() > 0 => {
            tracing::info!("Prune: deleted {} expired locks", result.rows_affected())
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Prune: lock cleanup failed: {}", e),
    }

    match users::prune_stale(pool, config.max_days).await {
        Ok(count) if count > 0 => tracing::info!("Prune: deleted {} stale users", count),
        Ok(_) => {}
        Err(e) => tracing::warn!("Prune: user cleanup failed: {}", e),
    }
}

/// Start the background prune task
///
/// Runs immediately on startup, then periodically at the configured
/// interval. Spawn with `tokio::spawn`.
pub async fn start_prune_task(pool: PgPool, config: PruneConfig) {
    tracing::info!(
        "Starting prune task (interval: {}s, max_days: {})",
        config.interval_secs,
        config.max_days
    );

    let mut interval = time::interval(Duration::from_secs(config.interval_secs));

    loop {
        interval.tick().await;
        run_prune(&pool, &config).await;
    }
}
