//! Distributed lock / memoizer
//!
//! Single-flight coordination across the deployment: for N concurrent
//! callers of the same key, exactly one producer runs; every other caller
//! blocks until the winner's serialized result (or error) is observed, or
//! the wait times out. The winner's JSON payload is what waiters
//! deserialize, so replayed results are byte-identical.
//!
//! Two backends: a broadcast backend (Redis SET NX EX + pub/sub) and a
//! transactional backend (a `distributed_locks` table polled by waiters).

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::PgPool;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::redis::RedisService;

/// Lock acquisition options.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Lock lifetime; expiry is the crash-safety bound.
    pub ttl: Duration,
    /// How long a waiter blocks before giving up.
    pub timeout: Duration,
    /// Poll interval for the transactional backend.
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            timeout: Duration::from_secs(15),
            retry_interval: Duration::from_millis(250),
        }
    }
}

/// Outcome of a `with_lock` call.
#[derive(Debug, Clone)]
pub struct LockOutcome<T> {
    pub result: T,
    /// False for the winner, true for callers replaying its result.
    pub cached: bool,
}

/// Lock failure kinds.
#[derive(Debug)]
pub enum LockError {
    /// The wait for the winner's result exceeded the timeout, or the
    /// winner died before publishing.
    Timeout,
    /// The chosen producer failed; every waiter observes the same message.
    Producer(String),
    /// Backend communication failed.
    Backend(anyhow::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Timeout => write!(f, "timed out waiting for lock result"),
            LockError::Producer(msg) => write!(f, "producer failed: {}", msg),
            LockError::Backend(e) => write!(f, "lock backend error: {}", e),
        }
    }
}

impl std::error::Error for LockError {}

/// Serialized producer outcome shared with waiters.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum LockMessage {
    Ok(serde_json::Value),
    Err(String),
}

enum Backend {
    Broadcast(RedisService),
    Transactional(PgPool),
    /// Single-process fallback when neither backend is configured.
    Local(tokio::sync::Mutex<std::collections::HashMap<String, (String, tokio::time::Instant)>>),
}

/// The deployment-wide memoizer.
pub struct Memoizer {
    backend: Backend,
    owner: String,
}

impl Memoizer {
    pub fn broadcast(redis: RedisService) -> Self {
        Self {
            backend: Backend::Broadcast(redis),
            owner: Uuid::new_v4().to_string(),
        }
    }

    pub fn transactional(pool: PgPool) -> Self {
        Self {
            backend: Backend::Transactional(pool),
            owner: Uuid::new_v4().to_string(),
        }
    }

    pub fn local() -> Self {
        Self {
            backend: Backend::Local(tokio::sync::Mutex::new(std::collections::HashMap::new())),
            owner: Uuid::new_v4().to_string(),
        }
    }

    /// Run `producer` under a single-flight lock for `key`.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        producer: F,
        options: LockOptions,
    ) -> Result<LockOutcome<T>, LockError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match &self.backend {
            Backend::Broadcast(redis) => self.broadcast_flow(redis, key, producer, options).await,
            Backend::Transactional(pool) => {
                self.transactional_flow(pool, key, producer, options).await
            }
            Backend::Local(results) => self.local_flow(results, key, producer, options).await,
        }
    }

    async fn run_producer<T, F, Fut>(producer: F) -> (Result<T, LockError>, LockMessage)
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match producer().await {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(value) => (Ok(result), LockMessage::Ok(value)),
                Err(e) => {
                    let msg = format!("result serialization failed: {}", e);
                    (Err(LockError::Producer(msg.clone())), LockMessage::Err(msg))
                }
            },
            Err(e) => {
                let msg = e.to_string();
                (Err(LockError::Producer(msg.clone())), LockMessage::Err(msg))
            }
        }
    }

    fn decode<T: DeserializeOwned>(message: LockMessage) -> Result<LockOutcome<T>, LockError> {
        match message {
            LockMessage::Ok(value) => {
                let result = serde_json::from_value(value)
                    .map_err(|e| LockError::Backend(anyhow::anyhow!(e)))?;
                Ok(LockOutcome {
                    result,
                    cached: true,
                })
            }
            LockMessage::Err(msg) => Err(LockError::Producer(msg)),
        }
    }

    // ============ Broadcast backend ============

    async fn broadcast_flow<T, F, Fut>(
        &self,
        redis: &RedisService,
        key: &str,
        producer: F,
        options: LockOptions,
    ) -> Result<LockOutcome<T>, LockError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let lock_key = format!("lock:{}", key);
        let result_key = format!("lock:result:{}", key);
        let channel = format!("lock:channel:{}", key);
        let ttl_secs = options.ttl.as_secs().max(1);

        let acquired = redis
            .set_nx_ex(&lock_key, &self.owner, ttl_secs)
            .await
            .map_err(LockError::Backend)?;

        if acquired {
            debug!("lock {} acquired, running producer", key);
            let (outcome, message) = Self::run_producer(producer).await;
            let payload =
                serde_json::to_string(&message).map_err(|e| LockError::Backend(e.into()))?;
            // Result lands in the store before the lock is released, so a
            // waiter that misses the publish still finds it.
            if let Err(e) = redis.set_raw_ex(&result_key, &payload, ttl_secs).await {
                warn!("failed to store lock result for {}: {}", key, e);
            }
            if let Err(e) = redis.publish(&channel, &payload).await {
                warn!("failed to publish lock result for {}: {}", key, e);
            }
            if let Err(e) = redis.del(&lock_key).await {
                warn!("failed to release lock {}: {}", key, e);
            }
            return outcome.map(|result| LockOutcome {
                result,
                cached: false,
            });
        }

        // Subscribe before re-checking the lock so no publish is missed.
        let mut pubsub = redis
            .subscribe(&channel)
            .await
            .map_err(LockError::Backend)?;

        if !redis.exists(&lock_key).await.map_err(LockError::Backend)? {
            // The winner already finished. Its result should be in the
            // store; a missing result means it died before publishing.
            return match redis.get_raw(&result_key).await.map_err(LockError::Backend)? {
                Some(payload) => {
                    let message: LockMessage = serde_json::from_str(&payload)
                        .map_err(|e| LockError::Backend(e.into()))?;
                    Self::decode(message)
                }
                None => Err(LockError::Timeout),
            };
        }

        let wait = async move {
            let mut stream = pubsub.on_message();
            stream.next().await
        };
        match tokio::time::timeout(options.timeout, wait).await {
            Ok(Some(msg)) => {
                let payload: String = msg
                    .get_payload()
                    .map_err(|e| LockError::Backend(e.into()))?;
                let message: LockMessage =
                    serde_json::from_str(&payload).map_err(|e| LockError::Backend(e.into()))?;
                Self::decode(message)
            }
            Ok(None) => Err(LockError::Timeout),
            Err(_) => Err(LockError::Timeout),
        }
    }

    // ============ Transactional backend ============

    async fn transactional_flow<T, F, Fut>(
        &self,
        pool: &PgPool,
        key: &str,
        producer: F,
        options: LockOptions,
    ) -> Result<LockOutcome<T>, LockError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // Expired locks are swept opportunistically at every acquisition.
        sqlx::query("DELETE FROM distributed_locks WHERE expires_at < NOW()")
            .execute(pool)
            .await
            .map_err(|e| LockError::Backend(e.into()))?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(options.ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let inserted = sqlx::query(
            r#"
            INSERT INTO distributed_locks (key, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(&self.owner)
        .bind(expires_at)
        .execute(pool)
        .await
        .map_err(|e| LockError::Backend(e.into()))?;

        if inserted.rows_affected() == 1 {
            debug!("lock {} acquired, running producer", key);
            let (outcome, message) = Self::run_producer(producer).await;
            let payload =
                serde_json::to_string(&message).map_err(|e| LockError::Backend(e.into()))?;
            // The row stays until its TTL so waiters can poll the result.
            if let Err(e) = sqlx::query(
                "UPDATE distributed_locks SET result = $1 WHERE key = $2 AND owner = $3",
            )
            .bind(&payload)
            .bind(key)
            .bind(&self.owner)
            .execute(pool)
            .await
            {
                warn!("failed to store lock result for {}: {}", key, e);
            }
            return outcome.map(|result| LockOutcome {
                result,
                cached: false,
            });
        }

        let deadline = tokio::time::Instant::now() + options.timeout;
        loop {
            tokio::time::sleep(options.retry_interval).await;

            let row: Option<(Option<String>,)> =
                sqlx::query_as("SELECT result FROM distributed_locks WHERE key = $1")
                    .bind(key)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| LockError::Backend(e.into()))?;

            match row {
                Some((Some(payload),)) => {
                    let message: LockMessage = serde_json::from_str(&payload)
                        .map_err(|e| LockError::Backend(e.into()))?;
                    return Self::decode(message);
                }
                // Row gone without a result: the winner expired or died.
                None => return Err(LockError::Timeout),
                Some((None,)) => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Timeout);
            }
        }
    }

    // ============ Local backend ============

    async fn local_flow<T, F, Fut>(
        &self,
        results: &tokio::sync::Mutex<
            std::collections::HashMap<String, (String, tokio::time::Instant)>,
        >,
        key: &str,
        producer: F,
        options: LockOptions,
    ) -> Result<LockOutcome<T>, LockError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // The map lock is held across the producer so concurrent callers
        // of the same key serialize; the first caller's payload replays
        // until the entry's TTL passes.
        let mut guard = results.lock().await;
        let now = tokio::time::Instant::now();
        guard.retain(|_, (_, expires)| *expires > now);
        if let Some((payload, _)) = guard.get(key) {
            let message: LockMessage =
                serde_json::from_str(payload).map_err(|e| LockError::Backend(e.into()))?;
            return Self::decode(message);
        }
        let (outcome, message) = Self::run_producer(producer).await;
        let payload = serde_json::to_string(&message).map_err(|e| LockError::Backend(e.into()))?;
        guard.insert(key.to_string(), (payload, now + options.ttl));
        outcome.map(|result| LockOutcome {
            result,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_local_single_flight() {
        let memoizer = Arc::new(Memoizer::local());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let memoizer = memoizer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                memoizer
                    .with_lock(
                        "k",
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, anyhow::Error>(42u32)
                        },
                        LockOptions::default(),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut uncached = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.result, 42);
            if !outcome.cached {
                uncached += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(uncached, 1);
    }

    #[tokio::test]
    async fn test_local_producer_error_replayed() {
        let memoizer = Memoizer::local();
        let first = memoizer
            .with_lock::<u32, _, _>(
                "k",
                || async { Err(anyhow::anyhow!("boom")) },
                LockOptions::default(),
            )
            .await;
        assert!(matches!(first, Err(LockError::Producer(ref m)) if m == "boom"));

        let second = memoizer
            .with_lock::<u32, _, _>(
                "k",
                || async { Ok(7) },
                LockOptions::default(),
            )
            .await;
        assert!(matches!(second, Err(LockError::Producer(ref m)) if m == "boom"));
    }
}
