//! Title-metadata store
//!
//! Playback URLs carry only a short `metadataId`; the titles, year and
//! episode numbers behind it live here for the lifetime of the link.
//! Writes are once per id (the id is content-addressed), reads are
//! consistent with writes.

use anyhow::Result;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::db::DbCache;
use crate::models::TitleMetadata;
use crate::services::redis::RedisService;

enum Backend {
    Redis(RedisService),
    Db(DbCache),
    Local(Mutex<HashMap<String, (TitleMetadata, Instant)>>),
}

pub struct MetadataStore {
    backend: Backend,
    ttl_seconds: u64,
}

impl MetadataStore {
    pub fn redis(redis: RedisService, ttl_seconds: u64) -> Self {
        Self {
            backend: Backend::Redis(redis),
            ttl_seconds,
        }
    }

    pub fn db(cache: DbCache, ttl_seconds: u64) -> Self {
        Self {
            backend: Backend::Db(cache),
            ttl_seconds,
        }
    }

    pub fn local(ttl_seconds: u64) -> Self {
        Self {
            backend: Backend::Local(Mutex::new(HashMap::new())),
            ttl_seconds,
        }
    }

    fn key(id: &str) -> String {
        format!("meta:{}", id)
    }

    /// Store the metadata and return its content-addressed id.
    pub async fn put(&self, metadata: &TitleMetadata) -> Result<String> {
        let id = metadata.id();
        match &self.backend {
            Backend::Redis(redis) => {
                redis.set_ex(&Self::key(&id), metadata, self.ttl_seconds).await?
            }
            Backend::Db(cache) => cache.set(&Self::key(&id), metadata, self.ttl_seconds).await?,
            Backend::Local(map) => {
                let mut guard = map.lock().await;
                let expires = Instant::now() + Duration::from_secs(self.ttl_seconds);
                guard.insert(id.clone(), (metadata.clone(), expires));
            }
        }
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<TitleMetadata>> {
        match &self.backend {
            Backend::Redis(redis) => redis.get(&Self::key(id)).await,
            Backend::Db(cache) => cache.get(&Self::key(id)).await,
            Backend::Local(map) => {
                let mut guard = map.lock().await;
                let now = Instant::now();
                guard.retain(|_, (_, expires)| *expires > now);
                Ok(guard.get(id).map(|(metadata, _)| metadata.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_round_trip() {
        let store = MetadataStore::local(60);
        let metadata = TitleMetadata {
            titles: vec!["The Expanse".into()],
            year: None,
            season: Some(3),
            episode: Some(5),
            absolute_episode: None,
        };
        let id = store.put(&metadata).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.titles, metadata.titles);
        assert_eq!(loaded.episode, Some(5));
        assert!(store.get("unknown").await.unwrap().is_none());
    }
}
