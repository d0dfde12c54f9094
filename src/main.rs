mod config;
mod db;
mod models;
mod routes;
mod services;

use axum::{
    routing::{get, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::{create_pool, run_migrations, DbCache, PruneConfig};
use crate::services::addon::AddonFetcher;
use crate::services::crypto::Crypto;
use crate::services::debrid::{PlaybackResolver, ResolverOptions};
use crate::services::fetch::FetchClient;
use crate::services::lock::Memoizer;
use crate::services::metadata::MetadataStore;
use crate::services::orchestrator::Orchestrator;
use crate::services::redis::RedisService;
use sqlx::PgPool;

/// Application state shared across handlers
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Option<PgPool>,
    pub redis: Option<RedisService>,
    pub memoizer: Arc<Memoizer>,
    pub metadata: Arc<MetadataStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub resolver: Arc<PlaybackResolver>,
    pub crypto: Option<Crypto>,
    pub start_time: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamhub=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env());
    let port = config.port;

    tracing::info!("Starting streamhub v{}", env!("CARGO_PKG_VERSION"));

    // Optional PostgreSQL pool (transactional backend + persisted state)
    let pool = match &config.database_uri {
        Some(uri) => {
            let pool = create_pool(uri, config.db_max_connections).await?;
            run_migrations(&pool).await?;
            tracing::info!("PostgreSQL connected");
            Some(pool)
        }
        None => None,
    };

    // Optional Redis (broadcast backend)
    let redis = match &config.redis_uri {
        Some(uri) => {
            let redis = RedisService::new(uri).await?;
            tracing::info!("Redis connected");
            Some(redis)
        }
        None => None,
    };

    // Memoizer backend: broadcast when Redis is available, transactional
    // when only PostgreSQL is, in-process otherwise.
    let memoizer = Arc::new(match (&redis, &pool) {
        (Some(redis), _) => Memoizer::broadcast(redis.clone()),
        (None, Some(pool)) => Memoizer::transactional(pool.clone()),
        (None, None) => {
            tracing::warn!("no REDIS_URI or DATABASE_URI set, memoizer is process-local");
            Memoizer::local()
        }
    });

    // Title-metadata store follows the same backend preference.
    let metadata = Arc::new(match (&redis, &pool) {
        (Some(redis), _) => {
            MetadataStore::redis(redis.clone(), config.playback_link_validity_secs)
        }
        (None, Some(pool)) => MetadataStore::db(
            DbCache::new(pool.clone()),
            config.playback_link_validity_secs,
        ),
        (None, None) => MetadataStore::local(config.playback_link_validity_secs),
    });

    // Credential envelope crypto
    let crypto = match &config.internal_secret {
        Some(secret) => match Crypto::new(secret) {
            Ok(crypto) => Some(crypto),
            Err(e) => {
                tracing::warn!("INTERNAL_SECRET unusable, playback links disabled: {}", e);
                None
            }
        },
        None => None,
    };

    // Outbound fetch layer and the pipeline composition root
    let fetch = Arc::new(FetchClient::new(config.clone())?);
    let fetcher = Arc::new(AddonFetcher::new(fetch.clone(), memoizer.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        fetcher,
        metadata.clone(),
        crypto.clone(),
    ));

    // Debrid resolver; concrete service adapters register here.
    let resolver = Arc::new(PlaybackResolver::new(
        Vec::new(),
        memoizer.clone(),
        ResolverOptions {
            per_service_concurrency: config.debrid_parallelism,
            ..Default::default()
        },
    ));

    // Periodic pruning of expired rows and stale users
    if let Some(pool) = &pool {
        let prune_pool = pool.clone();
        let prune_config = PruneConfig {
            interval_secs: config.prune_interval_secs,
            max_days: config.prune_max_days,
        };
        tokio::spawn(db::start_prune_task(prune_pool, prune_config));
        tracing::info!("Prune task started");
    }

    // Build application state
    let state = Arc::new(AppState {
        config: config.clone(),
        pool,
        redis,
        memoizer,
        metadata,
        orchestrator,
        resolver,
        crypto,
        start_time: Instant::now(),
    });

    // Build router
    let app = Router::new()
        .route("/", get(routes::health::root))
        .route("/health", get(routes::health::health_check))
        .route(
            "/u/:uuid/stream/:type/:id",
            get(routes::stream::get_streams),
        )
        .route("/u/:uuid/config", put(routes::stream::save_config))
        .route(
            "/stream/:type/:id",
            get(routes::stream::get_streams_anonymous),
        )
        .route(
            "/playback/:auth/:info/:metadata_id/:filename",
            get(routes::playback::resolve_playback),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
