//! belfry server binary.
//!
//! Runs the timer scheduling engine together with the management API.
//! Configuration comes from the environment:
//!
//! - `BELFRY_API_ADDR`     - API bind address (default `127.0.0.1:8080`)
//! - `REDIS_URL`           - Redis URL for scheduling state
//! - `DATABASE_URL`        - SQLite URL for definitions and run history
//! - `BELFRY_NAMESPACE`    - table namespace (default `belfry`)
//! - `BELFRY_SHARD_COUNT`  - number of bucket shards per minute
//! - `RUST_LOG`            - log filter (default `info`)

use std::sync::Arc;

use belfry_core::{InMemoryBus, TimerEngine};
use belfry_redis::RedisStore;
use belfry_server::{Server, ServerConfig};
use belfry_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> belfry_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::from_env()?;

    tracing::info!(
        redis = %config.redis_url,
        database = %config.database_url,
        namespace = %config.namespace,
        "Starting belfry server"
    );

    let redis = Arc::new(RedisStore::new(&config.redis_url, config.engine.shard_count).await?);
    let sqlite = Arc::new(SqliteStore::new(&config.database_url, &config.namespace).await?);

    // Single-process deployment: stages communicate over an in-process bus.
    let bus = Arc::new(InMemoryBus::new());

    let engine = TimerEngine::builder()
        .config(config.engine.clone())
        .slice_store(redis.clone())
        .bucket_store(redis)
        .definition_store(sqlite.clone())
        .history_store(sqlite)
        .bus(bus)
        .build()?;

    let server = Server::new(config, Arc::new(engine));
    server.run().await
}
