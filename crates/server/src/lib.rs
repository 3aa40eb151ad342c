//! # belfry-server - HTTP API and Engine Server
//!
//! This crate provides a combined server that runs both the timer
//! scheduling engine and an HTTP API for management.
//!
//! ## Features
//!
//! - **Timer Engine**: Runs the polling/dispatch/notify pipeline
//! - **HTTP API**: Provides endpoints for:
//!   - Health check (`GET /health`)
//!   - Engine statistics (`GET /api/stats`)
//!   - Create timers (`POST /api/timers`)
//!   - List timers (`GET /api/timers`)
//!   - Get/delete a timer (`GET`/`DELETE /api/timers/:id`)
//!   - Enable/disable a timer (`POST /api/timers/:id/enable`, `/disable`)
//!   - Manual trigger (`POST /api/timers/:id/trigger`)
//!   - Run history (`GET /api/timers/:id/history`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use belfry_core::{InMemoryBus, TimerEngine};
//! use belfry_redis::RedisStore;
//! use belfry_server::{Server, ServerConfig};
//! use belfry_sqlite::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> belfry_core::Result<()> {
//!     let config = ServerConfig::from_env()?;
//!
//!     let redis = Arc::new(RedisStore::new(&config.redis_url, config.engine.shard_count).await?);
//!     let sqlite = Arc::new(SqliteStore::new(&config.database_url, &config.namespace).await?);
//!
//!     let engine = TimerEngine::builder()
//!         .config(config.engine.clone())
//!         .slice_store(redis.clone())
//!         .bucket_store(redis)
//!         .definition_store(sqlite.clone())
//!         .history_store(sqlite)
//!         .bus(Arc::new(InMemoryBus::new()))
//!         .build()?;
//!
//!     let server = Server::new(config, Arc::new(engine));
//!     server.run().await
//! }
//! ```

mod api;
mod config;
mod server;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use server::{Server, ServerBuilder};
