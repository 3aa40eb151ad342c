//! Server configuration.

use std::net::SocketAddr;

use belfry_core::EngineConfig;

/// Configuration for the belfry server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the API server to.
    pub api_addr: SocketAddr,
    /// Redis connection URL for scheduling state.
    pub redis_url: String,
    /// SQLite database URL for definitions and run history.
    pub database_url: String,
    /// Namespace prefix for tables.
    pub namespace: String,
    /// Scheduling engine configuration.
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_addr: "127.0.0.1:8080".parse().unwrap(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: "sqlite:belfry.db".to_string(),
            namespace: "belfry".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Build a configuration from environment variables, falling back to
    /// defaults: `BELFRY_API_ADDR`, `REDIS_URL`, `DATABASE_URL`,
    /// `BELFRY_NAMESPACE`, `BELFRY_SHARD_COUNT`.
    pub fn from_env() -> belfry_core::Result<Self> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("BELFRY_API_ADDR") {
            config.api_addr = addr.parse().map_err(|e| {
                belfry_core::BelfryError::Config(format!("invalid BELFRY_API_ADDR: {}", e))
            })?;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(ns) = std::env::var("BELFRY_NAMESPACE") {
            config.namespace = ns;
        }
        if let Ok(shards) = std::env::var("BELFRY_SHARD_COUNT") {
            let count: u32 = shards.parse().map_err(|e| {
                belfry_core::BelfryError::Config(format!("invalid BELFRY_SHARD_COUNT: {}", e))
            })?;
            config.engine.shard_count = count;
        }
        config.engine.validate()?;
        Ok(config)
    }
}

/// Builder for ServerConfig.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API bind address.
    pub fn api_addr(mut self, addr: SocketAddr) -> Self {
        self.config.api_addr = addr;
        self
    }

    /// Set the API bind address from a string.
    pub fn api_addr_str(mut self, addr: &str) -> Result<Self, std::net::AddrParseError> {
        self.config.api_addr = addr.parse()?;
        Ok(self)
    }

    /// Set the Redis URL.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis_url = url.into();
        self
    }

    /// Set the database URL.
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the engine configuration.
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    /// Build the ServerConfig.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
