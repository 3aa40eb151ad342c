//! SQLite storage for timer definitions and run history.
//!
//! Definitions and history rows are stored as JSON documents alongside the
//! columns the queries filter on. Scheduling state (slices, buckets) does
//! not live here; pair this store with `belfry-redis` or the in-memory
//! store for those.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use belfry_sqlite::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> belfry_core::Result<()> {
//!     let store = SqliteStore::new("sqlite:belfry.db", "myapp").await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use belfry_core::{
    BelfryError, DefinitionStore, HistoryStore, Result, RunHistory, TimerDefinition, TimerStatus,
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// SQLite-backed definition and history store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteStore {
    /// Create a new SQLite store.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite`
    /// or `sqlite::memory:`
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite works best with single connection for writes
            .connect(database_url)
            .await
            .map_err(|e| BelfryError::Backend(format!("Failed to connect to SQLite: {}", e)))?;

        let store = Self {
            pool,
            namespace: namespace.to_string(),
        };
        store.init_tables().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (useful for testing).
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        Self::new("sqlite::memory:", namespace).await
    }

    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                def_id TEXT PRIMARY KEY,
                app TEXT NOT NULL,
                name TEXT NOT NULL,
                status INTEGER NOT NULL,
                def_json TEXT NOT NULL,
                created_at TEXT DEFAULT (datetime('now')),
                UNIQUE (app, name)
            )
            "#,
            self.timers_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to create timers table: {}", e)))?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                def_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                row_json TEXT NOT NULL
            )
            "#,
            self.history_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to create history table: {}", e)))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_history_created ON {} (created_at)",
            self.namespace,
            self.history_table()
        ))
        .execute(&self.pool)
        .await
        .ok();

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_history_def ON {} (def_id)",
            self.namespace,
            self.history_table()
        ))
        .execute(&self.pool)
        .await
        .ok();

        Ok(())
    }

    fn timers_table(&self) -> String {
        format!("{}_timers", self.namespace)
    }

    fn history_table(&self) -> String {
        format!("{}_run_history", self.namespace)
    }
}

#[async_trait]
impl DefinitionStore for SqliteStore {
    async fn create(&self, def: &TimerDefinition) -> Result<()> {
        let def_json = serde_json::to_string(def)?;
        sqlx::query(&format!(
            "INSERT INTO {} (def_id, app, name, status, def_json) VALUES (?, ?, ?, ?, ?)",
            self.timers_table()
        ))
        .bind(&def.def_id)
        .bind(&def.app)
        .bind(&def.name)
        .bind(def.status.as_i64())
        .bind(def_json)
        .execute(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to create timer: {}", e)))?;
        Ok(())
    }

    async fn get(&self, def_id: &str) -> Result<Option<TimerDefinition>> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT def_json FROM {} WHERE def_id = ?",
            self.timers_table()
        ))
        .bind(def_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to get timer: {}", e)))?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, def_id: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE def_id = ?",
            self.timers_table()
        ))
        .bind(def_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to delete timer: {}", e)))?;
        Ok(())
    }

    async fn update_status(&self, def_id: &str, status: TimerStatus) -> Result<()> {
        // The JSON document carries the status too, so rewrite both.
        let mut def = DefinitionStore::get(self, def_id)
            .await?
            .ok_or_else(|| BelfryError::TimerNotFound(def_id.to_string()))?;
        def.status = status;
        let def_json = serde_json::to_string(&def)?;

        sqlx::query(&format!(
            "UPDATE {} SET status = ?, def_json = ? WHERE def_id = ?",
            self.timers_table()
        ))
        .bind(status.as_i64())
        .bind(def_json)
        .bind(def_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to update status: {}", e)))?;
        Ok(())
    }

    async fn get_by_app_and_name(
        &self,
        app: &str,
        name: &str,
    ) -> Result<Option<TimerDefinition>> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT def_json FROM {} WHERE app = ? AND name = ?",
            self.timers_table()
        ))
        .bind(app)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to get timer: {}", e)))?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn page_query(&self, app: &str, offset: u64, limit: u64) -> Result<Vec<TimerDefinition>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT def_json FROM {} WHERE (? = '' OR app = ?) ORDER BY name LIMIT ? OFFSET ?",
            self.timers_table()
        ))
        .bind(app)
        .bind(app)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to page timers: {}", e)))?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(BelfryError::from))
            .collect()
    }

    async fn count(&self, app: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE (? = '' OR app = ?)",
            self.timers_table()
        ))
        .bind(app)
        .bind(app)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to count timers: {}", e)))?;
        Ok(row.0 as u64)
    }

    async fn count_by_status(&self, status: TimerStatus) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE status = ?",
            self.timers_table()
        ))
        .bind(status.as_i64())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to count by status: {}", e)))?;
        Ok(row.0 as u64)
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn create(&self, row: &RunHistory) -> Result<()> {
        let row_json = serde_json::to_string(row)?;
        sqlx::query(&format!(
            "INSERT INTO {} (id, def_id, created_at, row_json) VALUES (?, ?, ?, ?)",
            self.history_table()
        ))
        .bind(&row.id)
        .bind(&row.def_id)
        .bind(row.created_at)
        .bind(row_json)
        .execute(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to create history row: {}", e)))?;
        Ok(())
    }

    async fn update(&self, row: &RunHistory) -> Result<()> {
        let row_json = serde_json::to_string(row)?;
        sqlx::query(&format!(
            "UPDATE {} SET created_at = ?, row_json = ? WHERE id = ?",
            self.history_table()
        ))
        .bind(row.created_at)
        .bind(row_json)
        .bind(&row.id)
        .execute(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to update history row: {}", e)))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ?",
            self.history_table()
        ))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to delete history row: {}", e)))?;
        Ok(())
    }

    async fn page_query(&self, def_id: &str, offset: u64, limit: u64) -> Result<Vec<RunHistory>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT row_json FROM {} WHERE (? = '' OR def_id = ?) ORDER BY created_at DESC LIMIT ? OFFSET ?",
            self.history_table()
        ))
        .bind(def_id)
        .bind(def_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to page history: {}", e)))?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(BelfryError::from))
            .collect()
    }

    async fn count(&self, def_id: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE (? = '' OR def_id = ?)",
            self.history_table()
        ))
        .bind(def_id)
        .bind(def_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to count history: {}", e)))?;
        Ok(row.0 as u64)
    }

    async fn delete_older_than(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE created_at < ?",
            self.history_table()
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| BelfryError::Backend(format!("Failed to purge history: {}", e)))?;
        Ok(result.rows_affected())
    }
}
