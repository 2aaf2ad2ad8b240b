//! Postgres pool per butler.
//!
//! Each butler owns one pool whose connections are scoped with
//! `search_path = <butler_schema>, shared, public` and a statement timeout.
//! Unqualified table names in per-butler queries therefore land in the
//! butler's own schema; shared tables are referenced as `shared.<table>`.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use tracing::info;

use butlers_config::DbSettings;

use crate::error::{StorageError, StorageResult};

/// A schema-scoped Postgres pool.
pub struct Database {
    pool: PgPool,
    schema: String,
}

impl Database {
    /// Connect a pool for one butler schema.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Connection`] when the URL is malformed or
    /// the server is unreachable.
    pub async fn connect(settings: &DbSettings, schema: &str) -> StorageResult<Self> {
        let search_path = format!("{schema},shared,public");
        let statement_timeout = format!("{}s", settings.statement_timeout_s);
        let options = PgConnectOptions::from_str(&settings.url)
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .options([
                ("search_path", search_path.as_str()),
                ("statement_timeout", statement_timeout.as_str()),
            ]);

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!(schema, "database pool opened");
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The butler schema this pool is scoped to.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Connectivity probe.
    ///
    /// # Errors
    ///
    /// Returns the underlying query error when the pool is unhealthy.
    pub async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}
