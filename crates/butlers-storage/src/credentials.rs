//! Named secret resolution: database first, process env as fallback.
//!
//! Secrets live in `shared.butler_secrets` (schema configurable via
//! `CREDENTIAL_STORE_SCHEMA`). A butler-scoped row wins over a fleet-wide
//! row (`butler_name = '*'`), which wins over the process environment.

use sqlx::PgPool;
use std::collections::HashMap;
use tracing::debug;

use crate::error::StorageResult;

/// A secret value whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The underlying value. Keep the exposure site small.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Resolves named secrets DB-first with env fallback.
pub struct CredentialStore {
    pool: Option<PgPool>,
    schema: String,
    overrides: HashMap<(String, String), Secret>,
    env_fallback: bool,
}

impl CredentialStore {
    /// A store backed by the shared secrets table.
    #[must_use]
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool: Some(pool),
            schema: schema.into(),
            overrides: HashMap::new(),
            env_fallback: true,
        }
    }

    /// A store with no database; env only. Used by tests and `mem:` mode.
    #[must_use]
    pub fn env_only() -> Self {
        Self {
            pool: None,
            schema: String::new(),
            overrides: HashMap::new(),
            env_fallback: true,
        }
    }

    /// Seed a static secret (tests; also `mem:` mode rosters).
    #[must_use]
    pub fn with_override(
        mut self,
        butler: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.overrides
            .insert((butler.into(), name.into()), Secret::new(value));
        self
    }

    /// Disable the env fallback (tests that assert DB-only behavior).
    #[must_use]
    pub const fn without_env_fallback(mut self) -> Self {
        self.env_fallback = false;
        self
    }

    /// Resolve a secret for one butler.
    ///
    /// Lookup order: static override (butler, then `*`), database row
    /// (butler, then `*`), process env.
    ///
    /// # Errors
    ///
    /// Returns a query error only when the database lookup itself fails;
    /// a missing secret is `Ok(None)`.
    pub async fn resolve(&self, butler: &str, name: &str) -> StorageResult<Option<Secret>> {
        for scope in [butler, "*"] {
            if let Some(secret) = self.overrides.get(&(scope.to_string(), name.to_string())) {
                return Ok(Some(secret.clone()));
            }
        }

        if let Some(pool) = &self.pool {
            let query = format!(
                "SELECT value FROM {}.butler_secrets
                 WHERE name = $1 AND butler_name IN ($2, '*')
                 ORDER BY (butler_name = $2) DESC
                 LIMIT 1",
                self.schema
            );
            let row: Option<(String,)> = sqlx::query_as(&query)
                .bind(name)
                .bind(butler)
                .fetch_optional(pool)
                .await?;
            if let Some((value,)) = row {
                debug!(butler, name, "secret resolved from database");
                return Ok(Some(Secret::new(value)));
            }
        }

        if self.env_fallback
            && let Ok(value) = std::env::var(name)
        {
            debug!(butler, name, "secret resolved from environment");
            return Ok(Some(Secret::new(value)));
        }

        Ok(None)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("schema", &self.schema)
            .field("overrides", &self.overrides.len())
            .field("env_fallback", &self.env_fallback)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("sk-super-sensitive");
        assert_eq!(format!("{secret:?}"), "Secret(****)");
        assert_eq!(secret.expose(), "sk-super-sensitive");
    }

    #[tokio::test]
    async fn test_override_beats_env() {
        let store = CredentialStore::env_only().with_override("health", "API_KEY_X9", "from-db");
        let secret = store.resolve("health", "API_KEY_X9").await.unwrap().unwrap();
        assert_eq!(secret.expose(), "from-db");
    }

    #[tokio::test]
    async fn test_wildcard_scope() {
        let store = CredentialStore::env_only().with_override("*", "SHARED_KEY_X9", "fleet-wide");
        let secret = store.resolve("health", "SHARED_KEY_X9").await.unwrap().unwrap();
        assert_eq!(secret.expose(), "fleet-wide");
    }

    #[tokio::test]
    async fn test_missing_secret_is_none() {
        let store = CredentialStore::env_only().without_env_fallback();
        assert!(store.resolve("health", "NO_SUCH_SECRET_X9").await.unwrap().is_none());
    }
}
