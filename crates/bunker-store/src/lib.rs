//! Relational store for the bunker.
//!
//! A single SQLite database holds the `key_users`, `signing_conditions`,
//! `policies`, `policy_rules`, `tokens`, and `requests` tables. All access
//! goes through [`Store`]; mutations rely on SQLite's row-level atomicity,
//! and multi-row writes (token redemption) run in a transaction.
//!
//! Schema is auto-created on open with `CREATE TABLE IF NOT EXISTS`, the same
//! way the storage backends bootstrap themselves.

pub mod acl;
pub mod error;
pub mod ledger;
pub mod policy;
pub mod token;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::StoreError;

/// How long a pending ledger row lives before self-expiring.
pub const DEFAULT_LEDGER_TTL: Duration = Duration::from_secs(60);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS key_users (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    key_name    TEXT NOT NULL,
    user_pubkey TEXT NOT NULL,
    description TEXT,
    revoked_at  INTEGER,
    created_at  INTEGER NOT NULL,
    UNIQUE(key_name, user_pubkey)
);
CREATE TABLE IF NOT EXISTS signing_conditions (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    key_user_id         INTEGER NOT NULL REFERENCES key_users(id),
    method              TEXT NOT NULL,
    scope               TEXT NOT NULL DEFAULT '',
    allowed             INTEGER NOT NULL,
    max_usage_count     INTEGER,
    current_usage_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE(key_user_id, method, scope)
);
CREATE TABLE IF NOT EXISTS policies (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL,
    expires_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS policy_rules (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    policy_id       INTEGER NOT NULL REFERENCES policies(id),
    method          TEXT NOT NULL,
    kind            TEXT,
    max_usage_count INTEGER
);
CREATE TABLE IF NOT EXISTS tokens (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    token                   TEXT NOT NULL UNIQUE,
    key_name                TEXT NOT NULL,
    client_name             TEXT NOT NULL,
    policy_id               INTEGER NOT NULL REFERENCES policies(id),
    created_by              TEXT NOT NULL,
    created_at              INTEGER NOT NULL,
    expires_at              INTEGER,
    redeemed_at             INTEGER,
    redeemed_by_key_user_id INTEGER REFERENCES key_users(id)
);
CREATE TABLE IF NOT EXISTS requests (
    id            TEXT PRIMARY KEY,
    key_name      TEXT,
    request_id    TEXT NOT NULL,
    remote_pubkey TEXT NOT NULL,
    method        TEXT NOT NULL,
    params        TEXT,
    allowed       INTEGER,
    payload       TEXT,
    created_at    INTEGER NOT NULL
);
";

/// Handle to the relational store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    ledger_ttl: Duration,
}

impl Store {
    /// Open (or create) the database file and run the schema migration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] if the file cannot be opened or the
    /// migration fails.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        migrate(&pool).await?;
        Ok(Self {
            pool,
            ledger_ttl: DEFAULT_LEDGER_TTL,
        })
    }

    /// Open an in-memory database (tests and embedding).
    ///
    /// A single pooled connection keeps the in-memory database alive for the
    /// lifetime of the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] if the migration fails.
    pub async fn open_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        migrate(&pool).await?;
        Ok(Self {
            pool,
            ledger_ttl: DEFAULT_LEDGER_TTL,
        })
    }

    /// Override the ledger row lifetime. Tests shrink this to keep expiry
    /// scenarios fast.
    #[must_use]
    pub fn with_ledger_ttl(mut self, ttl: Duration) -> Self {
        self.ledger_ttl = ttl;
        self
    }

    #[must_use]
    pub fn ledger_ttl(&self) -> Duration {
        self.ledger_ttl
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_memory_runs_migration() {
        let store = Store::open_memory().await.unwrap();
        // A second migration pass is a no-op.
        migrate(store.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bunker.db");
        let _store = Store::open(&path).await.unwrap();
        assert!(path.exists());
    }
}
