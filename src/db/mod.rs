//! Database module for Sealed Sync
//!
//! Provides the pooled SQLite store backing the durable offline queue,
//! persisted settings and the local pull cursor.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Locally persisted pull cursor for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSyncMetadata {
    pub user_id: String,
    pub last_sync_version: i64,
    pub last_sync_at: Option<String>,
    pub sync_status: String,
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) a file-backed database
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA foreign_keys = ON;
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = FULL;
                PRAGMA busy_timeout = 5000;
                "#,
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        log::info!("Opened sync database at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (tests, ephemeral sessions)
    ///
    /// Every in-memory SQLite connection is its own database, so the pool is
    /// pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn initialize_schema(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok(())
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // GENERIC HELPERS
    // =========================================================================

    /// Execute a statement and return the number of affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;
        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a JSON-encoded setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    // =========================================================================
    // SYNC METADATA
    // =========================================================================

    /// Get the local pull cursor for a user
    pub fn get_sync_metadata(&self, user_id: &str) -> DbResult<Option<LocalSyncMetadata>> {
        let conn = self.get_conn()?;

        let result = conn.query_row(
            r#"
            SELECT user_id, last_sync_version, last_sync_at, sync_status
            FROM sync_metadata
            WHERE user_id = ?1
            "#,
            params![user_id],
            |row| {
                Ok(LocalSyncMetadata {
                    user_id: row.get(0)?,
                    last_sync_version: row.get(1)?,
                    last_sync_at: row.get(2)?,
                    sync_status: row.get(3)?,
                })
            },
        );

        match result {
            Ok(metadata) => Ok(Some(metadata)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert or update the local pull cursor for a user
    ///
    /// The stored version never moves backwards.
    pub fn upsert_sync_metadata(
        &self,
        user_id: &str,
        last_sync_version: i64,
        sync_status: &str,
    ) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute(
            r#"
            INSERT INTO sync_metadata (user_id, last_sync_version, last_sync_at, sync_status)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id) DO UPDATE SET
                last_sync_version = MAX(last_sync_version, excluded.last_sync_version),
                last_sync_at = excluded.last_sync_at,
                sync_status = excluded.sync_status
            "#,
            params![
                user_id,
                last_sync_version,
                chrono::Utc::now().to_rfc3339(),
                sync_status
            ],
        )?;

        Ok(())
    }
}
