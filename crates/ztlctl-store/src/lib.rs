#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ztlctl-store** – Storage layer for the ztlctl vault engine.
//!
//! This crate owns the two durable representations of a vault: the markdown
//! files on disk (authoritative) and the derived SQLite index. It provides
//! the connection pool, a versioned migration engine, row models and query
//! helpers for every table, FTS5 synchronization, the vault path layout with
//! traversal guards, and timestamped database backups.
//!
//! Query helpers take `&mut SqliteConnection` so callers decide the
//! transaction scope; the engine's vault transaction wraps them together
//! with tracked file writes.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

pub mod backup;
pub mod fts;
pub mod paths;
pub mod queries;
pub mod rows;
pub mod schema;

pub use paths::VaultPaths;
pub use rows::{EdgeRow, EventRow, NodeRow, ReweaveEntryRow, SessionEntryRow};

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database failure.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A path escaped the vault root.
    #[error("path '{0}' escapes the vault root")]
    PathEscape(String),

    /// Schema migration failed.
    #[error("migration '{name}' failed: {reason}")]
    Migration {
        /// Migration name.
        name: String,
        /// Failure description.
        reason: String,
    },

    /// Stored data failed to decode.
    #[error("corrupt row in {table}: {reason}")]
    Decode {
        /// Table holding the bad row.
        table: &'static str,
        /// Failure description.
        reason: String,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to one vault's SQLite index and file layout.
///
/// The pool runs the database in WAL journal mode, permitting concurrent
/// readers while this (single-writer) process holds write transactions.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    paths: VaultPaths,
}

impl Store {
    /// Open (or create) the index for the vault rooted at `root`.
    ///
    /// Runs pending schema migrations before returning, mirroring each
    /// applied migration into `.ztlctl/migrations/` for inspection.
    pub async fn open(root: &Path) -> Result<Self> {
        let paths = VaultPaths::new(root)?;
        paths.ensure_layout()?;

        let options = SqliteConnectOptions::new()
            .filename(paths.db_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool, paths };
        schema::migrate(&store).await?;
        debug!(db = %store.paths.db_path().display(), "store opened");
        Ok(store)
    }

    /// The connection pool for this vault's index.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The vault path layout.
    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    /// Fold the WAL sidecar into the main database file.
    ///
    /// Backups copy the database file alone, so the WAL must be checkpointed
    /// first or recent commits would be missing from the copy.
    pub async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close the pool, waiting for connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
