//! The vault transaction: one relational transaction plus tracked file
//! writes plus graph cache invalidation.
//!
//! Contract:
//! - on commit, the relational transaction flushes and the graph cache is
//!   invalidated;
//! - on rollback, the relational transaction aborts, tracked file creations
//!   are deleted, tracked modifications are restored from pre-images, and
//!   the graph cache is invalidated unconditionally;
//! - file rollback is best-effort per file so it never masks the primary
//!   error.
//!
//! Callers must not observe the in-memory graph inside the scope; it is
//! only consistent after commit.

use std::fs;
use std::path::{Path, PathBuf};

use sqlx::{Sqlite, SqliteConnection, Transaction};
use tracing::{debug, warn};

use ztlctl_graph::GraphEngine;
use ztlctl_store::{StoreError, VaultPaths};

use crate::{EngineError, Vault};

/// Pre-image of one touched file; `None` means the file did not exist.
struct TrackedFile {
    abs: PathBuf,
    pre_image: Option<Vec<u8>>,
}

/// A scoped unit of work over the index and the vault files.
pub struct VaultTxn {
    txn: Transaction<'static, Sqlite>,
    paths: VaultPaths,
    graph: GraphEngine,
    tracked: Vec<TrackedFile>,
}

impl VaultTxn {
    /// Begin a transaction against `vault`.
    pub async fn begin(vault: &Vault) -> Result<Self, EngineError> {
        let txn = vault.store().pool().begin().await.map_err(StoreError::from)?;
        Ok(Self {
            txn,
            paths: vault.store().paths().clone(),
            graph: vault.graph().clone(),
            tracked: Vec::new(),
        })
    }

    /// The relational connection; all index writes go through it.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.txn
    }

    /// The vault path layout.
    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    /// Read a vault file within the scope.
    pub fn read_file(&self, rel: &Path) -> Result<String, EngineError> {
        Ok(self.paths.read_to_string(rel)?)
    }

    /// Write a vault file, capturing a pre-image on first touch.
    pub fn write_file(&mut self, rel: &Path, content: &str) -> Result<(), EngineError> {
        let abs = self.paths.resolve(rel)?;
        if !self.tracked.iter().any(|t| t.abs == abs) {
            let pre_image = fs::read(&abs).ok();
            self.tracked.push(TrackedFile { abs: abs.clone(), pre_image });
        }
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        fs::write(&abs, content).map_err(|source| StoreError::Io {
            path: abs.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Whether a vault file exists.
    pub fn file_exists(&self, rel: &Path) -> bool {
        self.paths.exists(rel)
    }

    /// Commit the relational transaction and invalidate the graph cache.
    pub async fn commit(self) -> Result<(), EngineError> {
        let result = self.txn.commit().await.map_err(StoreError::from);
        self.graph.invalidate();
        result?;
        debug!(files = self.tracked.len(), "vault transaction committed");
        Ok(())
    }

    /// Roll back: relational abort, then file restoration, newest first.
    ///
    /// Never returns an error; each restoration failure is logged so the
    /// caller's primary error stays visible.
    pub async fn rollback(self) {
        if let Err(e) = self.txn.rollback().await {
            warn!(error = %e, "relational rollback failed");
        }
        for tracked in self.tracked.iter().rev() {
            let outcome = match &tracked.pre_image {
                Some(bytes) => fs::write(&tracked.abs, bytes),
                None => fs::remove_file(&tracked.abs),
            };
            if let Err(e) = outcome {
                warn!(path = %tracked.abs.display(), error = %e, "file rollback failed");
            }
        }
        self.graph.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vault;

    async fn vault() -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().unwrap();
        let result = Vault::init(dir.path()).await;
        assert!(result.ok, "{:?}", result.error);
        let vault = Vault::open(dir.path()).await.unwrap();
        (dir, vault)
    }

    #[tokio::test]
    async fn test_rollback_deletes_created_files() {
        let (_dir, vault) = vault().await;
        let rel = Path::new("notes/ml/ztl_00000001-x.md");
        let mut txn = VaultTxn::begin(&vault).await.unwrap();
        txn.write_file(rel, "created").unwrap();
        assert!(vault.store().paths().exists(rel));
        txn.rollback().await;
        assert!(!vault.store().paths().exists(rel));
    }

    #[tokio::test]
    async fn test_rollback_restores_pre_images() {
        let (_dir, vault) = vault().await;
        let rel = Path::new("notes/ml/ztl_00000001-x.md");
        {
            let mut txn = VaultTxn::begin(&vault).await.unwrap();
            txn.write_file(rel, "original").unwrap();
            txn.commit().await.unwrap();
        }
        let mut txn = VaultTxn::begin(&vault).await.unwrap();
        txn.write_file(rel, "changed once").unwrap();
        txn.write_file(rel, "changed twice").unwrap();
        txn.rollback().await;
        assert_eq!(vault.store().paths().read_to_string(rel).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_commit_keeps_files_and_rows() {
        let (_dir, vault) = vault().await;
        let rel = Path::new("ops/logs/LOG-0001-test.md");
        let mut txn = VaultTxn::begin(&vault).await.unwrap();
        txn.write_file(rel, "kept").unwrap();
        sqlx::query("INSERT INTO counters (prefix, next) VALUES ('LOG', 2)")
            .execute(txn.conn())
            .await
            .unwrap();
        txn.commit().await.unwrap();
        assert_eq!(vault.store().paths().read_to_string(rel).unwrap(), "kept");
        let mut conn = vault.store().pool().acquire().await.unwrap();
        let n = ztlctl_store::queries::next_counter(&mut conn, "LOG").await.unwrap();
        assert_eq!(n, 2);
    }
}
