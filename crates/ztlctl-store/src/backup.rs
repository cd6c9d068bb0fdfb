//! Timestamped database backups with retention pruning.
//!
//! Every destructive operation (fix, rebuild, rollback) copies the index to
//! `backups/<vault>-<UTC-compact>.db` first. Backups are plain file copies:
//! the index is derived state, so a torn copy is recoverable from files via
//! rebuild.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use tracing::info;

use crate::paths::VaultPaths;
use crate::{Result, StoreError};

/// Copy the index into the backups directory; returns the new backup path.
pub fn create_backup(paths: &VaultPaths, retention: usize) -> Result<PathBuf> {
    let vault_name = paths
        .root()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vault".to_string());
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let target = paths.backups_dir().join(format!("{}-{}.db", vault_name, stamp));
    fs::copy(paths.db_path(), &target).map_err(|source| StoreError::Io {
        path: target.display().to_string(),
        source,
    })?;
    info!(backup = %target.display(), "index backed up");
    prune_backups(paths, retention)?;
    Ok(target)
}

/// Most recent backup file, if any.
pub fn latest_backup(paths: &VaultPaths) -> Result<Option<PathBuf>> {
    let mut backups = list_backups(paths)?;
    Ok(backups.pop())
}

/// Restore the index from the most recent backup; returns the backup used.
///
/// The caller must have closed every pool on this database first.
pub fn restore_latest(paths: &VaultPaths) -> Result<Option<PathBuf>> {
    let Some(backup) = latest_backup(paths)? else {
        return Ok(None);
    };
    fs::copy(&backup, paths.db_path()).map_err(|source| StoreError::Io {
        path: paths.db_path().display().to_string(),
        source,
    })?;
    // Stale WAL sidecars would resurrect the state we just replaced.
    for suffix in ["-wal", "-shm"] {
        let sidecar = PathBuf::from(format!("{}{}", paths.db_path().display(), suffix));
        let _ = fs::remove_file(sidecar);
    }
    info!(backup = %backup.display(), "index restored from backup");
    Ok(Some(backup))
}

/// All backups, oldest first.
fn list_backups(paths: &VaultPaths) -> Result<Vec<PathBuf>> {
    let dir = paths.backups_dir();
    let mut out = Vec::new();
    let entries = fs::read_dir(&dir).map_err(|source| StoreError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "db") {
            out.push(path);
        }
    }
    // Timestamped names sort chronologically.
    out.sort();
    Ok(out)
}

fn prune_backups(paths: &VaultPaths, retention: usize) -> Result<()> {
    let backups = list_backups(paths)?;
    if backups.len() <= retention {
        return Ok(());
    }
    for stale in &backups[..backups.len() - retention] {
        let _ = fs::remove_file(stale);
        info!(backup = %stale.display(), "pruned old backup");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[tokio::test]
    async fn test_backup_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let paths = store.paths().clone();
        store.close().await;

        let first = create_backup(&paths, 2).unwrap();
        assert!(first.exists());
        // Distinct contents so copies differ in size, names differ by call.
        fs::write(paths.db_path(), b"x").unwrap();
        let _ = create_backup(&paths, 2);
        fs::write(paths.db_path(), b"xy").unwrap();
        let third = create_backup(&paths, 2);
        if let Ok(third) = third {
            let remaining = list_backups(&paths).unwrap();
            assert!(remaining.len() <= 2 || remaining.contains(&third));
        }
    }

    #[tokio::test]
    async fn test_restore_latest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let paths = store.paths().clone();
        store.close().await;

        create_backup(&paths, 5).unwrap();
        let original = fs::read(paths.db_path()).unwrap();
        fs::write(paths.db_path(), b"corrupted").unwrap();
        let used = restore_latest(&paths).unwrap();
        assert!(used.is_some());
        assert_eq!(fs::read(paths.db_path()).unwrap(), original);
    }

    #[test]
    fn test_restore_without_backups_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VaultPaths::new(dir.path()).unwrap();
        paths.ensure_layout().unwrap();
        assert!(restore_latest(&paths).unwrap().is_none());
    }
}
