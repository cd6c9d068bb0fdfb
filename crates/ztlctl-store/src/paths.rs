//! Vault directory layout and path resolution guards.
//!
//! Layout (bit-exact contract with the CLI and third-party tooling):
//!
//! ```text
//! <vault_root>/
//!   ztlctl.toml
//!   .ztlctl/{ztlctl.db, migrations/, backups/, plugins/}
//!   self/{identity,methodology}.md
//!   notes/<topic>/...
//!   ops/{logs,tasks}/...
//! ```
//!
//! Every resolution refuses targets that are not descendants of the vault
//! root: absolute inputs and `..` components are rejected before any
//! filesystem access happens.

use std::fs;
use std::path::{Component, Path, PathBuf};

use ztlctl_types::ContentKind;

use crate::{Result, StoreError};

/// Control directory under the vault root.
pub const CONTROL_DIR: &str = ".ztlctl";

/// Path layout for one vault.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    root: PathBuf,
}

impl VaultPaths {
    /// Build the layout for `root`, which must exist.
    pub fn new(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|source| StoreError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    /// The vault root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `.ztlctl/` control directory.
    pub fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR)
    }

    /// The SQLite index file.
    pub fn db_path(&self) -> PathBuf {
        self.control_dir().join("ztlctl.db")
    }

    /// Directory mirroring applied schema migrations.
    pub fn migrations_dir(&self) -> PathBuf {
        self.control_dir().join("migrations")
    }

    /// Directory holding timestamped database backups.
    pub fn backups_dir(&self) -> PathBuf {
        self.control_dir().join("backups")
    }

    /// Directory for local plugin scripts.
    pub fn plugins_dir(&self) -> PathBuf {
        self.control_dir().join("plugins")
    }

    /// Directory for a content kind, with `topic` applied for `notes/`.
    pub fn space_dir(&self, kind: ContentKind, topic: Option<&str>) -> PathBuf {
        let mut dir = self.root.join(kind.space());
        if let (ContentKind::Note | ContentKind::Reference, Some(topic)) = (kind, topic) {
            dir.push(topic);
        }
        dir
    }

    /// Vault-relative path for a new content file.
    pub fn content_rel_path(&self, kind: ContentKind, topic: Option<&str>, id: &str, title: &str) -> PathBuf {
        let mut rel = PathBuf::from(kind.space());
        if let (ContentKind::Note | ContentKind::Reference, Some(topic)) = (kind, topic) {
            rel.push(topic);
        }
        rel.push(format!("{}-{}.md", id, slugify(title)));
        rel
    }

    /// Resolve a vault-relative path to an absolute one.
    ///
    /// Rejects absolute inputs and any `..` component so no caller can reach
    /// outside the vault, then verifies the joined result still sits under
    /// the root (symlinked roots are canonicalized at construction).
    pub fn resolve(&self, rel: &Path) -> Result<PathBuf> {
        if rel.is_absolute() {
            return Err(StoreError::PathEscape(rel.display().to_string()));
        }
        for component in rel.components() {
            match component {
                Component::ParentDir => {
                    return Err(StoreError::PathEscape(rel.display().to_string()))
                }
                Component::Prefix(_) | Component::RootDir => {
                    return Err(StoreError::PathEscape(rel.display().to_string()))
                }
                _ => {}
            }
        }
        let joined = self.root.join(rel);
        if !joined.starts_with(&self.root) {
            return Err(StoreError::PathEscape(rel.display().to_string()));
        }
        Ok(joined)
    }

    /// Create every directory of the canonical layout that is missing.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.control_dir(),
            self.migrations_dir(),
            self.backups_dir(),
            self.plugins_dir(),
            self.root.join("self"),
            self.root.join("notes"),
            self.root.join("ops/logs"),
            self.root.join("ops/tasks"),
        ] {
            fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Read a vault file to a string through the traversal guard.
    pub fn read_to_string(&self, rel: &Path) -> Result<String> {
        let abs = self.resolve(rel)?;
        fs::read_to_string(&abs).map_err(|source| StoreError::Io {
            path: abs.display().to_string(),
            source,
        })
    }

    /// Whether a vault-relative file exists.
    pub fn exists(&self, rel: &Path) -> bool {
        self.resolve(rel).map(|p| p.exists()).unwrap_or(false)
    }
}

/// Filesystem-safe slug for a title: lowercase alphanumeric runs joined by
/// single dashes, capped so paths stay shell-friendly.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(48);
    if slug.is_empty() {
        slug.push_str("untitled");
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> (tempfile::TempDir, VaultPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = VaultPaths::new(dir.path()).unwrap();
        paths.ensure_layout().unwrap();
        (dir, paths)
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let (_dir, paths) = vault();
        assert!(paths.resolve(Path::new("../outside.md")).is_err());
        assert!(paths.resolve(Path::new("notes/../../outside.md")).is_err());
        assert!(paths.resolve(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_resolve_accepts_descendants() {
        let (_dir, paths) = vault();
        let p = paths.resolve(Path::new("notes/ml/ztl_ab12cd34-attention.md")).unwrap();
        assert!(p.starts_with(paths.root()));
    }

    #[test]
    fn test_content_rel_path_per_space() {
        let (_dir, paths) = vault();
        let note = paths.content_rel_path(ContentKind::Note, Some("ml"), "ztl_ab12cd34", "Attention!");
        assert_eq!(note, PathBuf::from("notes/ml/ztl_ab12cd34-attention.md"));
        let task = paths.content_rel_path(ContentKind::Task, None, "TASK-0001", "Fix the index");
        assert_eq!(task, PathBuf::from("ops/tasks/TASK-0001-fix-the-index.md"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Transformer Architectures"), "transformer-architectures");
        assert_eq!(slugify("Café — Notes!"), "caf-notes");
        assert_eq!(slugify("???"), "untitled");
    }

    #[test]
    fn test_layout_dirs_exist() {
        let (_dir, paths) = vault();
        assert!(paths.migrations_dir().is_dir());
        assert!(paths.backups_dir().is_dir());
        assert!(paths.root().join("ops/tasks").is_dir());
    }
}
