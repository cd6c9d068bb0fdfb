//! Seed templates written at vault initialization.
//!
//! `init` produces the identity documents under `self/` and a commented
//! starter `ztlctl.toml`. Existing files are never overwritten; a vault can
//! be re-initialized safely.

use std::fs;

use tracing::info;

use ztlctl_config::{ZtlConfig, CONFIG_FILE};
use ztlctl_store::{StoreError, VaultPaths};

use crate::EngineError;

const IDENTITY_TEMPLATE: &str = "\
# Identity

This vault belongs to {{vault_name}}.

## Purpose

Describe what this Zettelkasten is for: the domains it covers, the questions
it should help answer, and who (or what) works in it.

## Voice

Notes are atomic, titled as claims where possible, and linked aggressively.
";

const METHODOLOGY_TEMPLATE: &str = "\
# Methodology

## Capture

- One idea per note; the title is the claim.
- References record where material came from; annotate before linking.

## Connect

- Run reweave after capture sessions; review suggested links before pruning.
- Promote notes through the garden (seed, budding, evergreen) only by hand.

## Decide

- Decisions are immutable once accepted; change them by supersession.
";

/// Minimal placeholder substitution: `{{key}}` -> value.
pub fn render(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in substitutions {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

/// Write the starter configuration and identity documents, skipping any file
/// that already exists. Returns warnings for skipped files.
pub fn write_seed_documents(paths: &VaultPaths) -> Result<Vec<String>, EngineError> {
    let mut warnings = Vec::new();
    let vault_name = paths
        .root()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "this vault".to_string());

    let targets = [
        (paths.root().join(CONFIG_FILE), ZtlConfig::starter_toml()),
        (
            paths.root().join("self/identity.md"),
            render(IDENTITY_TEMPLATE, &[("vault_name", &vault_name)]),
        ),
        (
            paths.root().join("self/methodology.md"),
            render(METHODOLOGY_TEMPLATE, &[("vault_name", &vault_name)]),
        ),
    ];
    for (path, content) in targets {
        if path.exists() {
            warnings.push(format!("'{}' already exists, left untouched", path.display()));
            continue;
        }
        fs::write(&path, content).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "seed document written");
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_placeholders() {
        assert_eq!(render("hello {{name}}", &[("name", "vault")]), "hello vault");
        assert_eq!(render("no placeholders", &[]), "no placeholders");
    }

    #[test]
    fn test_seed_documents_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VaultPaths::new(dir.path()).unwrap();
        paths.ensure_layout().unwrap();
        let first = write_seed_documents(&paths).unwrap();
        assert!(first.is_empty());
        let identity = paths.root().join("self/identity.md");
        fs::write(&identity, "customized").unwrap();
        let second = write_seed_documents(&paths).unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(fs::read_to_string(&identity).unwrap(), "customized");
    }
}
