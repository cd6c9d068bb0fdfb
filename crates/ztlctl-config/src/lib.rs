#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ztlctl-config** – Configuration loading for the ztlctl vault engine.
//!
//! Configuration lives in `ztlctl.toml` at the vault root and is sparse:
//! every key has a default, unspecified sections are filled in, and unknown
//! keys are ignored. Precedence is explicit flags (applied by the CLI) over
//! `ZTLCTL_*` environment variables over the TOML file over defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Name of the configuration file at the vault root.
pub const CONFIG_FILE: &str = "ztlctl.toml";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not valid TOML.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Offending path.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

//─────────────────────────────
//  Sections
//─────────────────────────────

/// Signal weights for the reweave composite score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReweaveWeights {
    /// BM25 lexical signal.
    pub lexical: f64,
    /// Jaccard tag-overlap signal.
    pub tags: f64,
    /// Inverse shortest-path signal.
    pub graph: f64,
    /// Same-topic signal.
    pub topic: f64,
}

impl Default for ReweaveWeights {
    fn default() -> Self {
        Self { lexical: 0.35, tags: 0.25, graph: 0.25, topic: 0.15 }
    }
}

/// Reweave (graph densification) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReweaveConfig {
    /// Signal weights; normalized at use.
    pub weights: ReweaveWeights,
    /// Candidates scoring below this are discarded.
    pub min_score_threshold: f64,
    /// Maximum new edges per source note per run.
    pub max_links_per_note: usize,
    /// Run reweave inline after creating notes and references.
    pub auto: bool,
    /// Lower threshold used by the session-close orphan sweep.
    pub orphan_threshold: f64,
}

impl Default for ReweaveConfig {
    fn default() -> Self {
        Self {
            weights: ReweaveWeights::default(),
            min_score_threshold: 0.6,
            max_links_per_note: 5,
            auto: true,
            orphan_threshold: 0.45,
        }
    }
}

/// Graph engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Requested community algorithm; `leiden` degrades to `louvain` with a
    /// surfaced warning when no Leiden backend is available.
    pub community: String,
    /// BFS depth cap for `related`.
    pub related_depth: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self { community: "leiden".into(), related_depth: 3 }
    }
}

/// Query ranking settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Half-life in days for the recency ranking mode.
    pub half_life_days: f64,
    /// Cosine-similarity weight `w` for hybrid ranking.
    pub hybrid_weight: f64,
    /// Default result limit.
    pub limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { half_life_days: 30.0, hybrid_weight: 0.5, limit: 20 }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Bounded worker pool size for asynchronous dispatch.
    pub workers: usize,
    /// Retries before an event is dead-lettered.
    pub max_retries: u32,
    /// Bypass the pool and execute handlers inline.
    pub sync: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { workers: 2, max_retries: 3, sync: false }
    }
}

/// Integrity checker settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Timestamped backups kept before pruning.
    pub backup_retention: usize,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self { backup_retention: 5 }
    }
}

/// Semantic vector settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorsConfig {
    /// Whether embeddings are computed and used for hybrid ranking.
    pub enabled: bool,
    /// Embedding dimensionality.
    pub dim: usize,
}

impl Default for VectorsConfig {
    fn default() -> Self {
        Self { enabled: false, dim: 256 }
    }
}

/// Session and agent-context settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default token budget for the agent context payload.
    pub context_budget: usize,
    /// Minimum tokens reserved for identity and methodology documents.
    pub reserved_identity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { context_budget: 8000, reserved_identity: 1200 }
    }
}

//─────────────────────────────
//  Root config
//─────────────────────────────

/// Full ztlctl configuration with defaults for every key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZtlConfig {
    /// Reweave settings.
    pub reweave: ReweaveConfig,
    /// Graph engine settings.
    pub graph: GraphConfig,
    /// Query ranking settings.
    pub query: QueryConfig,
    /// Event bus settings.
    pub events: EventsConfig,
    /// Integrity checker settings.
    pub check: CheckConfig,
    /// Semantic vector settings.
    pub vectors: VectorsConfig,
    /// Session settings.
    pub session: SessionConfig,
}

impl ZtlConfig {
    /// Load configuration for a vault root.
    ///
    /// A missing `ztlctl.toml` yields pure defaults; a present but invalid
    /// file is an error (silent fallback would mask operator typos).
    /// Environment overrides are applied after the file.
    pub fn load(vault_root: &Path) -> Result<Self, ConfigError> {
        let path = vault_root.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `ZTLCTL_*` environment overrides for scalar keys.
    ///
    /// Takes a lookup closure so tests can inject an environment without
    /// mutating process state.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ZTLCTL_REWEAVE_AUTO").and_then(|v| parse_bool(&v)) {
            self.reweave.auto = v;
        }
        if let Some(v) = lookup("ZTLCTL_REWEAVE_MIN_SCORE").and_then(|v| v.parse().ok()) {
            self.reweave.min_score_threshold = v;
        }
        if let Some(v) = lookup("ZTLCTL_EVENTS_SYNC").and_then(|v| parse_bool(&v)) {
            self.events.sync = v;
        }
        if let Some(v) = lookup("ZTLCTL_EVENTS_WORKERS").and_then(|v| v.parse().ok()) {
            self.events.workers = v;
        }
        if let Some(v) = lookup("ZTLCTL_VECTORS_ENABLED").and_then(|v| parse_bool(&v)) {
            self.vectors.enabled = v;
        }
        if let Some(v) = lookup("ZTLCTL_QUERY_LIMIT").and_then(|v| v.parse().ok()) {
            self.query.limit = v;
        }
    }

    /// Serialize the default configuration as a commented starting file.
    pub fn starter_toml() -> String {
        let defaults = Self::default();
        let body = toml::to_string_pretty(&defaults).unwrap_or_default();
        format!("# ztlctl configuration. Every key is optional.\n{}", body)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let c = ZtlConfig::default();
        assert_eq!(c.reweave.weights.lexical, 0.35);
        assert_eq!(c.reweave.min_score_threshold, 0.6);
        assert_eq!(c.reweave.max_links_per_note, 5);
        assert_eq!(c.events.workers, 2);
        assert_eq!(c.query.hybrid_weight, 0.5);
        assert_eq!(c.check.backup_retention, 5);
    }

    #[test]
    fn test_sparse_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[reweave]\nmin_score_threshold = 0.8\n\n[events]\nsync = true\n",
        )
        .unwrap();
        let c = ZtlConfig::load(dir.path()).unwrap();
        assert_eq!(c.reweave.min_score_threshold, 0.8);
        assert!(c.events.sync);
        // Untouched sections keep defaults.
        assert_eq!(c.reweave.max_links_per_note, 5);
        assert_eq!(c.graph.community, "leiden");
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = ZtlConfig::load(dir.path()).unwrap();
        assert_eq!(c.query.half_life_days, 30.0);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "not = [valid").unwrap();
        assert!(ZtlConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_env_overrides_beat_file() {
        let mut c = ZtlConfig::default();
        c.apply_env_overrides(|key| match key {
            "ZTLCTL_EVENTS_SYNC" => Some("true".into()),
            "ZTLCTL_EVENTS_WORKERS" => Some("4".into()),
            _ => None,
        });
        assert!(c.events.sync);
        assert_eq!(c.events.workers, 4);
    }
}
