//! Row models for the index tables.
//!
//! Rows are decoded by hand from `sqlx` rows (the runtime query API carries
//! no compile-time column knowledge). JSON-encoded columns (`aliases`,
//! `refs`, `meta`) decode strictly: a bad value is a `Decode` error, not a
//! silent default, so the integrity checker can see corruption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use ztlctl_types::{ContentKind, Maturity};

use crate::StoreError;

/// One node of the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    /// Permanent identifier.
    pub id: String,
    /// Content kind.
    pub kind: ContentKind,
    /// Optional subtype.
    pub subtype: Option<String>,
    /// Lifecycle status.
    pub status: String,
    /// Garden maturity.
    pub maturity: Option<Maturity>,
    /// Topic directory for notes and references.
    pub topic: Option<String>,
    /// Human title.
    pub title: String,
    /// Vault-relative canonical path.
    pub path: String,
    /// Ordered alias list.
    pub aliases: Vec<String>,
    /// Owning session reference.
    pub session: Option<String>,
    /// Archived flag; archived nodes keep their edges.
    pub archived: bool,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified: DateTime<Utc>,
    /// Materialized in-degree.
    pub in_degree: i64,
    /// Materialized out-degree.
    pub out_degree: i64,
    /// Materialized PageRank.
    pub pagerank: f64,
    /// Materialized community id.
    pub cluster: Option<i64>,
    /// Materialized betweenness centrality.
    pub betweenness: f64,
}

impl NodeRow {
    /// Decode from a `SELECT * FROM nodes` row.
    pub fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let kind_str: String = row.get("kind");
        let kind = ContentKind::parse(&kind_str).ok_or(StoreError::Decode {
            table: "nodes",
            reason: format!("unknown kind '{}'", kind_str),
        })?;
        let maturity = match row.get::<Option<String>, _>("maturity") {
            None => None,
            Some(s) => Some(Maturity::parse(&s).ok_or(StoreError::Decode {
                table: "nodes",
                reason: format!("unknown maturity '{}'", s),
            })?),
        };
        let aliases_json: String = row.get("aliases");
        let aliases = serde_json::from_str(&aliases_json).map_err(|e| StoreError::Decode {
            table: "nodes",
            reason: format!("aliases: {}", e),
        })?;
        Ok(Self {
            id: row.get("id"),
            kind,
            subtype: row.get("subtype"),
            status: row.get("status"),
            maturity,
            topic: row.get("topic"),
            title: row.get("title"),
            path: row.get("path"),
            aliases,
            session: row.get("session"),
            archived: row.get::<i64, _>("archived") != 0,
            created: row.get("created"),
            modified: row.get("modified"),
            in_degree: row.get("in_degree"),
            out_degree: row.get("out_degree"),
            pagerank: row.get("pagerank"),
            cluster: row.get("cluster"),
            betweenness: row.get("betweenness"),
        })
    }
}

/// One directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRow {
    /// Source node id.
    pub source_id: String,
    /// Target node id.
    pub target_id: String,
    /// Edge type, `relates` by default.
    pub edge_type: String,
    /// Source layer: `frontmatter` or `body`.
    pub layer: String,
    /// Edge weight.
    pub weight: f64,
    /// Whether the relation reads both ways.
    pub bidirectional: bool,
    /// Marked by reweave when the edge scores below threshold.
    pub stale: bool,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
}

impl EdgeRow {
    /// A fresh `relates` edge with defaults.
    pub fn relates(source: &str, target: &str, layer: &str, now: DateTime<Utc>) -> Self {
        Self {
            source_id: source.to_string(),
            target_id: target.to_string(),
            edge_type: ztlctl_types::EDGE_RELATES.to_string(),
            layer: layer.to_string(),
            weight: 1.0,
            bidirectional: false,
            stale: false,
            created: now,
        }
    }

    /// Decode from a `SELECT * FROM edges` row.
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            source_id: row.get("source_id"),
            target_id: row.get("target_id"),
            edge_type: row.get("edge_type"),
            layer: row.get("layer"),
            weight: row.get("weight"),
            bidirectional: row.get::<i64, _>("bidirectional") != 0,
            stale: row.get::<i64, _>("stale") != 0,
            created: row.get("created"),
        }
    }
}

/// Lifecycle event persisted to the write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    /// Log row id.
    pub id: i64,
    /// Event kind, e.g. `post_create`.
    pub kind: String,
    /// WAL status: pending, in_flight, completed, failed, dead_letter.
    pub status: String,
    /// JSON payload.
    pub payload: String,
    /// Retry count so far.
    pub retries: i64,
    /// Owning session, when any.
    pub session: Option<String>,
    /// Insertion timestamp.
    pub created: DateTime<Utc>,
    /// Last status change.
    pub updated: DateTime<Utc>,
}

impl EventRow {
    /// Decode from a `SELECT * FROM event_log` row.
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            kind: row.get("kind"),
            status: row.get("status"),
            payload: row.get("payload"),
            retries: row.get("retries"),
            session: row.get("session"),
            created: row.get("created"),
            updated: row.get("updated"),
        }
    }
}

/// One append-only reweave log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReweaveEntryRow {
    /// Log row id.
    pub id: i64,
    /// Batch this entry belongs to.
    pub batch: i64,
    /// `add` or `remove`.
    pub action: String,
    /// Edge source.
    pub source_id: String,
    /// Edge target.
    pub target_id: String,
    /// Edge type.
    pub edge_type: String,
    /// Timestamp.
    pub created: DateTime<Utc>,
    /// Whether a later undo reversed this entry.
    pub undone: bool,
}

impl ReweaveEntryRow {
    /// Decode from a `SELECT * FROM reweave_log` row.
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            batch: row.get("batch"),
            action: row.get("action"),
            source_id: row.get("source_id"),
            target_id: row.get("target_id"),
            edge_type: row.get("edge_type"),
            created: row.get("created"),
            undone: row.get::<i64, _>("undone") != 0,
        }
    }
}

/// One session log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntryRow {
    /// Log row id.
    pub id: i64,
    /// Session identifier.
    pub session: String,
    /// Entry kind: log, checkpoint, decision-made, ...
    pub entry_kind: String,
    /// One-line summary.
    pub summary: String,
    /// Optional full detail.
    pub detail: Option<String>,
    /// Precomputed token cost of summary + detail.
    pub tokens: i64,
    /// Pinned entries are never dropped by context reduction.
    pub pinned: bool,
    /// Referenced node ids.
    pub refs: Vec<String>,
    /// Free-form metadata.
    pub meta: serde_json::Value,
    /// Timestamp.
    pub created: DateTime<Utc>,
}

impl SessionEntryRow {
    /// Decode from a `SELECT * FROM session_log` row.
    pub fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let refs_json: String = row.get("refs");
        let refs = serde_json::from_str(&refs_json).map_err(|e| StoreError::Decode {
            table: "session_log",
            reason: format!("refs: {}", e),
        })?;
        let meta_json: String = row.get("meta");
        let meta = serde_json::from_str(&meta_json).map_err(|e| StoreError::Decode {
            table: "session_log",
            reason: format!("meta: {}", e),
        })?;
        Ok(Self {
            id: row.get("id"),
            session: row.get("session"),
            entry_kind: row.get("entry_kind"),
            summary: row.get("summary"),
            detail: row.get("detail"),
            tokens: row.get("tokens"),
            pinned: row.get::<i64, _>("pinned") != 0,
            refs,
            meta,
            created: row.get("created"),
        })
    }
}
