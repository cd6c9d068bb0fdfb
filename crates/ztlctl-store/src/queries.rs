//! Query helpers for the index tables.
//!
//! Every helper takes `&mut SqliteConnection` so the caller controls the
//! transaction scope: the engine's vault transaction passes its own
//! connection, and read paths pass a pooled one. Nothing here begins or
//! commits transactions.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use crate::rows::{EdgeRow, EventRow, NodeRow, ReweaveEntryRow, SessionEntryRow};
use crate::Result;

//─────────────────────────────
//  Nodes
//─────────────────────────────

/// Insert a new node row. Fails on any uniqueness violation.
pub async fn insert_node(conn: &mut SqliteConnection, node: &NodeRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO nodes (id, kind, subtype, status, maturity, topic, title, path, aliases,
                            session, archived, created, modified,
                            in_degree, out_degree, pagerank, cluster, betweenness)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&node.id)
    .bind(node.kind.as_str())
    .bind(&node.subtype)
    .bind(&node.status)
    .bind(node.maturity.map(|m| m.as_str()))
    .bind(&node.topic)
    .bind(&node.title)
    .bind(&node.path)
    .bind(serde_json::to_string(&node.aliases).unwrap_or_else(|_| "[]".into()))
    .bind(&node.session)
    .bind(node.archived as i64)
    .bind(node.created)
    .bind(node.modified)
    .bind(node.in_degree)
    .bind(node.out_degree)
    .bind(node.pagerank)
    .bind(node.cluster)
    .bind(node.betweenness)
    .execute(conn)
    .await?;
    Ok(())
}

/// Refresh every mutable column of a node row.
pub async fn update_node(conn: &mut SqliteConnection, node: &NodeRow) -> Result<()> {
    sqlx::query(
        "UPDATE nodes SET subtype = ?, status = ?, maturity = ?, topic = ?, title = ?,
                          path = ?, aliases = ?, session = ?, archived = ?, modified = ?
         WHERE id = ?",
    )
    .bind(&node.subtype)
    .bind(&node.status)
    .bind(node.maturity.map(|m| m.as_str()))
    .bind(&node.topic)
    .bind(&node.title)
    .bind(&node.path)
    .bind(serde_json::to_string(&node.aliases).unwrap_or_else(|_| "[]".into()))
    .bind(&node.session)
    .bind(node.archived as i64)
    .bind(node.modified)
    .bind(&node.id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Fetch a node by identifier.
pub async fn get_node(conn: &mut SqliteConnection, id: &str) -> Result<Option<NodeRow>> {
    let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    row.map(|r| NodeRow::from_row(&r)).transpose()
}

/// Fetch every node whose exact title matches.
pub async fn nodes_by_title(conn: &mut SqliteConnection, title: &str) -> Result<Vec<NodeRow>> {
    let rows = sqlx::query("SELECT * FROM nodes WHERE title = ? ORDER BY id")
        .bind(title)
        .fetch_all(conn)
        .await?;
    rows.iter().map(NodeRow::from_row).collect()
}

/// Fetch every node carrying `alias` in its alias list.
///
/// The LIKE pass narrows candidates; the decoded list is checked exactly so
/// substring collisions never resolve.
pub async fn nodes_with_alias(conn: &mut SqliteConnection, alias: &str) -> Result<Vec<NodeRow>> {
    let pattern = format!("%{}%", alias.replace('%', "").replace('_', ""));
    let rows = sqlx::query("SELECT * FROM nodes WHERE aliases LIKE ? ORDER BY id")
        .bind(pattern)
        .fetch_all(conn)
        .await?;
    let mut out = Vec::new();
    for row in &rows {
        let node = NodeRow::from_row(row)?;
        if node.aliases.iter().any(|a| a == alias) {
            out.push(node);
        }
    }
    Ok(out)
}

/// Fetch all nodes.
pub async fn all_nodes(conn: &mut SqliteConnection) -> Result<Vec<NodeRow>> {
    let rows = sqlx::query("SELECT * FROM nodes ORDER BY id").fetch_all(conn).await?;
    rows.iter().map(NodeRow::from_row).collect()
}

/// Delete a node row (integrity fixes only; the engine never deletes content).
pub async fn delete_node(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
    let done = sqlx::query("DELETE FROM nodes WHERE id = ?").bind(id).execute(conn).await?;
    Ok(done.rows_affected() > 0)
}

/// Persist materialized graph metrics onto a node row.
pub async fn set_node_metrics(
    conn: &mut SqliteConnection,
    id: &str,
    in_degree: i64,
    out_degree: i64,
    pagerank: f64,
    cluster: Option<i64>,
    betweenness: f64,
) -> Result<()> {
    sqlx::query(
        "UPDATE nodes SET in_degree = ?, out_degree = ?, pagerank = ?, cluster = ?, betweenness = ?
         WHERE id = ?",
    )
    .bind(in_degree)
    .bind(out_degree)
    .bind(pagerank)
    .bind(cluster)
    .bind(betweenness)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Update only the lifecycle status of a node.
pub async fn set_node_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: &str,
    modified: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE nodes SET status = ?, modified = ? WHERE id = ?")
        .bind(status)
        .bind(modified)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

//─────────────────────────────
//  Edges
//─────────────────────────────

/// Insert an edge unless `(source, target, edge_type)` already exists.
///
/// Returns whether a new row was written.
pub async fn upsert_edge(conn: &mut SqliteConnection, edge: &EdgeRow) -> Result<bool> {
    let done = sqlx::query(
        "INSERT INTO edges (source_id, target_id, edge_type, layer, weight, bidirectional, stale, created)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (source_id, target_id, edge_type) DO NOTHING",
    )
    .bind(&edge.source_id)
    .bind(&edge.target_id)
    .bind(&edge.edge_type)
    .bind(&edge.layer)
    .bind(edge.weight)
    .bind(edge.bidirectional as i64)
    .bind(edge.stale as i64)
    .bind(edge.created)
    .execute(conn)
    .await?;
    Ok(done.rows_affected() > 0)
}

/// Delete one edge. Returns whether it existed.
pub async fn delete_edge(
    conn: &mut SqliteConnection,
    source: &str,
    target: &str,
    edge_type: &str,
) -> Result<bool> {
    let done = sqlx::query(
        "DELETE FROM edges WHERE source_id = ? AND target_id = ? AND edge_type = ?",
    )
    .bind(source)
    .bind(target)
    .bind(edge_type)
    .execute(conn)
    .await?;
    Ok(done.rows_affected() > 0)
}

/// Delete all outgoing edges of `source` (link re-extraction).
pub async fn delete_edges_from(conn: &mut SqliteConnection, source: &str) -> Result<u64> {
    let done = sqlx::query("DELETE FROM edges WHERE source_id = ?")
        .bind(source)
        .execute(conn)
        .await?;
    Ok(done.rows_affected())
}

/// Outgoing edges of a node.
pub async fn edges_from(conn: &mut SqliteConnection, source: &str) -> Result<Vec<EdgeRow>> {
    let rows = sqlx::query("SELECT * FROM edges WHERE source_id = ? ORDER BY target_id, edge_type")
        .bind(source)
        .fetch_all(conn)
        .await?;
    Ok(rows.iter().map(EdgeRow::from_row).collect())
}

/// All edges, ordered deterministically.
pub async fn all_edges(conn: &mut SqliteConnection) -> Result<Vec<EdgeRow>> {
    let rows = sqlx::query("SELECT * FROM edges ORDER BY source_id, target_id, edge_type")
        .fetch_all(conn)
        .await?;
    Ok(rows.iter().map(EdgeRow::from_row).collect())
}

/// Count of outgoing, non-stale edges (drives machine status).
pub async fn out_degree(conn: &mut SqliteConnection, id: &str) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM edges WHERE source_id = ? AND stale = 0")
        .bind(id)
        .fetch_one(conn)
        .await?;
    Ok(row.get("n"))
}

/// Flip the stale marker on one edge.
pub async fn set_edge_stale(
    conn: &mut SqliteConnection,
    source: &str,
    target: &str,
    edge_type: &str,
    stale: bool,
) -> Result<()> {
    sqlx::query("UPDATE edges SET stale = ? WHERE source_id = ? AND target_id = ? AND edge_type = ?")
        .bind(stale as i64)
        .bind(source)
        .bind(target)
        .bind(edge_type)
        .execute(conn)
        .await?;
    Ok(())
}

/// Every edge currently marked stale.
pub async fn stale_edges(conn: &mut SqliteConnection) -> Result<Vec<EdgeRow>> {
    let rows = sqlx::query("SELECT * FROM edges WHERE stale = 1 ORDER BY source_id, target_id")
        .fetch_all(conn)
        .await?;
    Ok(rows.iter().map(EdgeRow::from_row).collect())
}

/// Delete all stale edges (reweave `--prune`). Returns how many went away.
pub async fn delete_stale_edges(conn: &mut SqliteConnection) -> Result<u64> {
    let done = sqlx::query("DELETE FROM edges WHERE stale = 1").execute(conn).await?;
    Ok(done.rows_affected())
}

/// Edges whose source or target no longer resolves to a node.
pub async fn dangling_edges(conn: &mut SqliteConnection) -> Result<Vec<EdgeRow>> {
    let rows = sqlx::query(
        "SELECT e.* FROM edges e
         LEFT JOIN nodes s ON s.id = e.source_id
         LEFT JOIN nodes t ON t.id = e.target_id
         WHERE s.id IS NULL OR t.id IS NULL",
    )
    .fetch_all(conn)
    .await?;
    Ok(rows.iter().map(EdgeRow::from_row).collect())
}

//─────────────────────────────
//  Tags
//─────────────────────────────

/// Register a tag in the registry if new.
pub async fn register_tag(conn: &mut SqliteConnection, tag: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO tags (tag, created) VALUES (?, ?)")
        .bind(tag)
        .bind(now)
        .execute(conn)
        .await?;
    Ok(())
}

/// Attach a tag to a node (idempotent).
pub async fn tag_node(conn: &mut SqliteConnection, node_id: &str, tag: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO node_tags (node_id, tag) VALUES (?, ?)")
        .bind(node_id)
        .bind(tag)
        .execute(conn)
        .await?;
    Ok(())
}

/// Drop every tag association of a node (refresh path).
pub async fn untag_node(conn: &mut SqliteConnection, node_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM node_tags WHERE node_id = ?")
        .bind(node_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Tags attached to a node.
pub async fn tags_for_node(conn: &mut SqliteConnection, node_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT tag FROM node_tags WHERE node_id = ? ORDER BY tag")
        .bind(node_id)
        .fetch_all(conn)
        .await?;
    Ok(rows.iter().map(|r| r.get("tag")).collect())
}

//─────────────────────────────
//  Counters
//─────────────────────────────

/// Consume the next value of a sequential counter.
///
/// Runs as read-modify-write on the caller's connection so the mint is
/// atomic within the calling transaction. Gaps are never reused: a rolled
/// back transaction rolls the counter back with it.
pub async fn next_counter(conn: &mut SqliteConnection, prefix: &str) -> Result<i64> {
    let current: Option<i64> = sqlx::query("SELECT next FROM counters WHERE prefix = ?")
        .bind(prefix)
        .fetch_optional(&mut *conn)
        .await?
        .map(|r| r.get("next"));
    match current {
        Some(value) => {
            sqlx::query("UPDATE counters SET next = next + 1 WHERE prefix = ?")
                .bind(prefix)
                .execute(conn)
                .await?;
            Ok(value)
        }
        None => {
            sqlx::query("INSERT INTO counters (prefix, next) VALUES (?, 2)")
                .bind(prefix)
                .execute(conn)
                .await?;
            Ok(1)
        }
    }
}

/// Force a counter to a specific next value (rebuild only: sequences must
/// resume past the highest identifier found in files).
pub async fn set_counter(conn: &mut SqliteConnection, prefix: &str, next: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO counters (prefix, next) VALUES (?, ?)
         ON CONFLICT (prefix) DO UPDATE SET next = excluded.next",
    )
    .bind(prefix)
    .bind(next)
    .execute(conn)
    .await?;
    Ok(())
}

//─────────────────────────────
//  Event WAL
//─────────────────────────────

/// Insert a pending event row; returns its id.
pub async fn insert_event(
    conn: &mut SqliteConnection,
    kind: &str,
    payload: &str,
    session: Option<&str>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO event_log (kind, status, payload, retries, session, created, updated)
         VALUES (?, 'pending', ?, 0, ?, ?, ?) RETURNING id",
    )
    .bind(kind)
    .bind(payload)
    .bind(session)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(row.get("id"))
}

/// Move an event row to a new WAL status.
pub async fn set_event_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: &str,
    retries: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE event_log SET status = ?, retries = ?, updated = ? WHERE id = ?")
        .bind(status)
        .bind(retries)
        .bind(now)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Events currently in any of the given statuses, oldest first.
pub async fn events_with_status(
    conn: &mut SqliteConnection,
    statuses: &[&str],
) -> Result<Vec<EventRow>> {
    let placeholders = vec!["?"; statuses.len()].join(", ");
    let sql = format!(
        "SELECT * FROM event_log WHERE status IN ({}) ORDER BY id",
        placeholders
    );
    let mut query = sqlx::query(&sql);
    for status in statuses {
        query = query.bind(*status);
    }
    let rows = query.fetch_all(conn).await?;
    Ok(rows.iter().map(EventRow::from_row).collect())
}

//─────────────────────────────
//  Reweave log
//─────────────────────────────

/// Allocate the next reweave batch id.
pub async fn next_reweave_batch(conn: &mut SqliteConnection) -> Result<i64> {
    let row = sqlx::query("SELECT COALESCE(MAX(batch), 0) + 1 AS next FROM reweave_log")
        .fetch_one(conn)
        .await?;
    Ok(row.get("next"))
}

/// Append one edge addition or removal to the reweave log.
pub async fn log_reweave(
    conn: &mut SqliteConnection,
    batch: i64,
    action: &str,
    source: &str,
    target: &str,
    edge_type: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO reweave_log (batch, action, source_id, target_id, edge_type, created, undone)
         VALUES (?, ?, ?, ?, ?, ?, 0)",
    )
    .bind(batch)
    .bind(action)
    .bind(source)
    .bind(target)
    .bind(edge_type)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Entries of one batch, newest first (undo replays in reverse).
pub async fn reweave_batch_entries(
    conn: &mut SqliteConnection,
    batch: i64,
) -> Result<Vec<ReweaveEntryRow>> {
    let rows = sqlx::query("SELECT * FROM reweave_log WHERE batch = ? ORDER BY id DESC")
        .bind(batch)
        .fetch_all(conn)
        .await?;
    Ok(rows.iter().map(ReweaveEntryRow::from_row).collect())
}

/// Most recent batch that has not been undone.
pub async fn latest_reweave_batch(conn: &mut SqliteConnection) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT MAX(batch) AS batch FROM reweave_log WHERE undone = 0")
        .fetch_optional(conn)
        .await?;
    Ok(row.and_then(|r| r.get::<Option<i64>, _>("batch")))
}

/// Timestamp of the newest live reweave entry touching `source`, if any.
pub async fn latest_reweave_for_source(
    conn: &mut SqliteConnection,
    source: &str,
) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query(
        "SELECT MAX(created) AS created FROM reweave_log WHERE source_id = ? AND undone = 0",
    )
    .bind(source)
    .fetch_optional(conn)
    .await?;
    Ok(row.and_then(|r| r.get::<Option<DateTime<Utc>>, _>("created")))
}

/// Flag every entry of a batch as undone.
pub async fn mark_batch_undone(conn: &mut SqliteConnection, batch: i64) -> Result<()> {
    sqlx::query("UPDATE reweave_log SET undone = 1 WHERE batch = ?")
        .bind(batch)
        .execute(conn)
        .await?;
    Ok(())
}

//─────────────────────────────
//  Session log
//─────────────────────────────

/// Append one session log entry; returns its id.
#[allow(clippy::too_many_arguments)]
pub async fn append_session_entry(
    conn: &mut SqliteConnection,
    session: &str,
    entry_kind: &str,
    summary: &str,
    detail: Option<&str>,
    tokens: i64,
    pinned: bool,
    refs: &[String],
    meta: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO session_log (session, entry_kind, summary, detail, tokens, pinned, refs, meta, created)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(session)
    .bind(entry_kind)
    .bind(summary)
    .bind(detail)
    .bind(tokens)
    .bind(pinned as i64)
    .bind(serde_json::to_string(refs).unwrap_or_else(|_| "[]".into()))
    .bind(meta.to_string())
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(row.get("id"))
}

/// Entries of one session in append order.
pub async fn session_entries(
    conn: &mut SqliteConnection,
    session: &str,
) -> Result<Vec<SessionEntryRow>> {
    let rows = sqlx::query("SELECT * FROM session_log WHERE session = ? ORDER BY id")
        .bind(session)
        .fetch_all(conn)
        .await?;
    rows.iter().map(SessionEntryRow::from_row).collect()
}

/// Row id of the latest `checkpoint` entry in a session, if any.
pub async fn latest_checkpoint(conn: &mut SqliteConnection, session: &str) -> Result<Option<i64>> {
    let row = sqlx::query(
        "SELECT MAX(id) AS id FROM session_log WHERE session = ? AND entry_kind = 'checkpoint'",
    )
    .bind(session)
    .fetch_optional(conn)
    .await?;
    Ok(row.and_then(|r| r.get::<Option<i64>, _>("id")))
}

//─────────────────────────────
//  Embeddings
//─────────────────────────────

/// Store (or refresh) a node's embedding as little-endian f32 bytes.
pub async fn upsert_embedding(
    conn: &mut SqliteConnection,
    node_id: &str,
    vector: &[f32],
    now: DateTime<Utc>,
) -> Result<()> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    sqlx::query(
        "INSERT INTO embeddings (node_id, dim, vector, updated) VALUES (?, ?, ?, ?)
         ON CONFLICT (node_id) DO UPDATE SET dim = excluded.dim, vector = excluded.vector,
                                             updated = excluded.updated",
    )
    .bind(node_id)
    .bind(vector.len() as i64)
    .bind(bytes)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Fetch a node's embedding, if indexed.
pub async fn get_embedding(conn: &mut SqliteConnection, node_id: &str) -> Result<Option<Vec<f32>>> {
    let row = sqlx::query("SELECT vector FROM embeddings WHERE node_id = ?")
        .bind(node_id)
        .fetch_optional(conn)
        .await?;
    Ok(row.map(|r| decode_vector(r.get("vector"))))
}

fn decode_vector(bytes: Vec<u8>) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use ztlctl_types::ContentKind;

    async fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (dir, store)
    }

    fn node(id: &str, title: &str) -> NodeRow {
        let now = Utc::now();
        NodeRow {
            id: id.into(),
            kind: ContentKind::Note,
            subtype: Some("knowledge".into()),
            status: "draft".into(),
            maturity: None,
            topic: Some("ml".into()),
            title: title.into(),
            path: format!("notes/ml/{}-{}.md", id, title.to_lowercase()),
            aliases: vec![format!("{} alias", title)],
            session: None,
            archived: false,
            created: now,
            modified: now,
            in_degree: 0,
            out_degree: 0,
            pagerank: 0.0,
            cluster: None,
            betweenness: 0.0,
        }
    }

    #[tokio::test]
    async fn test_node_round_trip() {
        let (_d, store) = store().await;
        let mut conn = store.pool().acquire().await.unwrap();
        let n = node("ztl_00000001", "Alpha");
        insert_node(&mut conn, &n).await.unwrap();
        let back = get_node(&mut conn, "ztl_00000001").await.unwrap().unwrap();
        assert_eq!(back.title, "Alpha");
        assert_eq!(back.aliases, vec!["Alpha alias".to_string()]);
    }

    #[tokio::test]
    async fn test_alias_lookup_is_exact() {
        let (_d, store) = store().await;
        let mut conn = store.pool().acquire().await.unwrap();
        insert_node(&mut conn, &node("ztl_00000001", "Alpha")).await.unwrap();
        let hits = nodes_with_alias(&mut conn, "Alpha alias").await.unwrap();
        assert_eq!(hits.len(), 1);
        // Substring of a stored alias must not resolve.
        let misses = nodes_with_alias(&mut conn, "Alpha ali").await.unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn test_edge_uniqueness_key() {
        let (_d, store) = store().await;
        let mut conn = store.pool().acquire().await.unwrap();
        insert_node(&mut conn, &node("ztl_00000001", "Alpha")).await.unwrap();
        insert_node(&mut conn, &node("ztl_00000002", "Beta")).await.unwrap();
        let e = EdgeRow::relates("ztl_00000001", "ztl_00000002", "frontmatter", Utc::now());
        assert!(upsert_edge(&mut conn, &e).await.unwrap());
        assert!(!upsert_edge(&mut conn, &e).await.unwrap());
        // Same pair, different type, is a distinct edge.
        let mut e2 = e.clone();
        e2.edge_type = "supersedes".into();
        assert!(upsert_edge(&mut conn, &e2).await.unwrap());
    }

    #[tokio::test]
    async fn test_counter_is_monotonic_without_reuse() {
        let (_d, store) = store().await;
        let mut conn = store.pool().acquire().await.unwrap();
        assert_eq!(next_counter(&mut conn, "TASK").await.unwrap(), 1);
        assert_eq!(next_counter(&mut conn, "TASK").await.unwrap(), 2);
        assert_eq!(next_counter(&mut conn, "LOG").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_counter_rolls_back_with_transaction() {
        let (_d, store) = store().await;
        {
            let mut txn = store.pool().begin().await.unwrap();
            assert_eq!(next_counter(&mut txn, "TASK").await.unwrap(), 1);
            txn.rollback().await.unwrap();
        }
        let mut conn = store.pool().acquire().await.unwrap();
        // The mint above never committed, so the sequence restarts.
        assert_eq!(next_counter(&mut conn, "TASK").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_event_wal_status_flow() {
        let (_d, store) = store().await;
        let mut conn = store.pool().acquire().await.unwrap();
        let id = insert_event(&mut conn, "post_create", "{}", None, Utc::now()).await.unwrap();
        set_event_status(&mut conn, id, "failed", 1, Utc::now()).await.unwrap();
        let pending = events_with_status(&mut conn, &["pending", "failed"]).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retries, 1);
        set_event_status(&mut conn, id, "completed", 1, Utc::now()).await.unwrap();
        assert!(events_with_status(&mut conn, &["pending", "failed"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embedding_round_trip() {
        let (_d, store) = store().await;
        let mut conn = store.pool().acquire().await.unwrap();
        upsert_embedding(&mut conn, "ztl_00000001", &[0.5, -1.0, 2.0], Utc::now())
            .await
            .unwrap();
        let v = get_embedding(&mut conn, "ztl_00000001").await.unwrap().unwrap();
        assert_eq!(v, vec![0.5, -1.0, 2.0]);
    }
}
