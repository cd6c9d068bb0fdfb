//! Full-text index synchronization and BM25 search.
//!
//! `notes_fts` is an FTS5 virtual table; it cannot be updated in place, so
//! every sync is delete + insert. Queries are built from sanitized tokens to
//! keep user input out of the FTS5 match grammar.

use sqlx::{Row, SqliteConnection};

use crate::Result;

/// Replace the indexed text of a node.
pub async fn fts_replace(
    conn: &mut SqliteConnection,
    id: &str,
    title: &str,
    body: &str,
) -> Result<()> {
    fts_delete(&mut *conn, id).await?;
    sqlx::query("INSERT INTO notes_fts (id, title, body) VALUES (?, ?, ?)")
        .bind(id)
        .bind(title)
        .bind(body)
        .execute(conn)
        .await?;
    Ok(())
}

/// Remove a node from the full-text index.
pub async fn fts_delete(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM notes_fts WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// BM25 search. Returns `(id, score)` with higher scores better.
///
/// SQLite's `bm25()` returns lower-is-better ranks; they are negated here so
/// every ranking path in the engine sorts descending.
pub async fn fts_search(
    conn: &mut SqliteConnection,
    query: &str,
    limit: i64,
) -> Result<Vec<(String, f64)>> {
    let match_expr = match build_match_expr(query) {
        Some(expr) => expr,
        None => return Ok(Vec::new()),
    };
    let rows = sqlx::query(
        "SELECT id, bm25(notes_fts) AS rank FROM notes_fts WHERE notes_fts MATCH ?
         ORDER BY rank LIMIT ?",
    )
    .bind(match_expr)
    .bind(limit)
    .fetch_all(conn)
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("id"), -r.get::<f64, _>("rank")))
        .collect())
}

/// Every id currently present in the full-text index.
pub async fn fts_ids(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT id FROM notes_fts").fetch_all(conn).await?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}

/// Turn free text into a safe FTS5 match expression: quoted alphanumeric
/// tokens joined by OR. Returns `None` when no token survives.
fn build_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[tokio::test]
    async fn test_search_ranks_matching_titles_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        fts_replace(&mut conn, "ztl_00000001", "Attention mechanisms", "transformers use attention")
            .await
            .unwrap();
        fts_replace(&mut conn, "ztl_00000002", "Gardening", "tomato plants need water")
            .await
            .unwrap();
        let hits = fts_search(&mut conn, "attention", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "ztl_00000001");
        assert!(hits[0].1 > 0.0);
    }

    #[tokio::test]
    async fn test_replace_is_delete_plus_insert() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        fts_replace(&mut conn, "ztl_00000001", "Old title", "old body").await.unwrap();
        fts_replace(&mut conn, "ztl_00000001", "New title", "new body").await.unwrap();
        assert_eq!(fts_ids(&mut conn).await.unwrap().len(), 1);
        assert!(fts_search(&mut conn, "old", 10).await.unwrap().is_empty());
        assert_eq!(fts_search(&mut conn, "new", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hostile_query_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        fts_replace(&mut conn, "ztl_00000001", "Attention", "body").await.unwrap();
        // FTS5 operators and quotes in user input must not be a syntax error.
        let hits = fts_search(&mut conn, "attention\" OR NEAR(", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(fts_search(&mut conn, "...", 10).await.unwrap().is_empty());
    }
}
