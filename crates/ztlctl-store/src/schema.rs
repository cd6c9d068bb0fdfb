//! Versioned schema migration engine.
//!
//! Migrations are an ordered, append-only list embedded in the crate. The
//! `schema_migrations` table records which versions have been applied; each
//! applied migration is also mirrored as a file under `.ztlctl/migrations/`
//! so operators can inspect the exact DDL their index was built with.

use chrono::Utc;
use sqlx::Row;
use tracing::info;

use crate::{Result, Store, StoreError};

/// One schema version.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        sql: r#"
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    subtype TEXT,
    status TEXT NOT NULL,
    maturity TEXT,
    topic TEXT,
    title TEXT NOT NULL,
    path TEXT NOT NULL UNIQUE,
    aliases TEXT NOT NULL DEFAULT '[]',
    session TEXT,
    archived INTEGER NOT NULL DEFAULT 0,
    created TEXT NOT NULL,
    modified TEXT NOT NULL,
    in_degree INTEGER NOT NULL DEFAULT 0,
    out_degree INTEGER NOT NULL DEFAULT 0,
    pagerank REAL NOT NULL DEFAULT 0,
    cluster INTEGER,
    betweenness REAL NOT NULL DEFAULT 0,
    UNIQUE (kind, id)
);
CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind);
CREATE INDEX IF NOT EXISTS idx_nodes_status ON nodes(status);
CREATE INDEX IF NOT EXISTS idx_nodes_topic ON nodes(topic);
CREATE INDEX IF NOT EXISTS idx_nodes_modified ON nodes(modified);

CREATE TABLE IF NOT EXISTS edges (
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    edge_type TEXT NOT NULL DEFAULT 'relates',
    layer TEXT NOT NULL DEFAULT 'frontmatter',
    weight REAL NOT NULL DEFAULT 1.0,
    bidirectional INTEGER NOT NULL DEFAULT 0,
    stale INTEGER NOT NULL DEFAULT 0,
    created TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id, edge_type)
);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);

CREATE TABLE IF NOT EXISTS tags (
    tag TEXT PRIMARY KEY,
    description TEXT,
    created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS node_tags (
    node_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (node_id, tag)
);
CREATE INDEX IF NOT EXISTS idx_node_tags_tag ON node_tags(tag);

CREATE TABLE IF NOT EXISTS counters (
    prefix TEXT PRIMARY KEY,
    next INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    payload TEXT NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    session TEXT,
    created TEXT NOT NULL,
    updated TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_log_status ON event_log(status);

CREATE TABLE IF NOT EXISTS reweave_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch INTEGER NOT NULL,
    action TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    edge_type TEXT NOT NULL,
    created TEXT NOT NULL,
    undone INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_reweave_log_batch ON reweave_log(batch);

CREATE TABLE IF NOT EXISTS session_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session TEXT NOT NULL,
    entry_kind TEXT NOT NULL,
    summary TEXT NOT NULL,
    detail TEXT,
    tokens INTEGER NOT NULL DEFAULT 0,
    pinned INTEGER NOT NULL DEFAULT 0,
    refs TEXT NOT NULL DEFAULT '[]',
    meta TEXT NOT NULL DEFAULT '{}',
    created TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_log_session ON session_log(session);

CREATE TABLE IF NOT EXISTS embeddings (
    node_id TEXT PRIMARY KEY,
    dim INTEGER NOT NULL,
    vector BLOB NOT NULL,
    updated TEXT NOT NULL
);
"#,
    },
    Migration {
        version: 2,
        name: "fulltext",
        sql: r#"
CREATE VIRTUAL TABLE IF NOT EXISTS notes_fts USING fts5(
    id UNINDEXED,
    title,
    body
);
"#,
    },
];

/// Apply all pending migrations for `store`.
pub async fn migrate(store: &Store) -> Result<()> {
    let pool = store.pool();
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let applied: Vec<i64> = sqlx::query("SELECT version FROM schema_migrations ORDER BY version")
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| row.get::<i64, _>("version"))
        .collect();

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        let mut txn = pool.begin().await?;
        for statement in split_statements(migration.sql) {
            sqlx::query(&statement)
                .execute(&mut *txn)
                .await
                .map_err(|e| StoreError::Migration {
                    name: migration.name.to_string(),
                    reason: e.to_string(),
                })?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, name, applied) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *txn)
            .await?;
        txn.commit().await?;

        mirror_migration(store, migration);
        info!(version = migration.version, name = migration.name, "applied migration");
    }
    Ok(())
}

/// Mirror the applied DDL into `.ztlctl/migrations/` for inspection.
///
/// Best-effort: the index is already consistent, a read-only mirror must not
/// fail the open path.
fn mirror_migration(store: &Store, migration: &Migration) {
    let file = store
        .paths()
        .migrations_dir()
        .join(format!("{:04}_{}.sql", migration.version, migration.name));
    if !file.exists() {
        let _ = std::fs::write(&file, migration.sql.trim_start());
    }
}

/// Split a migration script into single statements for the sqlite driver.
fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Names of every table the schema defines, used by the integrity checker.
pub fn expected_tables() -> Vec<&'static str> {
    vec![
        "nodes",
        "edges",
        "tags",
        "node_tags",
        "counters",
        "event_log",
        "reweave_log",
        "session_log",
        "embeddings",
        "notes_fts",
        "schema_migrations",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        // Reopening applies nothing new and must not error.
        migrate(&store).await.unwrap();
        let versions: Vec<i64> =
            sqlx::query("SELECT version FROM schema_migrations ORDER BY version")
                .fetch_all(store.pool())
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.get("version"))
                .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_migrations_are_mirrored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        assert!(store.paths().migrations_dir().join("0001_initial.sql").exists());
        assert!(store.paths().migrations_dir().join("0002_fulltext.sql").exists());
    }
}
