//! The integrity checker: report, fix, rebuild, rollback.
//!
//! Four categories: database-file consistency, schema integrity, graph
//! health, and structural validation. `fix safe` removes orphan rows,
//! re-inserts missing FTS rows, and resyncs frontmatter from files;
//! `fix aggressive` additionally re-indexes every edge and rewrites
//! frontmatter into canonical key order. Body text is never modified.
//! `rebuild` reconstructs the whole index from files in two passes. Every
//! destructive operation takes a timestamped backup first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sqlx::Row;
use tracing::info;
use walkdir::WalkDir;

use ztlctl_events::EventKind;
use ztlctl_store::rows::NodeRow;
use ztlctl_store::{backup, fts, queries, schema, StoreError};
use ztlctl_types::{id::IdKind, Frontmatter, ServiceResult};

use crate::txn::VaultTxn;
use crate::{indexing, respond, EngineError, Vault};

/// One finding from the checker.
#[derive(Debug, Clone)]
pub(crate) struct CheckIssue {
    pub category: &'static str,
    pub subject: String,
    pub message: String,
    pub fixable: bool,
}

/// Full checker report.
#[derive(Debug, Default)]
pub(crate) struct CheckReport {
    pub issues: Vec<CheckIssue>,
    pub nodes: usize,
    pub edges: usize,
    pub files: usize,
}

impl CheckReport {
    fn to_map(&self) -> serde_json::Map<String, Value> {
        let issues: Vec<Value> = self
            .issues
            .iter()
            .map(|i| {
                serde_json::json!({
                    "category": i.category,
                    "subject": i.subject,
                    "message": i.message,
                    "fixable": i.fixable,
                })
            })
            .collect();
        ztlctl_types::result_map! {
            "ok" => self.issues.is_empty(),
            "nodes" => self.nodes,
            "edges" => self.edges,
            "files" => self.files,
            "issues" => issues,
        }
    }
}

impl Vault {
    /// Run every integrity category; report only.
    pub async fn check(&self) -> ServiceResult {
        let op = "check";
        let outcome: crate::PipelineOutcome = async {
            let report = self.check_report().await?;
            let mut warnings = Vec::new();
            self.emit(
                EventKind::PostCheck,
                serde_json::json!({"issues": report.issues.len()}),
                None,
                &mut warnings,
            )
            .await;
            Ok((report.to_map(), warnings))
        }
        .await;
        respond(op, outcome)
    }

    /// Repair fixable findings. `aggressive` additionally re-indexes every
    /// edge and canonicalizes frontmatter key order.
    pub async fn check_fix(&self, aggressive: bool) -> ServiceResult {
        respond("check.fix", self.fix_inner(aggressive).await)
    }

    /// Rebuild the index from files alone, two passes.
    pub async fn rebuild(&self) -> ServiceResult {
        respond("check.rebuild", self.rebuild_inner().await)
    }

    /// Restore the index from the most recent backup.
    ///
    /// The pool is closed afterward; the process must reopen the vault (the
    /// CLI exits, matching the one-command invocation model).
    pub async fn rollback(&self) -> ServiceResult {
        respond("check.rollback", self.rollback_inner().await)
    }

    pub(crate) async fn check_report(&self) -> Result<CheckReport, EngineError> {
        let mut report = CheckReport::default();
        let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;

        // Schema integrity.
        let present: Vec<String> =
            sqlx::query("SELECT name FROM sqlite_master WHERE type IN ('table', 'view')")
                .fetch_all(&mut *conn)
                .await
                .map_err(ztlctl_store::StoreError::from)?
                .iter()
                .map(|r| r.get::<String, _>("name"))
                .collect();
        for table in schema::expected_tables() {
            if !present.iter().any(|t| t == table) {
                report.issues.push(CheckIssue {
                    category: "schema",
                    subject: table.to_string(),
                    message: format!("table '{}' is missing", table),
                    fixable: false,
                });
            }
        }

        // DB-file consistency + structural validation.
        let nodes = queries::all_nodes(&mut conn).await?;
        report.nodes = nodes.len();
        let files = content_files(self.store().paths().root());
        report.files = files.len();
        let indexed_paths: Vec<&str> = nodes.iter().map(|n| n.path.as_str()).collect();

        for node in &nodes {
            if !IdKind::for_kind(node.kind).matches(&node.id) {
                report.issues.push(CheckIssue {
                    category: "structural",
                    subject: node.id.clone(),
                    message: format!("identifier does not match the {} pattern", node.kind.as_str()),
                    fixable: false,
                });
            }
            match self.store().paths().read_to_string(Path::new(&node.path)) {
                Err(_) => report.issues.push(CheckIssue {
                    category: "db-file",
                    subject: node.id.clone(),
                    message: format!("indexed file '{}' is missing", node.path),
                    fixable: true,
                }),
                Ok(document) => match Frontmatter::parse_document(&document) {
                    Err(e) => report.issues.push(CheckIssue {
                        category: "structural",
                        subject: node.id.clone(),
                        message: format!("frontmatter does not parse: {}", e),
                        fixable: false,
                    }),
                    Ok((fm, _)) => {
                        if fm.id != node.id {
                            report.issues.push(CheckIssue {
                                category: "db-file",
                                subject: node.id.clone(),
                                message: format!(
                                    "file declares id '{}' but is indexed as '{}'",
                                    fm.id, node.id
                                ),
                                fixable: false,
                            });
                        } else if fm.title != node.title
                            || fm.status != node.status
                            || fm.archived != node.archived
                        {
                            report.issues.push(CheckIssue {
                                category: "db-file",
                                subject: node.id.clone(),
                                message: "index row is out of sync with the file".to_string(),
                                fixable: true,
                            });
                        }
                    }
                },
            }
        }
        for rel in &files {
            let rel_str = rel.display().to_string();
            if !indexed_paths.contains(&rel_str.as_str()) {
                report.issues.push(CheckIssue {
                    category: "db-file",
                    subject: rel_str,
                    message: "file is not indexed".to_string(),
                    fixable: true,
                });
            }
        }

        // Graph health.
        let edges = queries::all_edges(&mut conn).await?;
        report.edges = edges.len();
        for edge in queries::dangling_edges(&mut conn).await? {
            report.issues.push(CheckIssue {
                category: "graph",
                subject: format!("{} -> {}", edge.source_id, edge.target_id),
                message: "edge references a missing node".to_string(),
                fixable: true,
            });
        }

        // Full-text coverage.
        let fts_ids = fts::fts_ids(&mut conn).await?;
        for node in &nodes {
            if !fts_ids.contains(&node.id) {
                report.issues.push(CheckIssue {
                    category: "structural",
                    subject: node.id.clone(),
                    message: "node is missing from the full-text index".to_string(),
                    fixable: true,
                });
            }
        }
        Ok(report)
    }

    async fn fix_inner(&self, aggressive: bool) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        self.store().checkpoint().await?;
        let backup_path =
            backup::create_backup(self.store().paths(), self.config().check.backup_retention)?;

        let mut txn = VaultTxn::begin(self).await?;
        let outcome: Result<usize, EngineError> = async {
            let mut fixed = 0usize;
            let nodes = queries::all_nodes(txn.conn()).await?;
            let mut parsed: BTreeMap<String, (Frontmatter, String, String)> = BTreeMap::new();

            // Remove rows whose file is gone; resync the rest from files.
            for node in &nodes {
                let document = match self.store().paths().read_to_string(Path::new(&node.path)) {
                    Ok(document) => document,
                    Err(_) => {
                        queries::delete_node(txn.conn(), &node.id).await?;
                        queries::untag_node(txn.conn(), &node.id).await?;
                        fts::fts_delete(txn.conn(), &node.id).await?;
                        fixed += 1;
                        continue;
                    }
                };
                let (fm, body) = match Frontmatter::parse_document(&document) {
                    Ok(pair) => pair,
                    Err(e) => {
                        warnings.push(format!("'{}' does not parse, left alone: {}", node.path, e));
                        continue;
                    }
                };
                let resynced = node_from_frontmatter(&fm, &node.path, node);
                if resynced != *node {
                    queries::update_node(txn.conn(), &resynced).await?;
                    fixed += 1;
                }
                parsed.insert(node.id.clone(), (fm, body, node.path.clone()));
            }

            // Drop dangling edges.
            for edge in queries::dangling_edges(txn.conn()).await? {
                queries::delete_edge(txn.conn(), &edge.source_id, &edge.target_id, &edge.edge_type)
                    .await?;
                fixed += 1;
            }

            // Re-insert missing FTS rows.
            let fts_ids = fts::fts_ids(txn.conn()).await?;
            for (id, (fm, body, _)) in &parsed {
                if !fts_ids.contains(id) {
                    fts::fts_replace(txn.conn(), id, &fm.title, body).await?;
                    fixed += 1;
                }
            }

            if aggressive {
                // Full edge re-index from files.
                for (id, (fm, body, _)) in &parsed {
                    indexing::index_links(txn.conn(), id, fm, body, &mut warnings).await?;
                }
                // Canonical frontmatter key order; body bytes untouched.
                for (_, (fm, body, path)) in &parsed {
                    let rel = PathBuf::from(path);
                    let canonical = fm.to_document(body);
                    if self.store().paths().read_to_string(&rel)? != canonical {
                        txn.write_file(&rel, &canonical)?;
                        fixed += 1;
                    }
                }
            }
            Ok(fixed)
        }
        .await;
        let fixed = match outcome {
            Ok(fixed) => fixed,
            Err(e) => {
                txn.rollback().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        info!(fixed, aggressive, "integrity fix completed");
        self.emit(
            EventKind::PostCheck,
            serde_json::json!({"fixed": fixed, "mode": if aggressive { "aggressive" } else { "safe" }}),
            None,
            &mut warnings,
        )
        .await;
        let data = ztlctl_types::result_map! {
            "fixed" => fixed,
            "mode" => if aggressive { "aggressive" } else { "safe" },
            "backup" => backup_path.display().to_string(),
        };
        Ok((data, warnings))
    }

    async fn rebuild_inner(&self) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        self.store().checkpoint().await?;
        let backup_path =
            backup::create_backup(self.store().paths(), self.config().check.backup_retention)?;

        let mut txn = VaultTxn::begin(self).await?;
        let outcome: Result<(usize, usize), EngineError> = async {
            for table in ["edges", "node_tags", "tags", "nodes", "embeddings"] {
                sqlx::query(&format!("DELETE FROM {}", table))
                    .execute(txn.conn())
                    .await
                    .map_err(ztlctl_store::StoreError::from)?;
            }
            sqlx::query("DELETE FROM notes_fts")
                .execute(txn.conn())
                .await
                .map_err(ztlctl_store::StoreError::from)?;

            // Pass 1: nodes, tags, full-text, counters.
            let mut parsed: Vec<(Frontmatter, String, String)> = Vec::new();
            let mut counter_high: BTreeMap<&'static str, i64> = BTreeMap::new();
            for rel in content_files(self.store().paths().root()) {
                let rel_str = rel.display().to_string();
                let document = self.store().paths().read_to_string(&rel)?;
                let (fm, body) = match Frontmatter::parse_document(&document) {
                    Ok(pair) => pair,
                    Err(e) => {
                        warnings.push(format!("'{}' does not parse, skipped: {}", rel_str, e));
                        continue;
                    }
                };
                let node = node_from_file(&fm, &rel_str);
                queries::insert_node(txn.conn(), &node).await?;
                indexing::refresh_tags(txn.conn(), &node.id, &fm.tags, &mut warnings).await?;
                fts::fts_replace(txn.conn(), &node.id, &fm.title, &body).await?;
                self.vectors().index_in_txn(txn.conn(), &node.id, &fm.title, &body).await?;
                if let Some(prefix) = IdKind::for_kind(fm.kind).sequential_prefix() {
                    if let Some(value) = fm.id.rsplit('-').next().and_then(|v| v.parse::<i64>().ok())
                    {
                        let high = counter_high.entry(prefix).or_insert(0);
                        *high = (*high).max(value);
                    }
                }
                parsed.push((fm, body, rel_str));
            }
            for (prefix, high) in &counter_high {
                queries::set_counter(txn.conn(), prefix, high + 1).await?;
            }

            // Pass 2: resolve and insert every edge.
            let mut edge_count = 0usize;
            for (fm, body, _) in &parsed {
                let out_degree =
                    indexing::index_links(txn.conn(), &fm.id, fm, body, &mut warnings).await?;
                edge_count += out_degree as usize;
            }
            Ok((parsed.len(), edge_count))
        }
        .await;
        let (nodes, edges) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                txn.rollback().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        info!(nodes, edges, "index rebuilt from files");
        self.emit(
            EventKind::PostCheck,
            serde_json::json!({"rebuilt": true, "nodes": nodes, "edges": edges}),
            None,
            &mut warnings,
        )
        .await;
        let data = ztlctl_types::result_map! {
            "nodes" => nodes,
            "edges" => edges,
            "backup" => backup_path.display().to_string(),
        };
        Ok((data, warnings))
    }

    async fn rollback_inner(&self) -> crate::PipelineOutcome {
        let target = backup::latest_backup(self.store().paths())?
            .ok_or_else(|| EngineError::NotFound("no backup to restore".to_string()))?;
        // Safety copy of the state being replaced, then restore.
        self.store().checkpoint().await?;
        backup::create_backup(self.store().paths(), self.config().check.backup_retention + 1)?;
        self.store().close().await;
        std::fs::copy(&target, self.store().paths().db_path()).map_err(|source| {
            ztlctl_store::StoreError::Io {
                path: self.store().paths().db_path().display().to_string(),
                source,
            }
        })?;
        for suffix in ["-wal", "-shm"] {
            let sidecar =
                PathBuf::from(format!("{}{}", self.store().paths().db_path().display(), suffix));
            let _ = std::fs::remove_file(sidecar);
        }
        self.graph().invalidate();
        info!(backup = %target.display(), "index restored; reopen the vault to continue");
        let data = ztlctl_types::result_map! {
            "restored_from" => target.display().to_string(),
        };
        Ok((data, Vec::new()))
    }
}

/// Every content file under `notes/` and `ops/`, vault-relative.
fn content_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for space in ["notes", "ops"] {
        let dir = root.join(space);
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir).sort_by_file_name().into_iter().flatten() {
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|e| e == "md")
            {
                if let Ok(rel) = entry.path().strip_prefix(root) {
                    out.push(rel.to_path_buf());
                }
            }
        }
    }
    out
}

/// Node row derived purely from a file (rebuild pass 1).
fn node_from_file(fm: &Frontmatter, path: &str) -> NodeRow {
    NodeRow {
        id: fm.id.clone(),
        kind: fm.kind,
        subtype: fm.subtype.clone(),
        status: fm.status.clone(),
        maturity: fm.maturity,
        topic: fm.topic.clone(),
        title: fm.title.clone(),
        path: path.to_string(),
        aliases: fm.aliases.clone(),
        session: fm.session.clone(),
        archived: fm.archived,
        created: fm.created,
        modified: fm.modified,
        in_degree: 0,
        out_degree: 0,
        pagerank: 0.0,
        cluster: None,
        betweenness: 0.0,
    }
}

/// Node row resynced from a file, preserving materialized metrics.
fn node_from_frontmatter(fm: &Frontmatter, path: &str, existing: &NodeRow) -> NodeRow {
    let mut node = node_from_file(fm, path);
    node.in_degree = existing.in_degree;
    node.out_degree = existing.out_degree;
    node.pagerank = existing.pagerank;
    node.cluster = existing.cluster;
    node.betweenness = existing.betweenness;
    node
}
