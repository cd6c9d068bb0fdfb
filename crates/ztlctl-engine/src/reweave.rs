//! Reweave: the graph densification pass.
//!
//! Stages **Discover → Score → Filter → Present → Connect**. Four signals,
//! each normalized to `[0, 1]`: percentile-ranked BM25, tag Jaccard, inverse
//! shortest-path distance, and same-topic. Candidates below the configured
//! threshold are discarded; at most `max_links_per_note` new edges land per
//! source. Existing edges that score below threshold are marked stale, not
//! removed; `prune` removes them, `undo` replays a batch in reverse.
//!
//! Garden protection: a source with non-null maturity never receives body
//! wikilinks; frontmatter `links.relates` entries are still maintained.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use ztlctl_events::EventKind;
use ztlctl_store::rows::{EdgeRow, NodeRow};
use ztlctl_store::{fts, queries, StoreError};
use ztlctl_types::{content_model, Frontmatter, ServiceResult, EDGE_RELATES, LAYER_FRONTMATTER};

use crate::txn::VaultTxn;
use crate::{indexing, respond, EngineError, Vault};

/// One scored candidate link.
#[derive(Debug, Clone)]
struct Candidate {
    id: String,
    title: String,
    score: f64,
    signals: [f64; 4],
}

impl Vault {
    /// Run reweave over one source node, or over every note and reference.
    pub async fn reweave(&self, source: Option<&str>, dry_run: bool) -> ServiceResult {
        match source {
            Some(id) => self.reweave_node(id, dry_run).await,
            None => respond("reweave", self.reweave_all(dry_run).await),
        }
    }

    /// Reweave a single source; also the auto-reweave entry point.
    pub(crate) async fn reweave_node(&self, source: &str, dry_run: bool) -> ServiceResult {
        respond("reweave", self.reweave_one_inner(source, dry_run, None).await)
    }

    /// Remove every edge previously marked stale.
    pub async fn reweave_prune(&self) -> ServiceResult {
        respond("reweave.prune", self.prune_inner().await)
    }

    /// Reverse one reweave batch (the most recent when `batch` is `None`).
    pub async fn reweave_undo(&self, batch: Option<i64>) -> ServiceResult {
        respond("reweave.undo", self.undo_inner(batch).await)
    }

    async fn reweave_all(&self, dry_run: bool) -> crate::PipelineOutcome {
        let sources: Vec<NodeRow> = {
            let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
            queries::all_nodes(&mut conn)
                .await?
                .into_iter()
                .filter(|n| n.kind.uses_content_hash() && !n.archived)
                .collect()
        };
        let mut warnings = Vec::new();
        let mut added_total = 0u64;
        let mut per_source = Vec::new();
        for node in &sources {
            let (data, source_warnings) =
                self.reweave_one_inner(&node.id, dry_run, None).await?;
            added_total += data.get("added").and_then(Value::as_u64).unwrap_or(0);
            warnings.extend(source_warnings);
            per_source.push(Value::Object(data));
        }
        let data = ztlctl_types::result_map! {
            "sources" => sources.len(),
            "added" => added_total,
            "results" => per_source,
        };
        Ok((data, warnings))
    }

    /// Orphan-sweep entry: reweave one source at a caller-supplied threshold.
    pub(crate) async fn reweave_one_inner(
        &self,
        source: &str,
        dry_run: bool,
        threshold_override: Option<f64>,
    ) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let config = &self.config().reweave;
        let threshold = threshold_override.unwrap_or(config.min_score_threshold);

        // Discover + score happen against the committed state.
        let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
        let source_node = queries::get_node(&mut conn, source)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("node '{}' not found", source)))?;
        if !source_node.kind.uses_content_hash() {
            return Err(EngineError::InvalidInput(format!(
                "reweave applies to notes and references, '{}' is a {}",
                source,
                source_node.kind.as_str()
            )));
        }
        // Idempotence: a source untouched since its last committed batch has
        // nothing new to say; rerunning must not grow the edge set.
        if !dry_run {
            if let Some(batch_time) =
                queries::latest_reweave_for_source(&mut conn, source).await?
            {
                if source_node.modified <= batch_time {
                    let data = ztlctl_types::result_map! {
                        "source" => source,
                        "dry_run" => false,
                        "added" => 0,
                        "skipped" => "unchanged since last reweave",
                    };
                    return Ok((data, warnings));
                }
            }
        }

        let source_tags = queries::tags_for_node(&mut conn, source).await?;
        let existing: Vec<EdgeRow> = queries::edges_from(&mut conn, source).await?;
        let candidates = self
            .score_candidates(&mut conn, &source_node, &source_tags)
            .await?;
        drop(conn);

        // The cap is a degree budget per note, not per run: existing live
        // relates-edges consume it first.
        let existing_relates = existing
            .iter()
            .filter(|e| e.edge_type == EDGE_RELATES && !e.stale)
            .count();
        let allowed = config.max_links_per_note.saturating_sub(existing_relates);
        let connectable: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.score >= threshold)
            .filter(|c| !existing.iter().any(|e| e.target_id == c.id))
            .take(allowed)
            .collect();
        let newly_stale: Vec<&EdgeRow> = existing
            .iter()
            .filter(|e| e.edge_type == EDGE_RELATES && !e.stale)
            .filter(|e| {
                candidates
                    .iter()
                    .find(|c| c.id == e.target_id)
                    .map_or(true, |c| c.score < threshold)
            })
            .collect();

        let preview: Vec<Value> = connectable
            .iter()
            .map(|c| {
                serde_json::json!({
                    "target": c.id,
                    "title": c.title,
                    "score": (c.score * 1000.0).round() / 1000.0,
                    "signals": {
                        "lexical": c.signals[0],
                        "tags": c.signals[1],
                        "graph": c.signals[2],
                        "topic": c.signals[3],
                    },
                })
            })
            .collect();

        if dry_run {
            let data = ztlctl_types::result_map! {
                "source" => source,
                "dry_run" => true,
                "added" => 0,
                "candidates" => preview,
                "stale" => newly_stale.iter().map(|e| e.target_id.clone()).collect::<Vec<_>>(),
            };
            return Ok((data, warnings));
        }

        // Connect.
        let mut txn = VaultTxn::begin(self).await?;
        let outcome = self
            .connect_in_txn(&mut txn, &source_node, &connectable, &newly_stale, &mut warnings)
            .await;
        let batch = match outcome {
            Ok(batch) => batch,
            Err(e) => {
                txn.rollback().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        if !connectable.is_empty() {
            info!(source, added = connectable.len(), batch, "reweave connected");
        }

        if batch.is_some() {
            self.emit(
                EventKind::PostReweave,
                serde_json::json!({"source": source, "added": connectable.len(), "batch": batch}),
                source_node.session.as_deref(),
                &mut warnings,
            )
            .await;
        }

        let data = ztlctl_types::result_map! {
            "source" => source,
            "dry_run" => false,
            "added" => connectable.len(),
            "stale_marked" => newly_stale.len(),
            "batch" => batch,
            "candidates" => preview,
        };
        Ok((data, warnings))
    }

    async fn score_candidates(
        &self,
        conn: &mut sqlx::SqliteConnection,
        source: &NodeRow,
        source_tags: &[String],
    ) -> Result<Vec<Candidate>, EngineError> {
        let config = &self.config().reweave;
        let weights = &config.weights;
        let weight_sum =
            (weights.lexical + weights.tags + weights.graph + weights.topic).max(f64::EPSILON);

        // Discover: lexical candidates from the full-text index, seeded with
        // the source's own indexed text.
        let source_text = {
            let document = self.store().paths().read_to_string(update_rel(source))?;
            Frontmatter::parse_document(&document)
                .map(|(fm, body)| format!("{} {}", fm.title, body))
                .unwrap_or_else(|_| source.title.clone())
        };
        let lexical_hits = fts::fts_search(conn, &source_text, 50).await?;

        // Percentile normalization over the scored set: top candidate -> 1.0.
        let mut ranked: Vec<(String, f64)> = lexical_hits
            .into_iter()
            .filter(|(id, _)| id != &source.id)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let scored_n = ranked.len().max(1) as f64;
        let mut lexical: BTreeMap<String, f64> = BTreeMap::new();
        for (rank, (id, _)) in ranked.into_iter().enumerate() {
            lexical.insert(id, 1.0 - rank as f64 / scored_n);
        }

        // Candidate pool: every live note or reference. The lexical set and
        // same-topic set are subsets; scoring the rest costs little at vault
        // scale and lets the graph signal surface purely structural matches.
        let pool: Vec<NodeRow> = queries::all_nodes(conn)
            .await?
            .into_iter()
            .filter(|n| n.id != source.id && !n.archived && n.kind.uses_content_hash())
            .collect();

        let snapshot = self.graph().snapshot().await?;
        let mut candidates = Vec::new();
        for node in pool {
            let node_tags = queries::tags_for_node(conn, &node.id).await?;
            let lexical_score = lexical.get(&node.id).copied().unwrap_or(0.0);
            let tag_score = jaccard(source_tags, &node_tags);
            let graph_score = snapshot
                .distance(&source.id, &node.id)
                .filter(|d| *d > 0)
                .map_or(0.0, |d| 1.0 / d as f64);
            let topic_score =
                if source.topic.is_some() && node.topic == source.topic { 1.0 } else { 0.0 };
            let score = (weights.lexical * lexical_score
                + weights.tags * tag_score
                + weights.graph * graph_score
                + weights.topic * topic_score)
                / weight_sum;
            if score > 0.0 {
                candidates.push(Candidate {
                    id: node.id,
                    title: node.title,
                    score,
                    signals: [lexical_score, tag_score, graph_score, topic_score],
                });
            }
        }
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(candidates)
    }

    async fn connect_in_txn(
        &self,
        txn: &mut VaultTxn,
        source: &NodeRow,
        connectable: &[&Candidate],
        newly_stale: &[&EdgeRow],
        warnings: &mut Vec<String>,
    ) -> Result<Option<i64>, EngineError> {
        for edge in newly_stale {
            queries::set_edge_stale(txn.conn(), &edge.source_id, &edge.target_id, &edge.edge_type, true)
                .await?;
            warnings.push(format!(
                "edge {} -> {} scored below threshold, marked stale",
                edge.source_id, edge.target_id
            ));
        }
        if connectable.is_empty() {
            return Ok(None);
        }

        let rel = PathBuf::from(&source.path);
        let document = txn.read_file(&rel)?;
        let (mut fm, mut body) = Frontmatter::parse_document(&document)
            .map_err(|e| EngineError::Corrupt(format!("{}: {}", source.path, e)))?;
        let garden = fm.maturity.is_some();

        let now = Utc::now();
        let batch = queries::next_reweave_batch(txn.conn()).await?;
        for candidate in connectable {
            let edge = EdgeRow::relates(&source.id, &candidate.id, LAYER_FRONTMATTER, now);
            if queries::upsert_edge(txn.conn(), &edge).await? {
                queries::log_reweave(txn.conn(), batch, "add", &source.id, &candidate.id, EDGE_RELATES, now)
                    .await?;
            }
            fm.add_link(EDGE_RELATES, &candidate.id);
            if !garden {
                append_related_wikilink(&mut body, &candidate.title);
            }
        }
        // Reweave is not a user edit; `modified` stays put so file and index
        // agree and a rerun can recognize the source as unchanged.
        txn.write_file(&rel, &fm.to_document(&body))?;
        fts::fts_replace(txn.conn(), &source.id, &fm.title, &body).await?;

        // Densification can promote the note's machine status.
        if let Some(model) = content_model(source.kind, source.subtype.as_deref()) {
            let out_degree = queries::out_degree(txn.conn(), &source.id).await?;
            if let Some(status) = indexing::machine_status(model, out_degree) {
                if status != source.status {
                    fm.status = status.to_string();
                    txn.write_file(&rel, &fm.to_document(&body))?;
                    queries::set_node_status(txn.conn(), &source.id, status, source.modified).await?;
                }
            }
        }
        Ok(Some(batch))
    }

    async fn prune_inner(&self) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let mut txn = VaultTxn::begin(self).await?;
        let outcome: Result<(u64, i64), EngineError> = async {
            let stale = queries::stale_edges(txn.conn()).await?;
            if stale.is_empty() {
                return Ok((0, 0));
            }
            let now = Utc::now();
            let batch = queries::next_reweave_batch(txn.conn()).await?;
            for edge in &stale {
                self.detach_link(&mut txn, &edge.source_id, &edge.target_id).await?;
                queries::log_reweave(
                    txn.conn(), batch, "remove", &edge.source_id, &edge.target_id, &edge.edge_type, now,
                )
                .await?;
            }
            let removed = queries::delete_stale_edges(txn.conn()).await?;
            Ok((removed, batch))
        }
        .await;
        let (removed, batch) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                txn.rollback().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        if removed > 0 {
            self.emit(
                EventKind::PostReweave,
                serde_json::json!({"pruned": removed, "batch": batch}),
                None,
                &mut warnings,
            )
            .await;
        }
        Ok((ztlctl_types::result_map! {"pruned" => removed, "batch" => batch}, warnings))
    }

    async fn undo_inner(&self, batch: Option<i64>) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let mut txn = VaultTxn::begin(self).await?;
        let outcome: Result<(i64, usize), EngineError> = async {
            let batch = match batch {
                Some(batch) => batch,
                None => queries::latest_reweave_batch(txn.conn())
                    .await?
                    .ok_or_else(|| EngineError::NotFound("no reweave batch to undo".to_string()))?,
            };
            let entries = queries::reweave_batch_entries(txn.conn(), batch).await?;
            if entries.is_empty() {
                return Err(EngineError::NotFound(format!("reweave batch {} not found", batch)));
            }
            if entries.iter().all(|e| e.undone) {
                return Err(EngineError::Conflict {
                    message: format!("reweave batch {} is already undone", batch),
                    detail: serde_json::json!({"batch": batch}),
                });
            }
            let now = Utc::now();
            let mut reversed = 0usize;
            for entry in &entries {
                match entry.action.as_str() {
                    "add" => {
                        queries::delete_edge(txn.conn(), &entry.source_id, &entry.target_id, &entry.edge_type)
                            .await?;
                        self.detach_link(&mut txn, &entry.source_id, &entry.target_id).await?;
                    }
                    "remove" => {
                        let mut edge =
                            EdgeRow::relates(&entry.source_id, &entry.target_id, LAYER_FRONTMATTER, now);
                        edge.edge_type = entry.edge_type.clone();
                        queries::upsert_edge(txn.conn(), &edge).await?;
                        self.reattach_link(&mut txn, &entry.source_id, &entry.target_id).await?;
                    }
                    other => {
                        return Err(EngineError::Corrupt(format!(
                            "reweave log entry {} has unknown action '{}'",
                            entry.id, other
                        )))
                    }
                }
                reversed += 1;
            }
            queries::mark_batch_undone(txn.conn(), batch).await?;
            Ok((batch, reversed))
        }
        .await;
        let (batch, reversed) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                txn.rollback().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        info!(batch, reversed, "reweave batch undone");
        self.emit(
            EventKind::PostReweave,
            serde_json::json!({"undone": batch, "reversed": reversed}),
            None,
            &mut warnings,
        )
        .await;
        Ok((ztlctl_types::result_map! {"batch" => batch, "reversed" => reversed}, warnings))
    }

    /// Remove the frontmatter link (and any injected body bullet) backing an
    /// edge that is going away.
    async fn detach_link(
        &self,
        txn: &mut VaultTxn,
        source: &str,
        target: &str,
    ) -> Result<(), EngineError> {
        let Some(node) = queries::get_node(txn.conn(), source).await? else {
            return Ok(());
        };
        let Some(target_node) = queries::get_node(txn.conn(), target).await? else {
            return Ok(());
        };
        let rel = PathBuf::from(&node.path);
        let document = txn.read_file(&rel)?;
        let (mut fm, body) = Frontmatter::parse_document(&document)
            .map_err(|e| EngineError::Corrupt(format!("{}: {}", node.path, e)))?;
        fm.remove_link(EDGE_RELATES, target);
        let body = strip_related_wikilink(&body, &target_node.title);
        txn.write_file(&rel, &fm.to_document(&body))?;
        fts::fts_replace(txn.conn(), source, &fm.title, &body).await?;
        Ok(())
    }

    /// Restore the frontmatter link backing a re-inserted edge.
    async fn reattach_link(
        &self,
        txn: &mut VaultTxn,
        source: &str,
        target: &str,
    ) -> Result<(), EngineError> {
        let Some(node) = queries::get_node(txn.conn(), source).await? else {
            return Ok(());
        };
        let rel = PathBuf::from(&node.path);
        let document = txn.read_file(&rel)?;
        let (mut fm, body) = Frontmatter::parse_document(&document)
            .map_err(|e| EngineError::Corrupt(format!("{}: {}", node.path, e)))?;
        fm.add_link(EDGE_RELATES, target);
        txn.write_file(&rel, &fm.to_document(&body))?;
        Ok(())
    }
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.iter().filter(|t| b.contains(t)).count() as f64;
    let union = (a.len() + b.len()) as f64 - intersection;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Append `- [[Title]]` under a `## Related` section, creating it if needed.
fn append_related_wikilink(body: &mut String, title: &str) {
    let bullet = format!("- [[{}]]", title);
    if body.contains(&bullet) {
        return;
    }
    if !body.contains("## Related") {
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str("\n## Related\n");
    }
    body.push_str(&bullet);
    body.push('\n');
}

/// Drop the injected bullet for `title`, if present.
fn strip_related_wikilink(body: &str, title: &str) -> String {
    let bullet = format!("- [[{}]]", title);
    body.lines()
        .filter(|line| line.trim() != bullet)
        .collect::<Vec<_>>()
        .join("\n")
        + if body.ends_with('\n') { "\n" } else { "" }
}

fn update_rel(node: &NodeRow) -> &std::path::Path {
    std::path::Path::new(&node.path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jaccard() {
        let a = vec!["ml/attention".to_string(), "ml/nlp".to_string()];
        let b = vec!["ml/attention".to_string(), "systems/db".to_string()];
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&[], &[]), 0.0);
    }

    #[test]
    fn test_related_wikilink_injection_is_idempotent() {
        let mut body = String::from("Some text.\n");
        append_related_wikilink(&mut body, "Attention");
        append_related_wikilink(&mut body, "Attention");
        assert_eq!(body.matches("- [[Attention]]").count(), 1);
        let stripped = strip_related_wikilink(&body, "Attention");
        assert!(!stripped.contains("[[Attention]]"));
    }
}
