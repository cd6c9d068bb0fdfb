//! The query surface: structured retrieval, graph retrieval, and ranking.
//!
//! All structured operations share one filter grammar (type, subtype, tags,
//! topic, status, maturity, since, space, archived, limit, sort). Ranking
//! modes: `relevance` is BM25, `recency` decays BM25 by half-life, `graph`
//! multiplies by materialized PageRank, `hybrid` blends in cosine similarity
//! when vectors are enabled.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use ztlctl_store::rows::NodeRow;
use ztlctl_store::{fts, queries, StoreError};
use ztlctl_types::{Frontmatter, ServiceResult};

use crate::{respond, EngineError, Vault};

/// Shared filter grammar for structured retrieval.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryFilter {
    /// Content kind name.
    pub kind: Option<String>,
    /// Subtype key.
    pub subtype: Option<String>,
    /// Tags, multi-value OR.
    pub tags: Vec<String>,
    /// Topic directory.
    pub topic: Option<String>,
    /// Lifecycle status.
    pub status: Option<String>,
    /// Garden maturity.
    pub maturity: Option<String>,
    /// Only nodes modified at or after this instant (RFC3339) or within the
    /// last N days (plain integer).
    pub since: Option<String>,
    /// Vault space: `self`, `notes`, or `ops`.
    pub space: Option<String>,
    /// Include archived nodes.
    pub include_archived: bool,
    /// Result cap; the configured default applies when absent.
    pub limit: Option<usize>,
    /// Sort mode.
    pub sort: Option<String>,
}

/// Sort and ranking modes shared by `list` and `search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    /// BM25 (search) or modification time (list).
    Relevance,
    /// Half-life-decayed score.
    Recency,
    /// PageRank-weighted.
    Graph,
    /// Work-queue score.
    Priority,
    /// Lexicographic title.
    Title,
    /// Content kind, then title.
    Type,
    /// BM25 blended with cosine similarity (vectors must be enabled).
    Hybrid,
}

impl SortMode {
    /// Parse a sort-mode name; unknown names fall back to relevance.
    pub fn parse(s: Option<&str>) -> Self {
        match s.unwrap_or("relevance") {
            "recency" => SortMode::Recency,
            "graph" => SortMode::Graph,
            "priority" => SortMode::Priority,
            "title" => SortMode::Title,
            "type" => SortMode::Type,
            "hybrid" => SortMode::Hybrid,
            _ => SortMode::Relevance,
        }
    }
}

impl Vault {
    /// Full-text search with the shared filter grammar.
    pub async fn search(&self, text: &str, filter: QueryFilter) -> ServiceResult {
        respond("search", self.search_inner(text, filter).await)
    }

    /// Fetch one node with tags, outgoing edges, and backlinks.
    pub async fn get(&self, id: &str) -> ServiceResult {
        respond("get", self.get_inner(id).await)
    }

    /// List nodes matching a filter.
    pub async fn list(&self, filter: QueryFilter) -> ServiceResult {
        respond("list", self.list_inner(filter).await)
    }

    /// Open tasks ranked by priority, impact, and effort.
    pub async fn work_queue(&self) -> ServiceResult {
        respond("work_queue", self.work_queue_inner().await)
    }

    /// Decisions with their supersession chains, newest first.
    pub async fn decision_support(&self, filter: QueryFilter) -> ServiceResult {
        respond("decision_support", self.decision_support_inner(filter).await)
    }

    async fn search_inner(&self, text: &str, filter: QueryFilter) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let limit = filter.limit.unwrap_or(self.config().query.limit);
        let mode = SortMode::parse(filter.sort.as_deref());

        let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
        // Over-fetch so post-filtering still fills the page.
        let hits = fts::fts_search(&mut conn, text, (limit * 4).max(40) as i64).await?;
        let max_bm25 = hits.iter().map(|(_, s)| *s).fold(f64::MIN, f64::max).max(f64::EPSILON);

        let query_vector = if mode == SortMode::Hybrid {
            if self.vectors().enabled() {
                Some(self.vectors().embed(text))
            } else {
                warnings.push("hybrid ranking requires vectors; scoring by BM25 alone".to_string());
                None
            }
        } else {
            None
        };
        let hybrid_w = self.config().query.hybrid_weight;
        let half_life = self.config().query.half_life_days.max(f64::EPSILON);
        let now = Utc::now();

        let mut missing_embeddings = 0usize;
        let mut graph_rank_missing = true;
        let mut results: Vec<(NodeRow, f64)> = Vec::new();
        for (id, bm25) in hits {
            let Some(node) = queries::get_node(&mut conn, &id).await? else { continue };
            if !matches_filter(&node, &filter, &queries::tags_for_node(&mut conn, &id).await?)? {
                continue;
            }
            if node.pagerank > 0.0 {
                graph_rank_missing = false;
            }
            let score = match mode {
                SortMode::Recency => {
                    let age_days =
                        (now - node.modified).num_seconds().max(0) as f64 / 86_400.0;
                    bm25 * (-age_days * std::f64::consts::LN_2 / half_life).exp()
                }
                SortMode::Graph => bm25 * node.pagerank,
                _ => match &query_vector {
                    Some(query_vector) => {
                        match queries::get_embedding(&mut conn, &id).await? {
                            Some(vector) => {
                                let cosine = crate::vector::cosine(query_vector, &vector);
                                (1.0 - hybrid_w) * (bm25 / max_bm25) + hybrid_w * cosine
                            }
                            None => {
                                missing_embeddings += 1;
                                (1.0 - hybrid_w) * (bm25 / max_bm25)
                            }
                        }
                    }
                    None => bm25,
                },
            };
            results.push((node, score));
        }
        if mode == SortMode::Graph && graph_rank_missing && !results.is_empty() {
            warnings.push(
                "graph ranking found no materialized PageRank; run `graph rank` first".to_string(),
            );
        }
        if missing_embeddings > 0 {
            warnings.push(format!(
                "{} result(s) had no embedding; scored by BM25 alone",
                missing_embeddings
            ));
        }

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        let rendered: Vec<Value> = results.iter().map(|(n, s)| render_hit(n, Some(*s))).collect();
        let data = ztlctl_types::result_map! {
            "query" => text,
            "count" => rendered.len(),
            "results" => rendered,
        };
        Ok((data, warnings))
    }

    async fn get_inner(&self, id: &str) -> crate::PipelineOutcome {
        let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
        let node = queries::get_node(&mut conn, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("node '{}' not found", id)))?;
        let tags = queries::tags_for_node(&mut conn, id).await?;
        let outgoing: Vec<Value> = queries::edges_from(&mut conn, id)
            .await?
            .iter()
            .map(|e| {
                serde_json::json!({
                    "target": e.target_id, "type": e.edge_type, "layer": e.layer, "stale": e.stale,
                })
            })
            .collect();
        let backlinks: Vec<Value> = queries::all_edges(&mut conn)
            .await?
            .iter()
            .filter(|e| e.target_id == id)
            .map(|e| serde_json::json!({"source": e.source_id, "type": e.edge_type}))
            .collect();
        let body = self
            .store()
            .paths()
            .read_to_string(std::path::Path::new(&node.path))
            .ok()
            .and_then(|doc| Frontmatter::parse_document(&doc).ok().map(|(_, body)| body));

        let mut data = ztlctl_types::result_map! {
            "id" => node.id,
            "type" => node.kind.as_str(),
            "subtype" => node.subtype,
            "title" => node.title,
            "status" => node.status,
            "maturity" => node.maturity.map(|m| m.as_str()),
            "topic" => node.topic,
            "path" => node.path,
            "aliases" => node.aliases,
            "archived" => node.archived,
            "tags" => tags,
            "links" => outgoing,
            "backlinks" => backlinks,
            "created" => node.created.to_rfc3339(),
            "modified" => node.modified.to_rfc3339(),
        };
        if let Some(body) = body {
            data.insert("body".to_string(), Value::String(body));
        }
        Ok((data, Vec::new()))
    }

    async fn list_inner(&self, filter: QueryFilter) -> crate::PipelineOutcome {
        let limit = filter.limit.unwrap_or(self.config().query.limit);
        let mode = SortMode::parse(filter.sort.as_deref());
        let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
        let mut nodes = Vec::new();
        for node in queries::all_nodes(&mut conn).await? {
            let tags = queries::tags_for_node(&mut conn, &node.id).await?;
            if matches_filter(&node, &filter, &tags)? {
                nodes.push(node);
            }
        }

        match mode {
            SortMode::Title => nodes.sort_by(|a, b| a.title.cmp(&b.title)),
            SortMode::Type => {
                nodes.sort_by(|a, b| a.kind.as_str().cmp(b.kind.as_str()).then(a.title.cmp(&b.title)))
            }
            SortMode::Graph => nodes.sort_by(|a, b| {
                b.pagerank.partial_cmp(&a.pagerank).unwrap_or(std::cmp::Ordering::Equal)
            }),
            SortMode::Priority => {
                let mut scored: Vec<(NodeRow, f64)> = Vec::new();
                for node in nodes {
                    let score = self.task_score(&node).unwrap_or(f64::MIN);
                    scored.push((node, score));
                }
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                nodes = scored.into_iter().map(|(n, _)| n).collect();
            }
            _ => nodes.sort_by(|a, b| b.modified.cmp(&a.modified)),
        }
        nodes.truncate(limit);

        let rendered: Vec<Value> = nodes.iter().map(|n| render_hit(n, None)).collect();
        let data = ztlctl_types::result_map! {
            "count" => rendered.len(),
            "results" => rendered,
        };
        Ok((data, Vec::new()))
    }

    async fn work_queue_inner(&self) -> crate::PipelineOutcome {
        let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
        let tasks: Vec<NodeRow> = queries::all_nodes(&mut conn)
            .await?
            .into_iter()
            .filter(|n| {
                n.kind == ztlctl_types::ContentKind::Task
                    && !n.archived
                    && matches!(n.status.as_str(), "inbox" | "active" | "blocked")
            })
            .collect();
        drop(conn);

        // Scored and sorted in memory after the filter.
        let mut scored: Vec<(NodeRow, f64)> = Vec::new();
        for task in tasks {
            let score = self.task_score(&task).unwrap_or(0.0);
            scored.push((task, score));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let rendered: Vec<Value> = scored.iter().map(|(n, score)| render_hit(n, Some(*score))).collect();
        let data = ztlctl_types::result_map! {
            "count" => rendered.len(),
            "results" => rendered,
        };
        Ok((data, Vec::new()))
    }

    async fn decision_support_inner(&self, filter: QueryFilter) -> crate::PipelineOutcome {
        let limit = filter.limit.unwrap_or(self.config().query.limit);
        let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
        let mut decisions: Vec<NodeRow> = queries::all_nodes(&mut conn)
            .await?
            .into_iter()
            .filter(|n| n.subtype.as_deref() == Some("decision"))
            .filter(|n| filter.include_archived || !n.archived)
            .filter(|n| filter.status.as_deref().map_or(true, |s| n.status == s))
            .collect();
        decisions.sort_by(|a, b| b.modified.cmp(&a.modified));
        decisions.truncate(limit);

        let mut rendered = Vec::new();
        for decision in &decisions {
            let edges = queries::edges_from(&mut conn, &decision.id).await?;
            let supersedes: Vec<String> = edges
                .iter()
                .filter(|e| e.edge_type == ztlctl_types::EDGE_SUPERSEDES)
                .map(|e| e.target_id.clone())
                .collect();
            let superseded_by: Vec<String> = edges
                .iter()
                .filter(|e| e.edge_type == ztlctl_types::EDGE_SUPERSEDED_BY)
                .map(|e| e.target_id.clone())
                .collect();
            rendered.push(serde_json::json!({
                "id": decision.id,
                "title": decision.title,
                "status": decision.status,
                "supersedes": supersedes,
                "superseded_by": superseded_by,
                "modified": decision.modified.to_rfc3339(),
            }));
        }
        let data = ztlctl_types::result_map! {
            "count" => rendered.len(),
            "results" => rendered,
        };
        Ok((data, Vec::new()))
    }

    /// Work-queue score from the task file's priority/impact/effort keys.
    ///
    /// high/high/low scores 10.5; unset attributes default to medium. Effort
    /// is a drag: low effort adds nothing, each step above low costs 0.5.
    fn task_score(&self, node: &NodeRow) -> Option<f64> {
        if node.kind != ztlctl_types::ContentKind::Task {
            return None;
        }
        let document = self
            .store()
            .paths()
            .read_to_string(std::path::Path::new(&node.path))
            .ok()?;
        let (fm, _) = Frontmatter::parse_document(&document).ok()?;
        let priority = level_weight(fm.extra_value("priority").as_deref());
        let impact = level_weight(fm.extra_value("impact").as_deref());
        let effort = level_weight(fm.extra_value("effort").as_deref());
        Some(priority * 2.0 + impact * 1.5 - (effort - 1.0) / 2.0)
    }

    //─────────────────────────────
    //  Graph retrieval
    //─────────────────────────────

    /// Spreading activation around a seed node.
    pub async fn related(&self, id: &str, depth: Option<usize>) -> ServiceResult {
        let op = "graph.related";
        let depth = depth.unwrap_or(self.config().graph.related_depth);
        let outcome: crate::PipelineOutcome = async {
            let snapshot = self.graph().snapshot().await?;
            let hits = snapshot
                .related(id, depth)
                .ok_or_else(|| EngineError::NotFound(format!("node '{}' not found", id)))?;
            let results: Vec<Value> = hits
                .iter()
                .map(|(n, score)| {
                    serde_json::json!({"id": n.id, "title": n.title, "type": n.kind.as_str(), "score": score})
                })
                .collect();
            Ok((ztlctl_types::result_map! {"seed" => id, "results" => results}, Vec::new()))
        }
        .await;
        respond(op, outcome)
    }

    /// Community detection over the whole graph.
    pub async fn themes(&self) -> ServiceResult {
        let op = "graph.themes";
        let outcome: crate::PipelineOutcome = async {
            let snapshot = self.graph().snapshot().await?;
            let (groups, warning) = snapshot.themes(&self.config().graph.community);
            let results: Vec<Value> = groups
                .iter()
                .map(|group| {
                    Value::Array(
                        group
                            .iter()
                            .map(|n| serde_json::json!({"id": n.id, "title": n.title}))
                            .collect(),
                    )
                })
                .collect();
            let warnings = warning.into_iter().collect();
            Ok((ztlctl_types::result_map! {"themes" => results}, warnings))
        }
        .await;
        respond(op, outcome)
    }

    /// PageRank top-k; materializes metrics onto the nodes table.
    pub async fn rank(&self, top_k: Option<usize>) -> ServiceResult {
        let op = "graph.rank";
        respond(op, self.rank_inner(top_k).await)
    }

    async fn rank_inner(&self, top_k: Option<usize>) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let top_k = top_k.unwrap_or(self.config().query.limit);
        let snapshot = self.graph().snapshot().await?;
        let (metrics, warning) = snapshot.materialize_metrics(&self.config().graph.community);
        warnings.extend(warning);

        let mut txn = crate::txn::VaultTxn::begin(self).await?;
        for m in &metrics {
            queries::set_node_metrics(
                txn.conn(), &m.id, m.in_degree, m.out_degree, m.pagerank, m.cluster, m.betweenness,
            )
            .await?;
        }
        txn.commit().await?;

        let ranked = snapshot.rank();
        let results: Vec<Value> = ranked
            .iter()
            .take(top_k)
            .map(|(n, s)| serde_json::json!({"id": n.id, "title": n.title, "score": s}))
            .collect();
        Ok((
            ztlctl_types::result_map! {"materialized" => metrics.len(), "results" => results},
            warnings,
        ))
    }

    /// Shortest undirected path between two nodes.
    pub async fn path(&self, from: &str, to: &str) -> ServiceResult {
        let op = "graph.path";
        let outcome: crate::PipelineOutcome = async {
            let snapshot = self.graph().snapshot().await?;
            if !snapshot.contains(from) {
                return Err(EngineError::NotFound(format!("node '{}' not found", from)));
            }
            if !snapshot.contains(to) {
                return Err(EngineError::NotFound(format!("node '{}' not found", to)));
            }
            let path = snapshot.path(from, to);
            let results: Vec<Value> = path
                .map(|nodes| {
                    nodes
                        .iter()
                        .map(|n| serde_json::json!({"id": n.id, "title": n.title}))
                        .collect()
                })
                .unwrap_or_default();
            let connected = !results.is_empty();
            Ok((
                ztlctl_types::result_map! {"from" => from, "to" => to, "connected" => connected, "path" => results},
                Vec::new(),
            ))
        }
        .await;
        respond(op, outcome)
    }

    /// Structural holes: lowest-constraint nodes.
    pub async fn gaps(&self, top_k: Option<usize>) -> ServiceResult {
        let op = "graph.gaps";
        let top_k = top_k.unwrap_or(self.config().query.limit);
        let outcome: crate::PipelineOutcome = async {
            let snapshot = self.graph().snapshot().await?;
            let results: Vec<Value> = snapshot
                .gaps(top_k)
                .iter()
                .map(|(n, c)| serde_json::json!({"id": n.id, "title": n.title, "constraint": c}))
                .collect();
            Ok((ztlctl_types::result_map! {"results" => results}, Vec::new()))
        }
        .await;
        respond(op, outcome)
    }

    /// Bridges: highest-betweenness nodes.
    pub async fn bridges(&self, top_k: Option<usize>) -> ServiceResult {
        let op = "graph.bridges";
        let top_k = top_k.unwrap_or(self.config().query.limit);
        let outcome: crate::PipelineOutcome = async {
            let snapshot = self.graph().snapshot().await?;
            let results: Vec<Value> = snapshot
                .bridges(top_k)
                .iter()
                .map(|(n, s)| serde_json::json!({"id": n.id, "title": n.title, "betweenness": s}))
                .collect();
            Ok((ztlctl_types::result_map! {"results" => results}, Vec::new()))
        }
        .await;
        respond(op, outcome)
    }
}

fn render_hit(node: &NodeRow, score: Option<f64>) -> Value {
    let mut hit = serde_json::json!({
        "id": node.id,
        "title": node.title,
        "type": node.kind.as_str(),
        "status": node.status,
        "topic": node.topic,
        "path": node.path,
        "modified": node.modified.to_rfc3339(),
    });
    if let (Some(score), Value::Object(map)) = (score, &mut hit) {
        map.insert("score".to_string(), serde_json::json!(score));
    }
    hit
}

fn matches_filter(
    node: &NodeRow,
    filter: &QueryFilter,
    tags: &[String],
) -> Result<bool, EngineError> {
    if node.archived && !filter.include_archived {
        return Ok(false);
    }
    if let Some(kind) = &filter.kind {
        if node.kind.as_str() != kind {
            return Ok(false);
        }
    }
    if let Some(subtype) = &filter.subtype {
        if node.subtype.as_deref() != Some(subtype.as_str()) {
            return Ok(false);
        }
    }
    if let Some(topic) = &filter.topic {
        if node.topic.as_deref() != Some(topic.as_str()) {
            return Ok(false);
        }
    }
    if let Some(status) = &filter.status {
        if &node.status != status {
            return Ok(false);
        }
    }
    if let Some(maturity) = &filter.maturity {
        if node.maturity.map(|m| m.as_str().to_string()).as_deref() != Some(maturity.as_str()) {
            return Ok(false);
        }
    }
    if let Some(space) = &filter.space {
        if !node.path.starts_with(space.trim_end_matches('/')) {
            return Ok(false);
        }
    }
    if !filter.tags.is_empty() && !filter.tags.iter().any(|t| tags.contains(t)) {
        return Ok(false);
    }
    if let Some(since) = &filter.since {
        let cutoff = parse_since(since)?;
        if node.modified < cutoff {
            return Ok(false);
        }
    }
    Ok(true)
}

fn parse_since(since: &str) -> Result<DateTime<Utc>, EngineError> {
    if let Ok(days) = since.parse::<i64>() {
        return Ok(Utc::now() - Duration::days(days));
    }
    DateTime::parse_from_rfc3339(since)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            EngineError::InvalidInput(format!(
                "'{}' is not a day count or RFC3339 timestamp",
                since
            ))
        })
}

fn level_weight(level: Option<&str>) -> f64 {
    match level.unwrap_or("medium") {
        "high" => 3.0,
        "low" => 1.0,
        _ => 2.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_queue_scores_match_contract() {
        // priority*2 + impact*1.5 - (effort-1)/2 with high=3, medium=2, low=1.
        let score = |p: &str, i: &str, e: &str| {
            level_weight(Some(p)) * 2.0 + level_weight(Some(i)) * 1.5
                - (level_weight(Some(e)) - 1.0) / 2.0
        };
        assert_eq!(score("high", "high", "low"), 10.5);
        assert_eq!(score("medium", "medium", "medium"), 6.5);
        assert_eq!(score("low", "low", "high"), 2.5);
    }

    #[test]
    fn test_sort_mode_parse_defaults_to_relevance() {
        assert_eq!(SortMode::parse(None), SortMode::Relevance);
        assert_eq!(SortMode::parse(Some("graph")), SortMode::Graph);
        assert_eq!(SortMode::parse(Some("nonsense")), SortMode::Relevance);
    }

    #[test]
    fn test_parse_since_accepts_days_and_rfc3339() {
        assert!(parse_since("7").is_ok());
        assert!(parse_since("2026-07-01T00:00:00Z").is_ok());
        assert!(parse_since("yesterday").is_err());
    }
}
