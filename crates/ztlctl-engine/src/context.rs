//! The agent context builder: a token-budgeted payload in layered order.
//!
//! Layers fill until the budget is exhausted:
//! 0. identity and methodology documents (always included, reserved minimum);
//! 1. operational state: session log, recent decisions, work queue;
//! 2. topic-scoped notes and references;
//! 3. graph-adjacent content one hop out from layer 2;
//! 4. background: recent activity, garden signals, structural gaps.
//!
//! Session entries resume from the latest `checkpoint`; details drop before
//! summaries; pinned entries are never dropped.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use ztlctl_store::queries;
use ztlctl_store::rows::SessionEntryRow;
use ztlctl_store::StoreError;
use ztlctl_types::{Frontmatter, ServiceResult};

use crate::session::estimate_tokens;
use crate::{respond, Vault};

/// Input to `session.context`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContextRequest {
    /// Session whose log seeds the operational layer.
    pub session: Option<String>,
    /// Topic for layer 2; omitted means the layer is skipped.
    pub topic: Option<String>,
    /// Token budget; the configured default applies when absent.
    pub budget: Option<usize>,
    /// Bypass checkpoint-based reduction.
    pub ignore_checkpoints: bool,
}

struct BudgetTracker {
    remaining: i64,
    used: i64,
}

impl BudgetTracker {
    fn new(budget: usize) -> Self {
        Self { remaining: budget as i64, used: 0 }
    }

    /// Charge `tokens`; `forced` items are charged even past exhaustion.
    fn charge(&mut self, tokens: i64, forced: bool) -> bool {
        if !forced && tokens > self.remaining {
            return false;
        }
        self.remaining -= tokens;
        self.used += tokens;
        true
    }
}

impl Vault {
    /// Build the token-budgeted agent context payload.
    pub async fn context(&self, request: ContextRequest) -> ServiceResult {
        respond("session.context", self.context_inner(request).await)
    }

    async fn context_inner(&self, request: ContextRequest) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let budget = request.budget.unwrap_or(self.config().session.context_budget);
        let mut tracker = BudgetTracker::new(budget);
        let mut layers: Vec<Value> = Vec::new();

        // Layer 0: identity documents, always present.
        let mut identity_items = Vec::new();
        for name in ["identity", "methodology"] {
            let rel = format!("self/{}.md", name);
            match self.store().paths().read_to_string(Path::new(&rel)) {
                Ok(text) => {
                    tracker.charge(estimate_tokens(&text), true);
                    identity_items.push(serde_json::json!({"path": rel, "text": text}));
                }
                Err(_) => warnings.push(format!("identity document '{}' is missing", rel)),
            }
        }
        layers.push(serde_json::json!({"layer": 0, "name": "identity", "items": identity_items}));

        // Layer 1: operational state.
        let mut operational = Vec::new();
        let mut checkpoint_id: Option<i64> = None;
        if let Some(session) = &request.session {
            let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
            let mut entries = queries::session_entries(&mut conn, session).await?;
            if !request.ignore_checkpoints {
                checkpoint_id = queries::latest_checkpoint(&mut conn, session).await?;
                if let Some(checkpoint) = checkpoint_id {
                    entries.retain(|e| e.id >= checkpoint || e.pinned);
                }
            }
            if !entries.iter().any(|e| e.pinned) {
                warnings.push(format!("session '{}' has no pinned entries", session));
            }
            operational.extend(render_session_entries(&entries, &mut tracker));

            let decisions = queries::all_nodes(&mut conn).await?;
            let mut decisions: Vec<_> = decisions
                .into_iter()
                .filter(|n| n.subtype.as_deref() == Some("decision") && !n.archived)
                .collect();
            decisions.sort_by(|a, b| b.modified.cmp(&a.modified));
            for decision in decisions.iter().take(5) {
                let line = format!("[{}] {} ({})", decision.id, decision.title, decision.status);
                if tracker.charge(estimate_tokens(&line), false) {
                    operational.push(serde_json::json!({"kind": "decision", "text": line}));
                }
            }
        }
        let work = self.work_queue().await;
        if work.ok {
            if let Some(results) = work.data.get("results").and_then(Value::as_array) {
                for task in results.iter().take(5) {
                    let line = format!(
                        "[{}] {}",
                        task["id"].as_str().unwrap_or_default(),
                        task["title"].as_str().unwrap_or_default()
                    );
                    if tracker.charge(estimate_tokens(&line), false) {
                        operational.push(serde_json::json!({"kind": "task", "text": line}));
                    }
                }
            }
        }
        layers.push(serde_json::json!({"layer": 1, "name": "operational", "items": operational}));

        // Layer 2: topic-scoped content.
        let mut topic_items = Vec::new();
        let mut topic_node_ids = Vec::new();
        if let Some(topic) = &request.topic {
            let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
            let mut nodes: Vec<_> = queries::all_nodes(&mut conn)
                .await?
                .into_iter()
                .filter(|n| n.topic.as_deref() == Some(topic.as_str()) && !n.archived)
                .collect();
            nodes.sort_by(|a, b| b.modified.cmp(&a.modified));
            for node in nodes.iter().take(10) {
                let snippet = self.node_snippet(&node.path).unwrap_or_default();
                let text = format!("[{}] {}\n{}", node.id, node.title, snippet);
                if tracker.charge(estimate_tokens(&text), false) {
                    topic_node_ids.push(node.id.clone());
                    topic_items.push(serde_json::json!({"id": node.id, "text": text}));
                }
            }
        }
        layers.push(serde_json::json!({"layer": 2, "name": "topic", "items": topic_items}));

        // Layer 3: one hop out from layer 2.
        let mut adjacent_items = Vec::new();
        if !topic_node_ids.is_empty() {
            let snapshot = self.graph().snapshot().await?;
            let mut seen = topic_node_ids.clone();
            for id in &topic_node_ids {
                for (neighbor, _) in snapshot.related(id, 1).unwrap_or_default() {
                    if seen.contains(&neighbor.id) {
                        continue;
                    }
                    let line = format!("[{}] {}", neighbor.id, neighbor.title);
                    if tracker.charge(estimate_tokens(&line), false) {
                        seen.push(neighbor.id.clone());
                        adjacent_items.push(serde_json::json!({"id": neighbor.id, "text": line}));
                    }
                }
            }
        }
        layers.push(serde_json::json!({"layer": 3, "name": "adjacent", "items": adjacent_items}));

        // Layer 4: background.
        let mut background = Vec::new();
        {
            let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
            let mut recent: Vec<_> = queries::all_nodes(&mut conn)
                .await?
                .into_iter()
                .filter(|n| !n.archived)
                .collect();
            recent.sort_by(|a, b| b.modified.cmp(&a.modified));
            for node in recent.iter().take(5) {
                let line = format!("recent: [{}] {}", node.id, node.title);
                if tracker.charge(estimate_tokens(&line), false) {
                    background.push(serde_json::json!({"kind": "recent", "text": line}));
                }
            }
            for node in recent.iter().filter(|n| n.maturity.is_some()).take(5) {
                let line = format!(
                    "garden: [{}] {} ({})",
                    node.id,
                    node.title,
                    node.maturity.map(|m| m.as_str()).unwrap_or_default()
                );
                if tracker.charge(estimate_tokens(&line), false) {
                    background.push(serde_json::json!({"kind": "garden", "text": line}));
                }
            }
        }
        let snapshot = self.graph().snapshot().await?;
        for (node, constraint) in snapshot.gaps(3) {
            let line = format!("gap: [{}] {} ({:.3})", node.id, node.title, constraint);
            if tracker.charge(estimate_tokens(&line), false) {
                background.push(serde_json::json!({"kind": "gap", "text": line}));
            }
        }
        layers.push(serde_json::json!({"layer": 4, "name": "background", "items": background}));

        let data = ztlctl_types::result_map! {
            "budget" => budget,
            "used" => tracker.used,
            "checkpoint" => checkpoint_id,
            "layers" => layers,
        };
        Ok((data, warnings))
    }

    fn node_snippet(&self, path: &str) -> Option<String> {
        let document = self.store().paths().read_to_string(Path::new(path)).ok()?;
        let (_, body) = Frontmatter::parse_document(&document).ok()?;
        let mut snippet: String = body.chars().take(400).collect();
        if body.chars().count() > 400 {
            snippet.push('…');
        }
        Some(snippet)
    }
}

/// Render session entries under budget: pinned entries are forced, summaries
/// come before any detail, details fill whatever budget remains.
fn render_session_entries(entries: &[SessionEntryRow], tracker: &mut BudgetTracker) -> Vec<Value> {
    let mut items = Vec::new();
    let mut included: Vec<&SessionEntryRow> = Vec::new();
    for entry in entries {
        let summary_tokens = estimate_tokens(&entry.summary);
        if tracker.charge(summary_tokens, entry.pinned) {
            included.push(entry);
            items.push(serde_json::json!({
                "kind": entry.entry_kind,
                "id": entry.id,
                "pinned": entry.pinned,
                "text": entry.summary,
            }));
        }
    }
    for entry in included {
        if let Some(detail) = &entry.detail {
            if tracker.charge(estimate_tokens(detail), false) {
                items.push(serde_json::json!({
                    "kind": format!("{}-detail", entry.entry_kind),
                    "id": entry.id,
                    "pinned": entry.pinned,
                    "text": detail,
                }));
            }
        }
    }
    items
}
