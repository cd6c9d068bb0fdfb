//! The update pipeline: **Validate → Apply → Propagate → Index → Respond**,
//! plus archive and supersession.
//!
//! Decision immutability and garden protection are enforced here: an
//! accepted decision's body only changes through supersession, and a note
//! with non-null maturity rejects engine body writes with a warning rather
//! than a hard error.

use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use ztlctl_events::EventKind;
use ztlctl_store::rows::{EdgeRow, NodeRow};
use ztlctl_store::{fts, queries};
use ztlctl_types::{
    content_model, Frontmatter, Maturity, ServiceResult, EDGE_SUPERSEDED_BY, EDGE_SUPERSEDES,
    LAYER_FRONTMATTER,
};

use crate::create::CreateRequest;
use crate::extract::{resolve_target, Resolution};
use crate::txn::VaultTxn;
use crate::{indexing, respond, EngineError, Vault};

/// Input to the update pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateRequest {
    /// Node to update.
    pub id: String,
    /// New title (the identifier never changes).
    pub title: Option<String>,
    /// Requested status transition.
    pub status: Option<String>,
    /// New maturity; `none` clears it.
    pub maturity: Option<String>,
    /// Replacement body.
    pub body: Option<String>,
    /// Tags to add.
    pub add_tags: Vec<String>,
    /// Tags to remove.
    pub remove_tags: Vec<String>,
    /// Replacement alias list.
    pub aliases: Option<Vec<String>>,
    /// Relates-links to add (identifiers or titles).
    pub add_links: Vec<String>,
    /// Extra scalar frontmatter keys to set.
    pub meta: Vec<(String, String)>,
    /// Session attribution for the emitted event.
    pub session: Option<String>,
}

impl Vault {
    /// Update one node.
    pub async fn update(&self, request: UpdateRequest) -> ServiceResult {
        respond("update", self.update_inner(request).await)
    }

    /// Archive a node: the file and its edges stay, the node leaves default
    /// query results.
    pub async fn archive(&self, id: &str, session: Option<&str>) -> ServiceResult {
        respond("archive", self.archive_inner(id, session).await)
    }

    /// Supersede an accepted decision with a new one.
    pub async fn supersede(&self, old_id: &str, replacement: CreateRequest) -> ServiceResult {
        respond("supersede", self.supersede_inner(old_id, replacement).await)
    }

    async fn update_inner(&self, request: UpdateRequest) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let mut txn = VaultTxn::begin(self).await?;
        let outcome = self.update_in_txn(&mut txn, &request, &mut warnings).await;
        let (node, rel) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                txn.rollback().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        info!(id = %node.id, status = %node.status, "updated");

        let payload = serde_json::json!({"id": node.id, "path": rel.display().to_string()});
        self.emit(EventKind::PostUpdate, payload, request.session.as_deref(), &mut warnings)
            .await;
        if node.kind == ztlctl_types::ContentKind::Log
            && request.status.as_deref() == Some("closed")
        {
            self.emit(
                EventKind::PostClose,
                serde_json::json!({"id": node.id}),
                request.session.as_deref(),
                &mut warnings,
            )
            .await;
        }

        let data = ztlctl_types::result_map! {
            "id" => node.id,
            "path" => rel.display().to_string(),
            "status" => node.status,
        };
        Ok((data, warnings))
    }

    async fn update_in_txn(
        &self,
        txn: &mut VaultTxn,
        request: &UpdateRequest,
        warnings: &mut Vec<String>,
    ) -> Result<(NodeRow, PathBuf), EngineError> {
        let mut node = queries::get_node(txn.conn(), &request.id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("node '{}' not found", request.id)))?;
        let model = content_model(node.kind, node.subtype.as_deref()).ok_or_else(|| {
            EngineError::Corrupt(format!(
                "node '{}' has unknown subtype '{}'",
                node.id,
                node.subtype.as_deref().unwrap_or("")
            ))
        })?;
        let rel = PathBuf::from(&node.path);
        let document = txn.read_file(&rel)?;
        let (mut fm, mut body) = Frontmatter::parse_document(&document)
            .map_err(|e| EngineError::Corrupt(format!("{}: {}", node.path, e)))?;

        // Validate.
        let is_decision = node.subtype.as_deref() == Some("decision");
        let mut body_change = request.body.clone();
        if body_change.is_some() {
            if is_decision && matches!(node.status.as_str(), "accepted" | "superseded") {
                return Err(EngineError::Immutable(format!(
                    "decision '{}' is {}; body changes require supersession",
                    node.id, node.status
                )));
            }
            if fm.maturity.is_some() {
                warnings.push(format!(
                    "node '{}' has maturity '{}'; body is human-owned, change rejected",
                    node.id,
                    fm.maturity.map(|m| m.as_str()).unwrap_or_default()
                ));
                body_change = None;
            }
        }
        if let Some(to) = &request.status {
            if model.machine_status {
                warnings.push(format!(
                    "status of '{}' is machine-managed; requested '{}' ignored",
                    node.id, to
                ));
            } else if is_decision && to == "superseded" {
                return Err(EngineError::Transition {
                    from: node.status.clone(),
                    to: to.clone(),
                });
            } else if !model.knows_status(to) {
                return Err(EngineError::InvalidInput(format!(
                    "unknown status '{}' for {}",
                    to,
                    node.kind.as_str()
                )));
            } else if !model.can_transition(&node.status, to) {
                return Err(EngineError::Transition { from: node.status.clone(), to: to.clone() });
            } else {
                fm.status = to.clone();
                node.status = to.clone();
            }
        }

        // Apply.
        let now = Utc::now();
        if let Some(title) = &request.title {
            fm.title = title.clone();
            node.title = title.clone();
        }
        if let Some(maturity) = &request.maturity {
            let parsed = match maturity.as_str() {
                "" | "none" | "null" => None,
                other => Some(Maturity::parse(other).ok_or_else(|| {
                    EngineError::InvalidInput(format!("unknown maturity '{}'", other))
                })?),
            };
            fm.maturity = parsed;
            node.maturity = parsed;
        }
        if let Some(aliases) = &request.aliases {
            fm.aliases = aliases.clone();
            node.aliases = aliases.clone();
        }
        for tag in &request.add_tags {
            if !fm.tags.contains(tag) {
                fm.tags.push(tag.clone());
            }
        }
        fm.tags.retain(|t| !request.remove_tags.contains(t));
        for raw in &request.add_links {
            match resolve_target(txn.conn(), raw).await? {
                Resolution::Resolved(target) => fm.add_link(indexing::relates(), &target),
                Resolution::Ambiguous(candidates) => warnings.push(format!(
                    "link '{}' is ambiguous ({}), not linked",
                    raw,
                    candidates.join(", ")
                )),
                Resolution::Unresolved => warnings.push(format!("link '{}' does not resolve", raw)),
            }
        }
        for (key, value) in &request.meta {
            fm.set_extra(key, value);
        }
        if let Some(new_body) = body_change {
            body = new_body;
        }
        fm.modified = now;
        node.modified = now;
        txn.write_file(&rel, &fm.to_document(&body))?;

        // Propagate.
        let out_degree = indexing::index_links(txn.conn(), &node.id, &fm, &body, warnings).await?;
        if let Some(status) = indexing::machine_status(model, out_degree) {
            if status != node.status {
                fm.status = status.to_string();
                node.status = status.to_string();
                txn.write_file(&rel, &fm.to_document(&body))?;
            }
        }
        if fm.links.iter().any(|(t, _)| t == EDGE_SUPERSEDES) {
            indexing::assert_no_supersession_cycle(txn.conn(), &node.id).await?;
        }

        // Index.
        node.status = fm.status.clone();
        queries::update_node(txn.conn(), &node).await?;
        indexing::refresh_tags(txn.conn(), &node.id, &fm.tags, warnings).await?;
        fts::fts_replace(txn.conn(), &node.id, &fm.title, &body).await?;
        self.vectors().index_in_txn(txn.conn(), &node.id, &fm.title, &body).await?;
        Ok((node, rel))
    }

    async fn archive_inner(&self, id: &str, session: Option<&str>) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let mut txn = VaultTxn::begin(self).await?;
        let outcome: Result<NodeRow, EngineError> = async {
            let mut node = queries::get_node(txn.conn(), id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("node '{}' not found", id)))?;
            let rel = PathBuf::from(&node.path);
            let document = txn.read_file(&rel)?;
            let (mut fm, body) = Frontmatter::parse_document(&document)
                .map_err(|e| EngineError::Corrupt(format!("{}: {}", node.path, e)))?;
            fm.archived = true;
            fm.modified = Utc::now();
            node.archived = true;
            node.modified = fm.modified;
            txn.write_file(&rel, &fm.to_document(&body))?;
            queries::update_node(txn.conn(), &node).await?;
            Ok(node)
        }
        .await;
        let node = match outcome {
            Ok(node) => node,
            Err(e) => {
                txn.rollback().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        self.emit(
            EventKind::PostUpdate,
            serde_json::json!({"id": node.id, "archived": true}),
            session,
            &mut warnings,
        )
        .await;
        Ok((ztlctl_types::result_map! {"id" => node.id, "archived" => true}, warnings))
    }

    async fn supersede_inner(
        &self,
        old_id: &str,
        mut replacement: CreateRequest,
    ) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let mut txn = VaultTxn::begin(self).await?;
        let outcome = self
            .supersede_in_txn(&mut txn, old_id, &mut replacement, &mut warnings)
            .await;
        let (new_node, old_node) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                txn.rollback().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        info!(old = %old_node.id, new = %new_node.id, "decision superseded");

        self.emit(
            EventKind::PostCreate,
            serde_json::json!({"id": new_node.id, "path": new_node.path, "title": new_node.title, "type": "note"}),
            replacement.session.as_deref(),
            &mut warnings,
        )
        .await;
        self.emit(
            EventKind::PostUpdate,
            serde_json::json!({"id": old_node.id, "status": "superseded"}),
            replacement.session.as_deref(),
            &mut warnings,
        )
        .await;

        let data = ztlctl_types::result_map! {
            "id" => new_node.id,
            "supersedes" => old_node.id,
            "path" => new_node.path,
        };
        Ok((data, warnings))
    }

    async fn supersede_in_txn(
        &self,
        txn: &mut VaultTxn,
        old_id: &str,
        replacement: &mut CreateRequest,
        warnings: &mut Vec<String>,
    ) -> Result<(NodeRow, NodeRow), EngineError> {
        let mut old_node = queries::get_node(txn.conn(), old_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("node '{}' not found", old_id)))?;
        if old_node.subtype.as_deref() != Some("decision") {
            return Err(EngineError::InvalidInput(format!(
                "node '{}' is not a decision",
                old_id
            )));
        }
        if old_node.status != "accepted" {
            return Err(EngineError::Transition {
                from: old_node.status.clone(),
                to: "superseded".to_string(),
            });
        }

        // The replacement is always a decision; inherit placement from the
        // old node unless the caller overrode it.
        replacement.kind = "note".to_string();
        replacement.subtype = Some("decision".to_string());
        if replacement.topic.is_none() {
            replacement.topic = old_node.topic.clone();
        }
        let new_node = self.create_in_txn(txn, replacement, warnings).await?;

        // Wire the supersession pair in both files and both edge rows.
        let now = Utc::now();
        let new_rel = PathBuf::from(&new_node.path);
        let new_doc = txn.read_file(&new_rel)?;
        let (mut new_fm, new_body) = Frontmatter::parse_document(&new_doc)
            .map_err(|e| EngineError::Corrupt(format!("{}: {}", new_node.path, e)))?;
        new_fm.add_link(EDGE_SUPERSEDES, old_id);
        txn.write_file(&new_rel, &new_fm.to_document(&new_body))?;
        let mut edge = EdgeRow::relates(&new_node.id, old_id, LAYER_FRONTMATTER, now);
        edge.edge_type = EDGE_SUPERSEDES.to_string();
        queries::upsert_edge(txn.conn(), &edge).await?;

        let old_rel = PathBuf::from(&old_node.path);
        let old_doc = txn.read_file(&old_rel)?;
        let (mut old_fm, old_body) = Frontmatter::parse_document(&old_doc)
            .map_err(|e| EngineError::Corrupt(format!("{}: {}", old_node.path, e)))?;
        old_fm.status = "superseded".to_string();
        old_fm.add_link(EDGE_SUPERSEDED_BY, &new_node.id);
        old_fm.modified = now;
        txn.write_file(&old_rel, &old_fm.to_document(&old_body))?;
        old_node.status = "superseded".to_string();
        old_node.modified = now;
        queries::update_node(txn.conn(), &old_node).await?;
        let mut back_edge = EdgeRow::relates(old_id, &new_node.id, LAYER_FRONTMATTER, now);
        back_edge.edge_type = EDGE_SUPERSEDED_BY.to_string();
        queries::upsert_edge(txn.conn(), &back_edge).await?;

        indexing::assert_no_supersession_cycle(txn.conn(), &new_node.id).await?;
        Ok((new_node, old_node))
    }
}
