//! The create pipeline: **Validate → Generate → Persist → Index → Respond**.
//!
//! All five stages run inside one vault transaction. Identifier minting is
//! content-hash for notes and references (collisions are explicit conflicts
//! carrying the existing node) and sequential for logs and tasks (counters
//! consumed in-transaction, gaps never reused).

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use ztlctl_events::EventKind;
use ztlctl_store::rows::NodeRow;
use ztlctl_store::{fts, queries};
use ztlctl_types::{
    content_model, id, ContentKind, ContentModel, Frontmatter, ServiceResult,
};

use crate::extract::{resolve_target, Resolution};
use crate::txn::VaultTxn;
use crate::{indexing, respond, EngineError, Vault};

/// Input to the create pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    /// Content kind name: note, reference, log, task.
    pub kind: String,
    /// Optional subtype (knowledge, decision, paper, ...).
    pub subtype: Option<String>,
    /// Human title; identity for notes and references.
    pub title: String,
    /// Topic directory for notes and references.
    pub topic: Option<String>,
    /// Scoped tags.
    pub tags: Vec<String>,
    /// Alias list.
    pub aliases: Vec<String>,
    /// Full body; overrides the section template when given.
    pub body: Option<String>,
    /// Named template sections.
    pub sections: Vec<(String, String)>,
    /// Initial relates-links: identifiers or titles.
    pub links: Vec<String>,
    /// Owning session.
    pub session: Option<String>,
    /// Extra scalar frontmatter keys (priority, impact, effort, url, ...).
    pub meta: Vec<(String, String)>,
}

/// Batch semantics for `create_batch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Any failure rolls back the whole batch.
    AllOrNothing,
    /// Per-item transactions, aggregate report.
    Partial,
}

impl Vault {
    /// Create one content item.
    pub async fn create(&self, request: CreateRequest) -> ServiceResult {
        respond("create", self.create_inner(request).await)
    }

    /// Create several items with the chosen batch semantics.
    pub async fn create_batch(&self, items: Vec<CreateRequest>, mode: BatchMode) -> ServiceResult {
        let op = "create.batch";
        match mode {
            BatchMode::AllOrNothing => respond(op, self.create_batch_atomic(items).await),
            BatchMode::Partial => {
                let mut results = Vec::new();
                let mut failed = 0usize;
                for item in items {
                    let result = self.create(item).await;
                    if !result.ok {
                        failed += 1;
                    }
                    results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
                }
                let data = ztlctl_types::result_map! {
                    "succeeded" => results.len() - failed,
                    "failed" => failed,
                    "items" => results,
                };
                if failed == 0 {
                    ServiceResult::ok(op, data)
                } else {
                    ServiceResult::fail(
                        op,
                        ztlctl_types::ErrorCode::InvalidInput,
                        format!("{} of {} items failed", failed, data["items"].as_array().map_or(0, |a| a.len())),
                        Value::Object(data),
                    )
                }
            }
        }
    }

    async fn create_inner(&self, request: CreateRequest) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let mut txn = VaultTxn::begin(self).await?;
        let created = match self.create_in_txn(&mut txn, &request, &mut warnings).await {
            Ok(created) => created,
            Err(e) => {
                txn.rollback().await;
                return Err(e);
            }
        };
        txn.commit().await?;
        info!(id = %created.id, kind = %created.kind.as_str(), "created");

        let payload = serde_json::json!({
            "id": created.id,
            "path": created.path,
            "title": created.title,
            "type": created.kind.as_str(),
        });
        self.emit(EventKind::PostCreate, payload.clone(), request.session.as_deref(), &mut warnings)
            .await;

        // Automatic densification for knowledge content, unless configured
        // off. Runs in its own transaction after the create committed.
        if created.kind.uses_content_hash() && self.config().reweave.auto {
            let reweave = self.reweave_node(&created.id, false).await;
            warnings.extend(reweave.warnings.clone());
        }

        let data = ztlctl_types::result_map! {
            "id" => created.id,
            "path" => created.path,
            "title" => created.title,
            "type" => created.kind.as_str(),
        };
        Ok((data, warnings))
    }

    async fn create_batch_atomic(&self, items: Vec<CreateRequest>) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let mut txn = VaultTxn::begin(self).await?;
        let mut created = Vec::new();
        for (index, item) in items.iter().enumerate() {
            match self.create_in_txn(&mut txn, item, &mut warnings).await {
                Ok(node) => created.push(node),
                Err(e) => {
                    txn.rollback().await;
                    return Err(match e {
                        EngineError::Conflict { message, detail } => EngineError::Conflict {
                            message: format!("item {}: {}", index, message),
                            detail,
                        },
                        other => EngineError::InvalidInput(format!("item {}: {}", index, other)),
                    });
                }
            }
        }
        txn.commit().await?;
        for node in &created {
            let payload = serde_json::json!({
                "id": node.id, "path": node.path, "title": node.title, "type": node.kind.as_str(),
            });
            self.emit(EventKind::PostCreate, payload, node.session.as_deref(), &mut warnings).await;
        }
        let data = ztlctl_types::result_map! {
            "created" => created.iter().map(|n| n.id.clone()).collect::<Vec<_>>(),
            "count" => created.len(),
        };
        Ok((data, warnings))
    }

    /// Stages Validate through Index for one item, on the caller's
    /// transaction. Used by single create, atomic batches, and supersession.
    pub(crate) async fn create_in_txn(
        &self,
        txn: &mut VaultTxn,
        request: &CreateRequest,
        warnings: &mut Vec<String>,
    ) -> Result<NodeRow, EngineError> {
        // Validate.
        let kind = ContentKind::parse(&request.kind)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown content type '{}'", request.kind)))?;
        let model = content_model(kind, request.subtype.as_deref()).ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "unknown subtype '{}' for type '{}'",
                request.subtype.as_deref().unwrap_or(""),
                kind.as_str()
            ))
        })?;
        if request.title.trim().is_empty() {
            return Err(EngineError::InvalidInput("title must not be empty".to_string()));
        }
        validate_body(model, request)?;

        // Generate.
        let now = Utc::now();
        let node_id = match kind {
            ContentKind::Note | ContentKind::Reference => {
                let Some(minted) = id::mint_content_hash(kind, &request.title) else {
                    return Err(EngineError::InvalidInput(format!(
                        "cannot mint a content-hash id for '{}'",
                        kind.as_str()
                    )));
                };
                if let Some(existing) = queries::get_node(txn.conn(), &minted).await? {
                    return Err(EngineError::Conflict {
                        message: format!(
                            "title '{}' collides with existing {}",
                            request.title, existing.id
                        ),
                        detail: serde_json::json!({
                            "existing_id": existing.id,
                            "existing_title": existing.title,
                        }),
                    });
                }
                minted
            }
            ContentKind::Log | ContentKind::Task => {
                let Some(prefix) = id::IdKind::for_kind(kind).sequential_prefix() else {
                    return Err(EngineError::InvalidInput(format!(
                        "'{}' has no sequential id prefix",
                        kind.as_str()
                    )));
                };
                id::sequential_id(prefix, queries::next_counter(txn.conn(), prefix).await?)
            }
        };

        let topic = match kind {
            ContentKind::Note | ContentKind::Reference => {
                Some(request.topic.clone().unwrap_or_else(|| "inbox".to_string()))
            }
            _ => None,
        };

        let mut fm = Frontmatter {
            id: node_id.clone(),
            kind,
            subtype: request.subtype.clone(),
            status: model.initial_status().to_string(),
            maturity: None,
            title: request.title.clone(),
            session: request.session.clone(),
            tags: request.tags.clone(),
            aliases: request.aliases.clone(),
            topic: topic.clone(),
            links: Vec::new(),
            created: now,
            modified: now,
            archived: false,
            preserved: Vec::new(),
        };
        for (key, value) in &request.meta {
            fm.set_extra(key, value);
        }
        for raw in &request.links {
            match resolve_target(txn.conn(), raw).await? {
                Resolution::Resolved(target) => fm.add_link(indexing::relates(), &target),
                Resolution::Ambiguous(candidates) => warnings.push(format!(
                    "link '{}' is ambiguous ({}), not linked",
                    raw,
                    candidates.join(", ")
                )),
                Resolution::Unresolved => {
                    warnings.push(format!("link '{}' does not resolve", raw))
                }
            }
        }
        let body = match &request.body {
            Some(body) => body.clone(),
            None => model.render_body(&request.sections),
        };

        // Persist.
        let rel = txn
            .paths()
            .content_rel_path(kind, topic.as_deref(), &node_id, &request.title);
        if txn.file_exists(&rel) {
            return Err(EngineError::Conflict {
                message: format!("path '{}' already exists", rel.display()),
                detail: serde_json::json!({"path": rel.display().to_string()}),
            });
        }
        txn.write_file(&rel, &fm.to_document(&body))?;

        // Index.
        let mut node = NodeRow {
            id: node_id.clone(),
            kind,
            subtype: request.subtype.clone(),
            status: fm.status.clone(),
            maturity: None,
            topic,
            title: request.title.clone(),
            path: rel.display().to_string(),
            aliases: request.aliases.clone(),
            session: request.session.clone(),
            archived: false,
            created: now,
            modified: now,
            in_degree: 0,
            out_degree: 0,
            pagerank: 0.0,
            cluster: None,
            betweenness: 0.0,
        };
        queries::insert_node(txn.conn(), &node).await?;
        let out_degree = indexing::index_links(txn.conn(), &node_id, &fm, &body, warnings).await?;
        if let Some(status) = indexing::machine_status(model, out_degree) {
            if status != node.status {
                node.status = status.to_string();
                fm.status = status.to_string();
                queries::set_node_status(txn.conn(), &node_id, status, now).await?;
                txn.write_file(&rel, &fm.to_document(&body))?;
            }
        }
        indexing::refresh_tags(txn.conn(), &node_id, &request.tags, warnings).await?;
        fts::fts_replace(txn.conn(), &node_id, &request.title, &body).await?;
        self.vectors()
            .index_in_txn(txn.conn(), &node_id, &request.title, &body)
            .await?;
        Ok(node)
    }
}

fn validate_body(model: &ContentModel, request: &CreateRequest) -> Result<(), EngineError> {
    if let Some(body) = &request.body {
        for section in model.required_sections {
            let header = format!("## {}", section);
            if !body.contains(&header) {
                return Err(EngineError::InvalidInput(format!(
                    "body is missing required section '{}'",
                    section
                )));
            }
        }
    }
    Ok(())
}
