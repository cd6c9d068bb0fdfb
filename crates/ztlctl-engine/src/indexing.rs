//! Shared index-refresh steps used by the create and update pipelines and by
//! the rebuild pass: edge extraction, tag registration, machine status.

use chrono::Utc;
use sqlx::SqliteConnection;

use ztlctl_store::rows::EdgeRow;
use ztlctl_store::queries;
use ztlctl_types::{
    note_status_for_degree, ContentModel, Frontmatter, EDGE_RELATES, LAYER_BODY, LAYER_FRONTMATTER,
};

use crate::extract::{extract_wikilinks, resolve_target, Resolution};
use crate::EngineError;

/// Re-extract and upsert every edge of `source`: frontmatter links first,
/// then body wikilinks. Returns the resulting outgoing degree.
///
/// Link targets that do not resolve are warnings, never errors: a vault must
/// stay writable while a referenced note is still unwritten.
pub(crate) async fn index_links(
    conn: &mut SqliteConnection,
    source_id: &str,
    fm: &Frontmatter,
    body: &str,
    warnings: &mut Vec<String>,
) -> Result<i64, EngineError> {
    queries::delete_edges_from(conn, source_id).await?;
    let now = Utc::now();

    for (edge_type, targets) in &fm.links {
        for target in targets {
            if target == source_id {
                continue;
            }
            if queries::get_node(conn, target).await?.is_none() {
                warnings.push(format!("link target '{}' not found", target));
                continue;
            }
            let mut edge = EdgeRow::relates(source_id, target, LAYER_FRONTMATTER, now);
            edge.edge_type = edge_type.clone();
            queries::upsert_edge(conn, &edge).await?;
        }
    }

    for raw in extract_wikilinks(body) {
        match resolve_target(conn, &raw).await? {
            Resolution::Resolved(target) => {
                if target != source_id {
                    let edge = EdgeRow::relates(source_id, &target, LAYER_BODY, now);
                    queries::upsert_edge(conn, &edge).await?;
                }
            }
            Resolution::Ambiguous(candidates) => {
                warnings.push(format!(
                    "wikilink '[[{}]]' is ambiguous ({}), not linked",
                    raw,
                    candidates.join(", ")
                ));
            }
            Resolution::Unresolved => {
                warnings.push(format!("wikilink '[[{}]]' does not resolve", raw));
            }
        }
    }

    queries::out_degree(conn, source_id).await.map_err(Into::into)
}

/// Refresh a node's tag set, warning on unscoped tags (`domain/scope` is the
/// convention, flat tags are accepted).
pub(crate) async fn refresh_tags(
    conn: &mut SqliteConnection,
    node_id: &str,
    tags: &[String],
    warnings: &mut Vec<String>,
) -> Result<(), EngineError> {
    queries::untag_node(conn, node_id).await?;
    let now = Utc::now();
    for tag in tags {
        if !tag.contains('/') {
            warnings.push(format!("tag '{}' has no scope (expected domain/scope)", tag));
        }
        queries::register_tag(conn, tag, now).await?;
        queries::tag_node(conn, node_id, tag).await?;
    }
    Ok(())
}

/// New machine status for a node, when its model computes one.
pub(crate) fn machine_status(model: &ContentModel, out_degree: i64) -> Option<&'static str> {
    model
        .machine_status
        .then(|| note_status_for_degree(out_degree.max(0) as usize))
}

/// Refuse supersession cycles: following `supersedes` edges from `start`
/// must never return to it.
pub(crate) async fn assert_no_supersession_cycle(
    conn: &mut SqliteConnection,
    start: &str,
) -> Result<(), EngineError> {
    let mut current = start.to_string();
    let mut hops = 0usize;
    loop {
        let edges = queries::edges_from(conn, &current).await?;
        let next = edges
            .into_iter()
            .find(|e| e.edge_type == ztlctl_types::EDGE_SUPERSEDES)
            .map(|e| e.target_id);
        match next {
            Some(target) if target == start => {
                return Err(EngineError::Conflict {
                    message: format!("supersession cycle through '{}'", start),
                    detail: serde_json::json!({"node": start}),
                });
            }
            Some(target) => {
                current = target;
                hops += 1;
                if hops > 1024 {
                    return Err(EngineError::Corrupt(
                        "supersession chain exceeds 1024 hops".to_string(),
                    ));
                }
            }
            None => return Ok(()),
        }
    }
}

/// Default relates-edge type helper shared by the pipelines.
pub(crate) fn relates() -> &'static str {
    EDGE_RELATES
}
