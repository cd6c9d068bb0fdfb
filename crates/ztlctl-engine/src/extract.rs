//! Link extraction and wikilink resolution.
//!
//! Edges come from two layers: frontmatter `links` (typed, id-addressed) and
//! body wikilinks (`[[Target]]`, title-addressed). Wikilink resolution order
//! is **title → alias → identifier**; an ambiguous target warns and resolves
//! to nothing rather than guessing.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqliteConnection;

use ztlctl_store::queries;
use ztlctl_types::id;

use crate::EngineError;

static WIKILINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[([^\[\]]+)\]\]").unwrap());

/// Targets of every `[[...]]` wikilink in a body, in order, deduplicated.
///
/// `[[Target|label]]` contributes `Target`.
pub fn extract_wikilinks(body: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for capture in WIKILINK_RE.captures_iter(body) {
        let raw = capture[1].split('|').next().unwrap_or("").trim().to_string();
        if !raw.is_empty() && !out.contains(&raw) {
            out.push(raw);
        }
    }
    out
}

/// Outcome of resolving one wikilink target.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Exactly one node matched.
    Resolved(String),
    /// Multiple nodes matched at the same precedence level.
    Ambiguous(Vec<String>),
    /// Nothing matched.
    Unresolved,
}

/// Resolve a wikilink target against the index: title, then alias, then id.
pub async fn resolve_target(
    conn: &mut SqliteConnection,
    raw: &str,
) -> Result<Resolution, EngineError> {
    let by_title = queries::nodes_by_title(conn, raw).await?;
    match by_title.len() {
        1 => return Ok(Resolution::Resolved(by_title[0].id.clone())),
        n if n > 1 => {
            return Ok(Resolution::Ambiguous(by_title.into_iter().map(|n| n.id).collect()))
        }
        _ => {}
    }

    let by_alias = queries::nodes_with_alias(conn, raw).await?;
    match by_alias.len() {
        1 => return Ok(Resolution::Resolved(by_alias[0].id.clone())),
        n if n > 1 => {
            return Ok(Resolution::Ambiguous(by_alias.into_iter().map(|n| n.id).collect()))
        }
        _ => {}
    }

    if id::is_any_id(raw) {
        if let Some(node) = queries::get_node(conn, raw).await? {
            return Ok(Resolution::Resolved(node.id));
        }
    }
    Ok(Resolution::Unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_wikilinks_dedups_and_strips_labels() {
        let body = "See [[Attention]] and [[Attention|the survey]], plus [[ztl_ab12cd34]].";
        assert_eq!(extract_wikilinks(body), vec!["Attention".to_string(), "ztl_ab12cd34".to_string()]);
    }

    #[test]
    fn test_extract_ignores_empty_and_nested_brackets() {
        assert!(extract_wikilinks("[[ ]] and [not a link]").is_empty());
        assert_eq!(extract_wikilinks("[[a]][[b]]").len(), 2);
    }
}
