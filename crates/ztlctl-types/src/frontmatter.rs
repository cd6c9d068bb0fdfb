//! Frontmatter parsing and serialization with round-trip preservation.
//!
//! Known keys are strongly typed; unknown keys and `#` comment lines are kept
//! verbatim, anchored to the preceding known key, and re-emitted in place on
//! serialization. Canonical key order is `id, type, subtype, status,
//! maturity, title, session, tags, aliases, topic, links, created, modified`.
//!
//! Files on disk are authoritative, so a parse/serialize cycle of a file the
//! engine did not otherwise touch must not lose information a human (or a
//! third-party tool) put there.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;
use thiserror::Error;

use crate::model::{ContentKind, Maturity};

static KEY_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_-]*):(.*)$").unwrap());

/// Canonical top-level key order. `archived` sits after the canonical
/// thirteen so archive state survives a rebuild from files alone.
const KEY_ORDER: &[&str] = &[
    "id", "type", "subtype", "status", "maturity", "title", "session", "tags", "aliases",
    "topic", "links", "created", "modified", "archived",
];

/// Errors produced while reading or writing a frontmatter block.
#[derive(Debug, Error)]
pub enum FrontmatterError {
    /// The document does not start with a `---` fenced block.
    #[error("document has no frontmatter block")]
    MissingBlock,

    /// A required key is absent.
    #[error("frontmatter is missing required key '{0}'")]
    MissingKey(&'static str),

    /// A key holds a value of the wrong shape.
    #[error("frontmatter key '{key}' is invalid: {reason}")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Underlying YAML parse failure.
    #[error("frontmatter YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A verbatim line run (comment or unknown-key block) anchored to a known key.
#[derive(Debug, Clone, PartialEq)]
pub struct Preserved {
    /// Known key this block followed, `None` when it preceded every key.
    pub anchor: Option<String>,
    /// Raw lines, emitted untouched.
    pub raw: String,
}

/// Typed frontmatter for one vault file.
#[derive(Debug, Clone, PartialEq)]
pub struct Frontmatter {
    /// Permanent identifier.
    pub id: String,
    /// Content kind (frontmatter key `type`).
    pub kind: ContentKind,
    /// Optional subtype key.
    pub subtype: Option<String>,
    /// Current lifecycle status.
    pub status: String,
    /// Garden maturity; non-null locks body bytes against the engine.
    pub maturity: Option<Maturity>,
    /// Human title.
    pub title: String,
    /// Owning session reference.
    pub session: Option<String>,
    /// Scoped tags (`domain/scope`).
    pub tags: Vec<String>,
    /// Ordered alias list.
    pub aliases: Vec<String>,
    /// Topic directory under `notes/`.
    pub topic: Option<String>,
    /// Frontmatter-layer links: ordered `edge_type -> target ids`.
    pub links: Vec<(String, Vec<String>)>,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified: DateTime<Utc>,
    /// Archived flag; archived nodes keep their file and edges.
    pub archived: bool,
    /// Unknown keys and comments preserved in place.
    pub preserved: Vec<Preserved>,
}

impl Frontmatter {
    /// Split a document into its frontmatter block and body.
    ///
    /// The body is returned exactly as found, without the leading blank line
    /// separating it from the closing fence.
    pub fn parse_document(text: &str) -> Result<(Self, String), FrontmatterError> {
        let rest = text.strip_prefix("---\n").ok_or(FrontmatterError::MissingBlock)?;
        let end = rest
            .lines()
            .scan(0usize, |offset, line| {
                let start = *offset;
                *offset += line.len() + 1;
                Some((start, line))
            })
            .find(|(_, line)| *line == "---")
            .map(|(start, _)| start)
            .ok_or(FrontmatterError::MissingBlock)?;
        let block = &rest[..end];
        let body = rest[end + 4.min(rest.len() - end)..].to_string();
        let body = body.strip_prefix('\n').unwrap_or(&body).to_string();
        let fm = Self::parse_block(block)?;
        Ok((fm, body))
    }

    /// Parse the inside of a `---` fenced block.
    pub fn parse_block(block: &str) -> Result<Self, FrontmatterError> {
        // First pass: group lines into top-level key blocks, comments, and
        // continuations. Unknown material is kept verbatim.
        let mut entries: Vec<(Option<String>, String)> = Vec::new(); // (key, raw block)
        let mut anchors: Vec<Preserved> = Vec::new();
        let mut last_known: Option<String> = None;
        let mut current: Option<(Option<String>, String)> = None;

        for line in block.lines() {
            let is_key = !line.starts_with(' ') && !line.starts_with('#') && KEY_LINE_RE.is_match(line);
            let is_comment = line.trim_start().starts_with('#') && !line.starts_with(' ');
            if is_key {
                if let Some(entry) = current.take() {
                    flush_entry(entry, &mut entries, &mut anchors, &mut last_known);
                }
                let key = KEY_LINE_RE
                    .captures(line)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string());
                current = Some((key, format!("{}\n", line)));
            } else if is_comment && current.as_ref().map_or(true, |(k, _)| {
                k.as_deref().map_or(true, |k| KEY_ORDER.contains(&k))
            }) {
                // Top-level comment: anchor to the last known key seen so it
                // can be re-emitted in place.
                if let Some(entry) = current.take() {
                    flush_entry(entry, &mut entries, &mut anchors, &mut last_known);
                }
                anchors.push(Preserved {
                    anchor: last_known.clone(),
                    raw: format!("{}\n", line),
                });
            } else if let Some((_, raw)) = current.as_mut() {
                raw.push_str(line);
                raw.push('\n');
            } else if !line.trim().is_empty() {
                anchors.push(Preserved { anchor: last_known.clone(), raw: format!("{}\n", line) });
            }
        }
        if let Some(entry) = current.take() {
            flush_entry(entry, &mut entries, &mut anchors, &mut last_known);
        }

        // Second pass: lift typed values out of the known-key blocks.
        let mut fm = Frontmatter {
            id: String::new(),
            kind: ContentKind::Note,
            subtype: None,
            status: String::new(),
            maturity: None,
            title: String::new(),
            session: None,
            tags: Vec::new(),
            aliases: Vec::new(),
            topic: None,
            links: Vec::new(),
            created: Utc::now(),
            modified: Utc::now(),
            archived: false,
            preserved: anchors,
        };
        let mut seen_id = false;
        let mut seen_type = false;
        let mut seen_title = false;

        for (key, raw) in &entries {
            let key = key.as_deref().unwrap_or_default();
            let value = parse_value(raw)?;
            match key {
                "id" => {
                    fm.id = expect_str(key, &value)?;
                    seen_id = true;
                }
                "type" => {
                    let s = expect_str(key, &value)?;
                    fm.kind = ContentKind::parse(&s).ok_or_else(|| FrontmatterError::InvalidValue {
                        key: key.into(),
                        reason: format!("unknown content type '{}'", s),
                    })?;
                    seen_type = true;
                }
                "subtype" => fm.subtype = opt_str(&value),
                "status" => fm.status = expect_str(key, &value)?,
                "maturity" => {
                    fm.maturity = match opt_str(&value) {
                        None => None,
                        Some(s) => Some(Maturity::parse(&s).ok_or_else(|| {
                            FrontmatterError::InvalidValue {
                                key: key.into(),
                                reason: format!("unknown maturity '{}'", s),
                            }
                        })?),
                    }
                }
                "title" => {
                    fm.title = expect_str(key, &value)?;
                    seen_title = true;
                }
                "session" => fm.session = opt_str(&value),
                "tags" => fm.tags = expect_str_list(key, &value)?,
                "aliases" => fm.aliases = expect_str_list(key, &value)?,
                "topic" => fm.topic = opt_str(&value),
                "links" => fm.links = expect_links(key, &value)?,
                "created" => fm.created = expect_datetime(key, &value)?,
                "modified" => fm.modified = expect_datetime(key, &value)?,
                "archived" => fm.archived = matches!(value, Value::Bool(true)),
                _ => {}
            }
        }

        if !seen_id {
            return Err(FrontmatterError::MissingKey("id"));
        }
        if !seen_type {
            return Err(FrontmatterError::MissingKey("type"));
        }
        if !seen_title {
            return Err(FrontmatterError::MissingKey("title"));
        }
        if fm.status.is_empty() {
            return Err(FrontmatterError::MissingKey("status"));
        }
        Ok(fm)
    }

    /// Serialize frontmatter and body into a full document.
    pub fn to_document(&self, body: &str) -> String {
        let mut out = String::from("---\n");
        self.emit_preserved(&mut out, None);
        for key in KEY_ORDER {
            if let Some(rendered) = self.render_key(key) {
                out.push_str(&rendered);
            }
            self.emit_preserved(&mut out, Some(key));
        }
        // Preserved blocks whose anchor key was dropped still survive.
        let emitted: Vec<Option<String>> = std::iter::once(None)
            .chain(KEY_ORDER.iter().map(|k| Some((*k).to_string())))
            .collect();
        for p in &self.preserved {
            if !emitted.contains(&p.anchor) {
                out.push_str(&p.raw);
            }
        }
        out.push_str("---\n\n");
        out.push_str(body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
        out
    }

    /// Add a frontmatter-layer link, keeping per-type target lists deduplicated.
    pub fn add_link(&mut self, edge_type: &str, target: &str) {
        if let Some((_, targets)) = self.links.iter_mut().find(|(t, _)| t == edge_type) {
            if !targets.iter().any(|t| t == target) {
                targets.push(target.to_string());
            }
        } else {
            self.links.push((edge_type.to_string(), vec![target.to_string()]));
        }
    }

    /// Remove a frontmatter-layer link; empty type buckets are dropped.
    pub fn remove_link(&mut self, edge_type: &str, target: &str) {
        if let Some((_, targets)) = self.links.iter_mut().find(|(t, _)| t == edge_type) {
            targets.retain(|t| t != target);
        }
        self.links.retain(|(_, targets)| !targets.is_empty());
    }

    fn emit_preserved(&self, out: &mut String, anchor: Option<&str>) {
        for p in &self.preserved {
            if p.anchor.as_deref() == anchor {
                out.push_str(&p.raw);
            }
        }
    }

    fn render_key(&self, key: &str) -> Option<String> {
        match key {
            "id" => Some(scalar_entry("id", &self.id)),
            "type" => Some(scalar_entry("type", self.kind.as_str())),
            "subtype" => self.subtype.as_deref().map(|s| scalar_entry("subtype", s)),
            "status" => Some(scalar_entry("status", &self.status)),
            "maturity" => self.maturity.map(|m| scalar_entry("maturity", m.as_str())),
            "title" => Some(scalar_entry("title", &self.title)),
            "session" => self.session.as_deref().map(|s| scalar_entry("session", s)),
            "tags" => list_entry("tags", &self.tags),
            "aliases" => list_entry("aliases", &self.aliases),
            "topic" => self.topic.as_deref().map(|s| scalar_entry("topic", s)),
            "links" => {
                if self.links.is_empty() {
                    return None;
                }
                let mut out = String::from("links:\n");
                for (edge_type, targets) in &self.links {
                    out.push_str(&format!("  {}:\n", edge_type));
                    for t in targets {
                        out.push_str(&format!("    - {}\n", yaml_scalar(t)));
                    }
                }
                Some(out)
            }
            "created" => Some(format!(
                "created: {}\n",
                self.created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            )),
            "modified" => Some(format!(
                "modified: {}\n",
                self.modified.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            )),
            "archived" => self.archived.then(|| "archived: true\n".to_string()),
            _ => None,
        }
    }

    /// Value of a preserved scalar key (`priority`, `impact`, ...), if any.
    pub fn extra_value(&self, key: &str) -> Option<String> {
        let prefix = format!("{}:", key);
        for p in &self.preserved {
            for line in p.raw.lines() {
                if let Some(rest) = line.strip_prefix(&prefix) {
                    let value = rest.trim();
                    if !value.is_empty() {
                        return Some(value.trim_matches('"').trim_matches('\'').to_string());
                    }
                }
            }
        }
        None
    }

    /// Set (or replace) a preserved scalar key, anchored after `modified`.
    pub fn set_extra(&mut self, key: &str, value: &str) {
        let prefix = format!("{}:", key);
        self.preserved.retain(|p| !p.raw.starts_with(&prefix));
        self.preserved.push(Preserved {
            anchor: Some("modified".to_string()),
            raw: format!("{}: {}\n", key, yaml_scalar(value)),
        });
    }
}

fn flush_entry(
    entry: (Option<String>, String),
    entries: &mut Vec<(Option<String>, String)>,
    anchors: &mut Vec<Preserved>,
    last_known: &mut Option<String>,
) {
    let (key, raw) = entry;
    match key.as_deref() {
        Some(k) if KEY_ORDER.contains(&k) => {
            *last_known = Some(k.to_string());
            entries.push((key, raw));
        }
        _ => anchors.push(Preserved { anchor: last_known.clone(), raw }),
    }
}

fn parse_value(raw_block: &str) -> Result<Value, FrontmatterError> {
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(raw_block)?;
    Ok(mapping.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null))
}

fn expect_str(key: &str, value: &Value) -> Result<String, FrontmatterError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(FrontmatterError::InvalidValue {
            key: key.into(),
            reason: format!("expected a string, found {:?}", other),
        }),
    }
}

fn opt_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn expect_str_list(key: &str, value: &Value) -> Result<Vec<String>, FrontmatterError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items.iter().map(|v| expect_str(key, v)).collect(),
        Value::String(s) => Ok(vec![s.clone()]),
        other => Err(FrontmatterError::InvalidValue {
            key: key.into(),
            reason: format!("expected a list, found {:?}", other),
        }),
    }
}

fn expect_links(key: &str, value: &Value) -> Result<Vec<(String, Vec<String>)>, FrontmatterError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Mapping(map) => {
            let mut out = Vec::new();
            for (k, v) in map {
                let edge_type = expect_str(key, k)?;
                out.push((edge_type, expect_str_list(key, v)?));
            }
            Ok(out)
        }
        other => Err(FrontmatterError::InvalidValue {
            key: key.into(),
            reason: format!("expected a map of edge types, found {:?}", other),
        }),
    }
}

fn expect_datetime(key: &str, value: &Value) -> Result<DateTime<Utc>, FrontmatterError> {
    let s = expect_str(key, value)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FrontmatterError::InvalidValue {
            key: key.into(),
            reason: format!("'{}' is not an RFC3339 timestamp: {}", s, e),
        })
}

fn yaml_scalar(s: &str) -> String {
    let dumped = serde_yaml::to_string(&Value::String(s.to_string())).unwrap_or_default();
    dumped.trim_end().to_string()
}

fn scalar_entry(key: &str, value: &str) -> String {
    format!("{}: {}\n", key, yaml_scalar(value))
}

fn list_entry(key: &str, items: &[String]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    let mut out = format!("{}:\n", key);
    for item in items {
        out.push_str(&format!("  - {}\n", yaml_scalar(item)));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Frontmatter {
        Frontmatter {
            id: "ztl_ab12cd34".into(),
            kind: ContentKind::Note,
            subtype: Some("knowledge".into()),
            status: "draft".into(),
            maturity: None,
            title: "Transformer Architectures".into(),
            session: Some("sess-0001".into()),
            tags: vec!["ml/attention".into()],
            aliases: vec!["transformers".into()],
            topic: Some("ml".into()),
            links: vec![("relates".into(), vec!["ztl_11111111".into()])],
            created: Utc.with_ymd_and_hms(2026, 7, 1, 9, 0, 0).unwrap(),
            modified: Utc.with_ymd_and_hms(2026, 7, 2, 9, 0, 0).unwrap(),
            archived: false,
            preserved: Vec::new(),
        }
    }

    #[test]
    fn test_round_trip_preserves_typed_fields() {
        let doc = sample().to_document("Body text.\n");
        let (fm, body) = Frontmatter::parse_document(&doc).unwrap();
        assert_eq!(fm, sample());
        assert_eq!(body, "Body text.\n");
    }

    #[test]
    fn test_canonical_key_order() {
        let doc = sample().to_document("x\n");
        let block: Vec<&str> = doc
            .lines()
            .skip(1)
            .take_while(|l| *l != "---")
            .filter(|l| !l.starts_with(' ') && !l.starts_with('-'))
            .collect();
        let keys: Vec<&str> = block.iter().map(|l| l.split(':').next().unwrap()).collect();
        assert_eq!(
            keys,
            vec![
                "id", "type", "subtype", "status", "title", "session", "tags", "aliases",
                "topic", "links", "created", "modified"
            ]
        );
    }

    #[test]
    fn test_unknown_keys_and_comments_survive_round_trip() {
        let doc = "---\nid: ztl_ab12cd34\ntype: note\nstatus: draft\n# human note about the title\ntitle: Testing\nrating: 5\ncustom:\n  nested: true\ncreated: 2026-07-01T09:00:00Z\nmodified: 2026-07-01T09:00:00Z\n---\n\nBody.\n";
        let (fm, body) = Frontmatter::parse_document(doc).unwrap();
        let out = fm.to_document(&body);
        assert!(out.contains("# human note about the title\n"));
        assert!(out.contains("rating: 5\n"));
        assert!(out.contains("custom:\n  nested: true\n"));
        // Comment stays anchored after `status`, its original predecessor.
        let status_pos = out.find("status:").unwrap();
        let comment_pos = out.find("# human note").unwrap();
        let title_pos = out.find("title:").unwrap();
        assert!(status_pos < comment_pos && comment_pos < title_pos);
    }

    #[test]
    fn test_missing_required_key_is_an_error() {
        let doc = "---\ntype: note\nstatus: draft\ntitle: No id\ncreated: 2026-07-01T09:00:00Z\nmodified: 2026-07-01T09:00:00Z\n---\n\nx\n";
        assert!(matches!(
            Frontmatter::parse_document(doc),
            Err(FrontmatterError::MissingKey("id"))
        ));
    }

    #[test]
    fn test_title_with_colon_is_quoted_and_recovered() {
        let mut fm = sample();
        fm.title = "Attention: a survey".into();
        let doc = fm.to_document("x\n");
        let (back, _) = Frontmatter::parse_document(&doc).unwrap();
        assert_eq!(back.title, "Attention: a survey");
    }

    #[test]
    fn test_link_helpers_deduplicate() {
        let mut fm = sample();
        fm.add_link("relates", "ztl_22222222");
        fm.add_link("relates", "ztl_22222222");
        let (_, targets) = fm.links.iter().find(|(t, _)| t == "relates").unwrap();
        assert_eq!(targets.len(), 2);
        fm.remove_link("relates", "ztl_11111111");
        fm.remove_link("relates", "ztl_22222222");
        assert!(fm.links.is_empty());
    }

    #[test]
    fn test_archived_flag_round_trips() {
        let mut fm = sample();
        fm.archived = true;
        let doc = fm.to_document("x\n");
        assert!(doc.contains("archived: true\n"));
        let (back, _) = Frontmatter::parse_document(&doc).unwrap();
        assert!(back.archived);
    }

    #[test]
    fn test_extra_scalar_helpers() {
        let mut fm = sample();
        fm.set_extra("priority", "high");
        fm.set_extra("priority", "low");
        assert_eq!(fm.extra_value("priority").as_deref(), Some("low"));
        let doc = fm.to_document("x\n");
        let (back, _) = Frontmatter::parse_document(&doc).unwrap();
        assert_eq!(back.extra_value("priority").as_deref(), Some("low"));
        assert!(back.extra_value("impact").is_none());
    }

    #[test]
    fn test_body_without_frontmatter_is_rejected() {
        assert!(matches!(
            Frontmatter::parse_document("no fences here"),
            Err(FrontmatterError::MissingBlock)
        ));
    }
}
