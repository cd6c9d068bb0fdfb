//! Content kinds, lifecycle tables, and the content model registry.
//!
//! Subtype behaviour is a closed dispatch table rather than anything
//! duck-typed: `(kind, subtype)` resolves to a [`ContentModel`] carrying the
//! required sections, the status transition table, and the body template.
//! Lookup precedence is subtype-key first, kind-key fallback.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Content kinds
//─────────────────────────────

/// The closed set of content kinds a vault can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Atomic knowledge note under `notes/<topic>/`.
    Note,
    /// External material capture under `notes/<topic>/`.
    Reference,
    /// Work log under `ops/logs/`.
    Log,
    /// Actionable item under `ops/tasks/`.
    Task,
}

impl ContentKind {
    /// Canonical lowercase name, as written to frontmatter `type`.
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Note => "note",
            ContentKind::Reference => "reference",
            ContentKind::Log => "log",
            ContentKind::Task => "task",
        }
    }

    /// Parse a frontmatter `type` value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "note" => Some(ContentKind::Note),
            "reference" => Some(ContentKind::Reference),
            "log" => Some(ContentKind::Log),
            "task" => Some(ContentKind::Task),
            _ => None,
        }
    }

    /// Vault space this kind lives in, relative to the vault root.
    ///
    /// Notes and references share `notes/` and are further grouped by topic;
    /// logs and tasks live under fixed `ops/` directories.
    pub fn space(self) -> &'static str {
        match self {
            ContentKind::Note | ContentKind::Reference => "notes",
            ContentKind::Log => "ops/logs",
            ContentKind::Task => "ops/tasks",
        }
    }

    /// Whether identifiers for this kind are minted from a content hash.
    pub fn uses_content_hash(self) -> bool {
        matches!(self, ContentKind::Note | ContentKind::Reference)
    }
}

//─────────────────────────────
//  Maturity (garden lifecycle)
//─────────────────────────────

/// Human-managed garden lifecycle, orthogonal to machine status.
///
/// A non-null maturity marks the note as human-owned: the engine must never
/// mutate its body bytes (reweave still maintains frontmatter links).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Maturity {
    /// Freshly planted, still forming.
    Seed,
    /// Growing, partially trustworthy.
    Budding,
    /// Stable and load-bearing.
    Evergreen,
}

impl Maturity {
    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Maturity::Seed => "seed",
            Maturity::Budding => "budding",
            Maturity::Evergreen => "evergreen",
        }
    }

    /// Parse a frontmatter `maturity` value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seed" => Some(Maturity::Seed),
            "budding" => Some(Maturity::Budding),
            "evergreen" => Some(Maturity::Evergreen),
            _ => None,
        }
    }
}

//─────────────────────────────
//  Machine status
//─────────────────────────────

/// Machine status for a non-decision note, computed from outgoing edges.
///
/// Thresholds: 0 outgoing edges is `draft`, 1-2 is `linked`, 3 or more is
/// `connected`. Recomputed after every write that touches edges.
pub fn note_status_for_degree(out_degree: usize) -> &'static str {
    match out_degree {
        0 => "draft",
        1 | 2 => "linked",
        _ => "connected",
    }
}

//─────────────────────────────
//  Content model registry
//─────────────────────────────

/// Validation and lifecycle rules for one `(kind, subtype)` pair.
#[derive(Debug, Clone, Copy)]
pub struct ContentModel {
    /// Content kind this model applies to.
    pub kind: ContentKind,
    /// Subtype key, `None` for the kind-level fallback model.
    pub subtype: Option<&'static str>,
    /// Sections the body must contain on create.
    pub required_sections: &'static [&'static str],
    /// Sections the template offers even when not required.
    pub recommended_sections: &'static [&'static str],
    /// All statuses this model recognizes; the first is the initial status.
    pub statuses: &'static [&'static str],
    /// Allowed `(from, to)` status transitions.
    pub transitions: &'static [(&'static str, &'static str)],
    /// Whether status is computed from the graph instead of transitioned.
    pub machine_status: bool,
}

impl ContentModel {
    /// Initial status assigned at create.
    pub fn initial_status(&self) -> &'static str {
        self.statuses[0]
    }

    /// Whether `status` is one this model recognizes.
    pub fn knows_status(&self, status: &str) -> bool {
        self.statuses.contains(&status)
    }

    /// Whether the lifecycle table permits `from -> to`.
    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        self.transitions.iter().any(|(f, t)| *f == from && *t == to)
    }

    /// Render the body template with named sections.
    ///
    /// Required sections come first in declared order, then recommended
    /// sections that received content, then any extra named sections.
    pub fn render_body(&self, sections: &[(String, String)]) -> String {
        let mut out = String::new();
        let mut used: Vec<&str> = Vec::new();
        for &name in self.required_sections.iter().chain(self.recommended_sections.iter()) {
            let body = sections
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap_or("");
            if body.is_empty() && !self.required_sections.contains(&name) {
                continue;
            }
            out.push_str(&format!("## {}\n\n{}\n\n", name, body));
            used.push(name);
        }
        for (name, body) in sections {
            if !used.contains(&name.as_str()) {
                out.push_str(&format!("## {}\n\n{}\n\n", name, body));
            }
        }
        out.trim_end().to_string()
    }
}

const NOTE_MODEL: ContentModel = ContentModel {
    kind: ContentKind::Note,
    subtype: None,
    required_sections: &[],
    recommended_sections: &["Summary", "Details"],
    statuses: &["draft", "linked", "connected"],
    transitions: &[
        ("draft", "linked"),
        ("linked", "draft"),
        ("linked", "connected"),
        ("connected", "linked"),
    ],
    machine_status: true,
};

const KNOWLEDGE_MODEL: ContentModel = ContentModel {
    kind: ContentKind::Note,
    subtype: Some("knowledge"),
    required_sections: &[],
    recommended_sections: &["Summary", "Details"],
    statuses: &["draft", "linked", "connected"],
    transitions: &[
        ("draft", "linked"),
        ("linked", "draft"),
        ("linked", "connected"),
        ("connected", "linked"),
    ],
    machine_status: true,
};

const DECISION_MODEL: ContentModel = ContentModel {
    kind: ContentKind::Note,
    subtype: Some("decision"),
    required_sections: &["Context", "Choice", "Rationale", "Alternatives", "Consequences"],
    recommended_sections: &[],
    statuses: &["proposed", "accepted", "superseded"],
    transitions: &[("proposed", "accepted"), ("accepted", "superseded")],
    machine_status: false,
};

const REFERENCE_MODEL: ContentModel = ContentModel {
    kind: ContentKind::Reference,
    subtype: None,
    required_sections: &[],
    recommended_sections: &["Source", "Notes"],
    statuses: &["captured", "annotated"],
    transitions: &[("captured", "annotated")],
    machine_status: false,
};

const LOG_MODEL: ContentModel = ContentModel {
    kind: ContentKind::Log,
    subtype: None,
    required_sections: &[],
    recommended_sections: &["Timeline"],
    statuses: &["open", "closed"],
    transitions: &[("open", "closed"), ("closed", "open")],
    machine_status: false,
};

const TASK_MODEL: ContentModel = ContentModel {
    kind: ContentKind::Task,
    subtype: None,
    required_sections: &[],
    recommended_sections: &["Goal", "Notes"],
    statuses: &["inbox", "active", "blocked", "done", "dropped"],
    transitions: &[
        ("inbox", "active"),
        ("inbox", "dropped"),
        ("active", "blocked"),
        ("active", "done"),
        ("active", "dropped"),
        ("blocked", "active"),
        ("blocked", "dropped"),
    ],
    machine_status: false,
};

/// Reference subtypes are classification-only: same lifecycle, no extra rules.
const REFERENCE_SUBTYPES: &[&str] = &["paper", "article", "book", "tool"];

const REGISTRY: &[ContentModel] = &[
    KNOWLEDGE_MODEL,
    DECISION_MODEL,
    NOTE_MODEL,
    REFERENCE_MODEL,
    LOG_MODEL,
    TASK_MODEL,
];

/// Resolve the content model for `(kind, subtype)`.
///
/// Subtype-keyed entries win; an unrecognized subtype for notes is an error
/// surfaced by the caller, while reference subtypes are classification-only
/// and all resolve to the reference model. Returns `None` only when the
/// subtype is not recognized for the kind.
pub fn content_model(kind: ContentKind, subtype: Option<&str>) -> Option<&'static ContentModel> {
    match (kind, subtype) {
        (ContentKind::Reference, Some(s)) if !REFERENCE_SUBTYPES.contains(&s) => None,
        (_, Some(s)) => REGISTRY
            .iter()
            .find(|m| m.kind == kind && m.subtype == Some(s))
            .or_else(|| {
                // Classification-only subtypes fall back to the kind model.
                if kind == ContentKind::Reference {
                    REGISTRY.iter().find(|m| m.kind == kind && m.subtype.is_none())
                } else {
                    None
                }
            }),
        (_, None) => REGISTRY.iter().find(|m| m.kind == kind && m.subtype.is_none()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_precedence_subtype_first() {
        let decision = content_model(ContentKind::Note, Some("decision")).unwrap();
        assert_eq!(decision.statuses, &["proposed", "accepted", "superseded"]);
        let plain = content_model(ContentKind::Note, None).unwrap();
        assert!(plain.machine_status);
    }

    #[test]
    fn test_reference_subtypes_are_classification_only() {
        for s in REFERENCE_SUBTYPES {
            let m = content_model(ContentKind::Reference, Some(s)).unwrap();
            assert_eq!(m.initial_status(), "captured");
        }
        assert!(content_model(ContentKind::Reference, Some("podcast")).is_none());
    }

    #[test]
    fn test_unknown_note_subtype_is_rejected() {
        assert!(content_model(ContentKind::Note, Some("journal")).is_none());
    }

    #[test]
    fn test_task_transitions() {
        let m = content_model(ContentKind::Task, None).unwrap();
        assert!(m.can_transition("inbox", "active"));
        assert!(m.can_transition("blocked", "active"));
        assert!(!m.can_transition("done", "active"));
        assert!(!m.can_transition("inbox", "done"));
    }

    #[test]
    fn test_log_status_is_bidirectional() {
        let m = content_model(ContentKind::Log, None).unwrap();
        assert!(m.can_transition("open", "closed"));
        assert!(m.can_transition("closed", "open"));
    }

    #[test]
    fn test_note_status_thresholds() {
        assert_eq!(note_status_for_degree(0), "draft");
        assert_eq!(note_status_for_degree(1), "linked");
        assert_eq!(note_status_for_degree(2), "linked");
        assert_eq!(note_status_for_degree(3), "connected");
        assert_eq!(note_status_for_degree(12), "connected");
    }

    #[test]
    fn test_decision_template_renders_required_sections() {
        let m = content_model(ContentKind::Note, Some("decision")).unwrap();
        let body = m.render_body(&[
            ("Context".into(), "We need an index.".into()),
            ("Choice".into(), "SQLite.".into()),
        ]);
        for section in ["Context", "Choice", "Rationale", "Alternatives", "Consequences"] {
            assert!(body.contains(&format!("## {}", section)), "missing {section}");
        }
        assert!(body.contains("SQLite."));
    }
}
