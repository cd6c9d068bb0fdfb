#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ztlctl-types** – Shared domain model for the ztlctl vault engine.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It owns the content model (kinds, subtypes, lifecycle tables), the
//! identifier system, the frontmatter round-trip representation, and the
//! `ServiceResult` contract returned by every service operation.
//!
//! It intentionally performs no I/O: files and the relational index live in
//! `ztlctl-store`, coordination lives in `ztlctl-engine`.

pub mod id;
pub mod model;
pub mod frontmatter;
pub mod result;

pub use id::{mint_content_hash, normalize_title, sequential_id, IdKind};
pub use model::{
    content_model, note_status_for_degree, ContentKind, ContentModel, Maturity,
};
pub use frontmatter::{Frontmatter, FrontmatterError};
pub use result::{ErrorCode, ServiceError, ServiceResult};

//─────────────────────────────
//  Edge vocabulary
//─────────────────────────────

/// Default edge type for relations that carry no explicit type.
pub const EDGE_RELATES: &str = "relates";

/// Edge type linking a new decision to the decision it replaces.
pub const EDGE_SUPERSEDES: &str = "supersedes";

/// Reverse edge type written alongside [`EDGE_SUPERSEDES`].
pub const EDGE_SUPERSEDED_BY: &str = "superseded_by";

/// Source layer tag for edges extracted from frontmatter `links`.
pub const LAYER_FRONTMATTER: &str = "frontmatter";

/// Source layer tag for edges extracted from body wikilinks.
pub const LAYER_BODY: &str = "body";
