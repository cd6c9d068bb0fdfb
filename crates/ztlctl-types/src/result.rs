//! The frozen result contract returned by every service operation.
//!
//! Services never raise across their boundary: internal failures are
//! classified into a stable [`ErrorCode`] and returned as
//! `ServiceResult { ok: false, .. }`. Collaborators (CLI, MCP adapter) are
//! pure consumers of this record and own all user presentation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

//─────────────────────────────
//  Error taxonomy
//─────────────────────────────

/// Stable error codes shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Validation failure.
    InvalidInput,
    /// Referenced entity absent.
    NotFound,
    /// Identifier collision, duplicate edge, or supersession cycle.
    Conflict,
    /// Decision body change after acceptance.
    Immutable,
    /// Garden body change.
    Protected,
    /// Illegal lifecycle transition.
    Transition,
    /// Filesystem or database failure.
    IoError,
    /// Integrity check found an inconsistency that is not auto-fixable.
    Corrupt,
    /// Reserved code used by stubbed methods.
    NotImplemented,
    /// Event handler failed; always surfaced as a warning, never fatal.
    PluginError,
}

impl ErrorCode {
    /// The stable wire code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Immutable => "IMMUTABLE",
            ErrorCode::Protected => "PROTECTED",
            ErrorCode::Transition => "TRANSITION",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::Corrupt => "CORRUPT",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::PluginError => "PLUGIN_ERROR",
        }
    }
}

/// Classified failure carried inside an unsuccessful [`ServiceResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceError {
    /// Stable code from the shared taxonomy.
    pub code: ErrorCode,
    /// Human-readable one-liner.
    pub message: String,
    /// Structured detail for programmatic consumers.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

//─────────────────────────────
//  Service result
//─────────────────────────────

/// Outcome record returned by every service operation.
///
/// The record is frozen once built: construct it through [`ServiceResult::ok`]
/// / [`ServiceResult::fail`] and the `with_*` builders, then hand it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResult {
    /// Whether the operation succeeded.
    pub ok: bool,
    /// Operation name, e.g. `create` or `session.close`.
    pub op: String,
    /// Operation-specific payload.
    pub data: Map<String, Value>,
    /// Non-fatal advisories accumulated along the pipeline.
    pub warnings: Vec<String>,
    /// Classified failure when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
    /// Optional transport metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl ServiceResult {
    /// Successful outcome with payload.
    pub fn ok(op: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            ok: true,
            op: op.into(),
            data,
            warnings: Vec::new(),
            error: None,
            meta: None,
        }
    }

    /// Failed outcome with a classified error.
    pub fn fail(
        op: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        detail: Value,
    ) -> Self {
        Self {
            ok: false,
            op: op.into(),
            data: Map::new(),
            warnings: Vec::new(),
            error: Some(ServiceError { code, message: message.into(), detail }),
            meta: None,
        }
    }

    /// Stub outcome for unimplemented operations.
    pub fn not_implemented(op: impl Into<String>) -> Self {
        let op = op.into();
        let message = format!("operation '{}' is not implemented", op);
        Self::fail(op, ErrorCode::NotImplemented, message, Value::Null)
    }

    /// Attach warnings, preserving earlier ones.
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Attach transport metadata.
    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Process exit code mandated by the contract: 0 iff `ok`.
    pub fn exit_code(&self) -> i32 {
        if self.ok {
            0
        } else {
            1
        }
    }
}

/// Shorthand for building a `data`/`detail` map from literal pairs.
#[macro_export]
macro_rules! result_map {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = serde_json::Map::new();
        $(map.insert($key.to_string(), serde_json::json!($value));)*
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_result_serializes_without_error() {
        let r = ServiceResult::ok("create", crate::result_map! {"id" => "ztl_ab12cd34"});
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["ok"], json!(true));
        assert_eq!(v["data"]["id"], json!("ztl_ab12cd34"));
        assert!(v.get("error").is_none());
        assert_eq!(r.exit_code(), 0);
    }

    #[test]
    fn test_fail_result_carries_stable_code() {
        let r = ServiceResult::fail(
            "create",
            ErrorCode::Conflict,
            "id collision",
            json!({"existing_id": "ztl_ab12cd34"}),
        );
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["error"]["code"], json!("CONFLICT"));
        assert_eq!(v["error"]["detail"]["existing_id"], json!("ztl_ab12cd34"));
        assert_eq!(r.exit_code(), 1);
    }

    #[test]
    fn test_not_implemented_is_reserved() {
        let r = ServiceResult::not_implemented("vector.reindex");
        assert_eq!(r.error.as_ref().unwrap().code, ErrorCode::NotImplemented);
        assert_eq!(r.error.unwrap().code.as_str(), "NOT_IMPLEMENTED");
    }

    #[test]
    fn test_warnings_accumulate() {
        let r = ServiceResult::ok("update", Map::new())
            .with_warnings(vec!["tag 'misc' has no scope".into()])
            .with_warnings(vec!["community detection fell back to louvain".into()]);
        assert_eq!(r.warnings.len(), 2);
    }
}
