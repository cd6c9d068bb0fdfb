#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ztlctl-engine** – The ztlctl vault engine.
//!
//! This crate coordinates the three representations of one knowledge graph:
//! markdown files on disk (authoritative), the derived SQLite index, and the
//! in-memory graph. It owns the transactional write pipelines (create,
//! update, archive, supersede, session close), the reweave densification
//! pass, the query surface, the integrity checker, and the session services.
//!
//! Every public operation returns a [`ServiceResult`]; errors never cross
//! the service boundary. Collaborators (the CLI, the MCP adapter) consume
//! those results and own presentation.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use ztlctl_config::ZtlConfig;
use ztlctl_events::{EventBus, EventKind};
use ztlctl_graph::GraphEngine;
use ztlctl_store::{Store, StoreError};
use ztlctl_types::{ErrorCode, FrontmatterError, ServiceResult};

pub mod check;
pub mod context;
pub mod create;
pub mod extract;
pub(crate) mod indexing;
pub mod query;
pub mod reweave;
pub mod session;
pub mod template;
pub mod txn;
pub mod update;
pub mod vector;

pub use context::ContextRequest;
pub use create::{BatchMode, CreateRequest};
pub use query::{QueryFilter, SortMode};
pub use session::SessionLogRequest;
pub use update::UpdateRequest;

/// Internal error type classified into the stable [`ErrorCode`] taxonomy at
/// the service boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Validation failure.
    #[error("{0}")]
    InvalidInput(String),

    /// Referenced entity absent.
    #[error("{0}")]
    NotFound(String),

    /// Identifier collision, duplicate edge, or supersession cycle.
    #[error("{message}")]
    Conflict {
        /// Human-readable description.
        message: String,
        /// Structured detail (existing id/title on collisions).
        detail: Value,
    },

    /// Decision body change after acceptance.
    #[error("{0}")]
    Immutable(String),

    /// Garden body change attempted through a non-user path.
    #[error("{0}")]
    Protected(String),

    /// Illegal lifecycle transition.
    #[error("illegal status transition '{from}' -> '{to}'")]
    Transition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Integrity inconsistency that is not auto-fixable.
    #[error("{0}")]
    Corrupt(String),

    /// Storage failure (filesystem or database).
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidInput(_) => ErrorCode::InvalidInput,
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::Conflict { .. } => ErrorCode::Conflict,
            EngineError::Immutable(_) => ErrorCode::Immutable,
            EngineError::Protected(_) => ErrorCode::Protected,
            EngineError::Transition { .. } => ErrorCode::Transition,
            EngineError::Corrupt(_) => ErrorCode::Corrupt,
            EngineError::Store(StoreError::Decode { .. }) => ErrorCode::Corrupt,
            EngineError::Store(_) => ErrorCode::IoError,
        }
    }

    /// Structured detail for the result contract.
    pub fn detail(&self) -> Value {
        match self {
            EngineError::Conflict { detail, .. } => detail.clone(),
            EngineError::Transition { from, to } => {
                serde_json::json!({"from": from, "to": to})
            }
            _ => Value::Null,
        }
    }
}

impl From<FrontmatterError> for EngineError {
    fn from(e: FrontmatterError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}

/// Outcome of an internal pipeline: payload plus accumulated warnings.
pub(crate) type PipelineOutcome = Result<(serde_json::Map<String, Value>, Vec<String>), EngineError>;

/// Convert a pipeline outcome into the frozen result contract.
pub(crate) fn respond(op: &str, outcome: PipelineOutcome) -> ServiceResult {
    match outcome {
        Ok((data, warnings)) => ServiceResult::ok(op, data).with_warnings(warnings),
        Err(e) => {
            warn!(op, error = %e, "operation failed");
            ServiceResult::fail(op, e.code(), e.to_string(), e.detail())
        }
    }
}

/// One open vault: configuration, store, graph engine, event bus, vectors.
///
/// A `Vault` is built per invocation; commands are short-lived processes and
/// the in-memory graph snapshot never outlives one.
pub struct Vault {
    config: ZtlConfig,
    store: Store,
    graph: GraphEngine,
    events: Arc<EventBus>,
    vectors: vector::VectorService,
}

impl Vault {
    /// Open an existing vault rooted at `root`.
    pub async fn open(root: &Path) -> Result<Self, EngineError> {
        let config = ZtlConfig::load(root)
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        let store = Store::open(root).await?;
        let graph = GraphEngine::new(store.clone());
        let events = Arc::new(EventBus::new(store.clone(), &config.events));
        let vectors = vector::VectorService::new(&config.vectors);
        Ok(Self { config, store, graph, events, vectors })
    }

    /// Initialize a new vault at `root` and open it.
    ///
    /// Creates the directory layout, a starter `ztlctl.toml`, and the
    /// identity documents, then emits `post_init`.
    pub async fn init(root: &Path) -> ServiceResult {
        let op = "init";
        match Self::init_inner(root).await {
            Ok((vault, data, warnings)) => {
                let mut result = ServiceResult::ok(op, data).with_warnings(warnings);
                match vault
                    .events
                    .dispatch(EventKind::PostInit, serde_json::json!({"root": root.display().to_string()}), None)
                    .await
                {
                    Ok(event_warnings) => result = result.with_warnings(event_warnings),
                    Err(e) => result = result.with_warnings(vec![format!("event dispatch failed: {}", e)]),
                }
                result
            }
            Err(e) => ServiceResult::fail(op, e.code(), e.to_string(), e.detail()),
        }
    }

    async fn init_inner(
        root: &Path,
    ) -> Result<(Self, serde_json::Map<String, Value>, Vec<String>), EngineError> {
        std::fs::create_dir_all(root).map_err(|source| StoreError::Io {
            path: root.display().to_string(),
            source,
        })?;
        let vault = Self::open(root).await?;
        let warnings = template::write_seed_documents(vault.store.paths())?;
        let data = ztlctl_types::result_map! {
            "root" => vault.store.paths().root().display().to_string(),
            "db" => vault.store.paths().db_path().display().to_string(),
        };
        Ok((vault, data, warnings))
    }

    /// Effective configuration for this invocation.
    pub fn config(&self) -> &ZtlConfig {
        &self.config
    }

    /// Override configuration (CLI flags beat file and environment).
    pub fn set_config(&mut self, config: ZtlConfig) {
        self.events = Arc::new(EventBus::new(self.store.clone(), &config.events));
        self.vectors = vector::VectorService::new(&config.vectors);
        self.config = config;
    }

    /// The vault's store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The vault's graph engine.
    pub fn graph(&self) -> &GraphEngine {
        &self.graph
    }

    /// The vault's event bus (plugin handlers register here).
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub(crate) fn vectors(&self) -> &vector::VectorService {
        &self.vectors
    }

    /// Flush the event WAL synchronously.
    pub async fn drain(&self) -> ServiceResult {
        let op = "drain";
        match self.events.drain().await {
            Ok(report) => {
                let data = ztlctl_types::result_map! {
                    "completed" => report.completed,
                    "dead_lettered" => report.dead_lettered,
                };
                ServiceResult::ok(op, data).with_warnings(report.warnings)
            }
            Err(e) => ServiceResult::fail(op, ErrorCode::IoError, e.to_string(), Value::Null),
        }
    }

    /// Dispatch an event post-commit, folding failures into warnings.
    pub(crate) async fn emit(
        &self,
        kind: EventKind,
        payload: Value,
        session: Option<&str>,
        warnings: &mut Vec<String>,
    ) {
        match self.events.dispatch(kind, payload, session).await {
            Ok(handler_warnings) => warnings.extend(handler_warnings),
            Err(e) => warnings.push(format!("event dispatch failed: {}", e)),
        }
    }
}
