#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ztlctl-events** – Durable event bus for the ztlctl vault engine.
//!
//! Every mutating service operation dispatches a lifecycle event after its
//! transaction commits. The bus writes the event to the write-ahead log
//! *before* any handler runs (that ordering is the durability guarantee),
//! then hands it to a bounded worker pool. Failed events retry up to a
//! configured limit and then dead-letter; `drain()` is the synchronous
//! barrier that flushes everything still pending.
//!
//! Handler failures never propagate: they surface as warnings on the
//! originating `ServiceResult` (sync mode) or on the drain report.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use ztlctl_config::EventsConfig;
use ztlctl_store::{queries, Store};

//─────────────────────────────
//  Event kinds
//─────────────────────────────

/// The eight lifecycle events the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A node was created.
    PostCreate,
    /// A node was updated, archived, or superseded.
    PostUpdate,
    /// A log was closed.
    PostClose,
    /// A reweave batch committed.
    PostReweave,
    /// A session started.
    PostSessionStart,
    /// A session closed.
    PostSessionClose,
    /// An integrity check ran.
    PostCheck,
    /// A vault was initialized.
    PostInit,
}

impl EventKind {
    /// Stable wire name, e.g. `post_create`.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PostCreate => "post_create",
            EventKind::PostUpdate => "post_update",
            EventKind::PostClose => "post_close",
            EventKind::PostReweave => "post_reweave",
            EventKind::PostSessionStart => "post_session_start",
            EventKind::PostSessionClose => "post_session_close",
            EventKind::PostCheck => "post_check",
            EventKind::PostInit => "post_init",
        }
    }

    /// Parse a stored kind string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "post_create" => Some(EventKind::PostCreate),
            "post_update" => Some(EventKind::PostUpdate),
            "post_close" => Some(EventKind::PostClose),
            "post_reweave" => Some(EventKind::PostReweave),
            "post_session_start" => Some(EventKind::PostSessionStart),
            "post_session_close" => Some(EventKind::PostSessionClose),
            "post_check" => Some(EventKind::PostCheck),
            "post_init" => Some(EventKind::PostInit),
        _ => None,
        }
    }
}

//─────────────────────────────
//  Handlers
//─────────────────────────────

/// A plugin-style consumer of lifecycle events.
///
/// Handlers run at arm's length: whatever they return, the data plane has
/// already committed. Errors are recorded against the WAL row and surfaced
/// as warnings.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable handler name used in warnings and logs.
    fn name(&self) -> &str;

    /// Consume one event.
    async fn handle(&self, kind: EventKind, payload: &serde_json::Value) -> anyhow::Result<()>;
}

/// Built-in handler that traces every event; keeps the pipeline observable
/// even on vaults with no plugins installed.
#[derive(Debug, Default)]
pub struct TracingHandler;

#[async_trait]
impl EventHandler for TracingHandler {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn handle(&self, kind: EventKind, payload: &serde_json::Value) -> anyhow::Result<()> {
        debug!(kind = kind.as_str(), %payload, "event");
        Ok(())
    }
}

//─────────────────────────────
//  Drain report
//─────────────────────────────

/// Outcome of a `drain()` barrier.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Events that completed during the drain.
    pub completed: usize,
    /// Events that exhausted retries and dead-lettered.
    pub dead_lettered: usize,
    /// Handler failure descriptions.
    pub warnings: Vec<String>,
}

//─────────────────────────────
//  Event bus
//─────────────────────────────

/// WAL-backed event bus with a bounded worker pool.
pub struct EventBus {
    store: Store,
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    sync: bool,
    max_retries: u32,
}

impl EventBus {
    /// Build a bus over one vault's store.
    pub fn new(store: Store, config: &EventsConfig) -> Self {
        Self {
            store,
            handlers: Arc::new(RwLock::new(vec![Arc::new(TracingHandler) as Arc<dyn EventHandler>])),
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            sync: config.sync,
            max_retries: config.max_retries,
        }
    }

    /// Register an additional event handler.
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().expect("handler registry lock").push(handler);
    }

    /// Persist an event and dispatch it.
    ///
    /// The WAL insert happens first and on the caller's path; in sync mode
    /// the handlers then run inline and their failures are returned as
    /// warnings, otherwise a pool worker picks the event up and warnings
    /// surface on the next drain.
    pub async fn dispatch(
        &self,
        kind: EventKind,
        payload: serde_json::Value,
        session: Option<&str>,
    ) -> Result<Vec<String>, ztlctl_store::StoreError> {
        let mut conn = self.store.pool().acquire().await?;
        let id = queries::insert_event(
            &mut conn,
            kind.as_str(),
            &payload.to_string(),
            session,
            Utc::now(),
        )
        .await?;
        drop(conn);

        if self.sync {
            let mut warnings = Vec::new();
            run_to_completion(&self.store, &self.handlers, id, kind, &payload, self.max_retries, &mut warnings)
                .await;
            return Ok(warnings);
        }

        let store = self.store.clone();
        let handlers = self.handlers.clone();
        let permits = self.permits.clone();
        let max_retries = self.max_retries;
        self.tasks.lock().await.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let mut warnings = Vec::new();
            run_to_completion(&store, &handlers, id, kind, &payload, max_retries, &mut warnings).await;
            for warning in warnings {
                warn!(%warning, "event handler failure");
            }
        });
        Ok(Vec::new())
    }

    /// Synchronous barrier: join in-flight workers, then replay every
    /// `pending` or `failed` WAL row inline until none remain or all are
    /// dead-lettered.
    pub async fn drain(&self) -> Result<DrainReport, ztlctl_store::StoreError> {
        {
            let mut tasks = self.tasks.lock().await;
            while tasks.join_next().await.is_some() {}
        }

        let mut report = DrainReport::default();
        loop {
            // `in_flight` here can only be a row a crashed invocation left
            // behind: this process's workers were joined above.
            let mut conn = self.store.pool().acquire().await?;
            let outstanding =
                queries::events_with_status(&mut conn, &["pending", "failed", "in_flight"]).await?;
            drop(conn);
            if outstanding.is_empty() {
                break;
            }
            let mut progressed = false;
            for row in outstanding {
                let kind = match EventKind::parse(&row.kind) {
                    Some(kind) => kind,
                    None => {
                        // Unknown kinds cannot be delivered; park them.
                        self.mark(row.id, "dead_letter", row.retries).await?;
                        report.dead_lettered += 1;
                        report.warnings.push(format!("unknown event kind '{}'", row.kind));
                        progressed = true;
                        continue;
                    }
                };
                let payload: serde_json::Value =
                    serde_json::from_str(&row.payload).unwrap_or(serde_json::Value::Null);
                match self.run_handlers(kind, &payload).await {
                    Ok(()) => {
                        self.mark(row.id, "completed", row.retries).await?;
                        report.completed += 1;
                        progressed = true;
                    }
                    Err(failure) => {
                        let retries = row.retries + 1;
                        if retries >= self.max_retries as i64 {
                            self.mark(row.id, "dead_letter", retries).await?;
                            report.dead_lettered += 1;
                            progressed = true;
                        } else {
                            self.mark(row.id, "failed", retries).await?;
                        }
                        report.warnings.push(failure);
                    }
                }
            }
            if !progressed {
                // Every remaining row failed below its retry budget; keep
                // retrying until each completes or dead-letters.
                continue;
            }
        }
        Ok(report)
    }

    /// Count of WAL rows still awaiting delivery.
    pub async fn pending_count(&self) -> Result<usize, ztlctl_store::StoreError> {
        let mut conn = self.store.pool().acquire().await?;
        Ok(queries::events_with_status(&mut conn, &["pending", "failed"]).await?.len())
    }

    async fn run_handlers(&self, kind: EventKind, payload: &serde_json::Value) -> Result<(), String> {
        run_handler_list(&self.handlers, kind, payload).await
    }

    async fn mark(&self, id: i64, status: &str, retries: i64) -> Result<(), ztlctl_store::StoreError> {
        let mut conn = self.store.pool().acquire().await?;
        queries::set_event_status(&mut conn, id, status, retries, Utc::now()).await
    }
}

/// Run one event through the retry state machine until `completed` or
/// `dead_letter`, collecting handler failures as warnings.
async fn run_to_completion(
    store: &Store,
    handlers: &Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    id: i64,
    kind: EventKind,
    payload: &serde_json::Value,
    max_retries: u32,
    warnings: &mut Vec<String>,
) {
    let mut retries: i64 = 0;
    loop {
        if mark_row(store, id, "in_flight", retries).await.is_err() {
            return;
        }
        match run_handler_list(handlers, kind, payload).await {
            Ok(()) => {
                let _ = mark_row(store, id, "completed", retries).await;
                return;
            }
            Err(failure) => {
                warnings.push(failure);
                retries += 1;
                if retries >= max_retries as i64 {
                    let _ = mark_row(store, id, "dead_letter", retries).await;
                    return;
                }
                let _ = mark_row(store, id, "failed", retries).await;
            }
        }
    }
}

async fn run_handler_list(
    handlers: &Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    kind: EventKind,
    payload: &serde_json::Value,
) -> Result<(), String> {
    let snapshot: Vec<Arc<dyn EventHandler>> =
        handlers.read().expect("handler registry lock").clone();
    let mut failures = Vec::new();
    for handler in snapshot {
        if let Err(e) = handler.handle(kind, payload).await {
            failures.push(format!("handler '{}' failed on {}: {}", handler.name(), kind.as_str(), e));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

async fn mark_row(store: &Store, id: i64, status: &str, retries: i64) -> Result<(), ztlctl_store::StoreError> {
    let mut conn = store.pool().acquire().await?;
    queries::set_event_status(&mut conn, id, status, retries, Utc::now()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyHandler {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _kind: EventKind, _payload: &serde_json::Value) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient failure {}", n);
            }
            Ok(())
        }
    }

    async fn bus(sync: bool, max_retries: u32) -> (tempfile::TempDir, Store, EventBus) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let config = EventsConfig { workers: 2, max_retries, sync };
        let bus = EventBus::new(store.clone(), &config);
        (dir, store, bus)
    }

    #[tokio::test]
    async fn test_sync_dispatch_completes_inline() {
        let (_d, store, bus) = bus(true, 3).await;
        let warnings = bus
            .dispatch(EventKind::PostCreate, json!({"id": "ztl_00000001"}), None)
            .await
            .unwrap();
        assert!(warnings.is_empty());
        let mut conn = store.pool().acquire().await.unwrap();
        let done = queries::events_with_status(&mut conn, &["completed"]).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].kind, "post_create");
    }

    #[tokio::test]
    async fn test_wal_row_exists_before_handlers_run() {
        let (_d, store, bus) = bus(false, 3).await;
        bus.dispatch(EventKind::PostInit, json!({}), Some("sess-1")).await.unwrap();
        // Whether or not the worker has run, the row is durable.
        let mut conn = store.pool().acquire().await.unwrap();
        let all = queries::events_with_status(
            &mut conn,
            &["pending", "in_flight", "completed", "failed", "dead_letter"],
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session.as_deref(), Some("sess-1"));
        bus.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_completes() {
        let (_d, _store, bus) = bus(true, 5).await;
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register(Arc::new(FlakyHandler { calls: calls.clone(), fail_first: 2 }));
        let warnings = bus.dispatch(EventKind::PostUpdate, json!({}), None).await.unwrap();
        // Two transient failures became warnings, third attempt succeeded.
        assert_eq!(warnings.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters() {
        let (_d, store, bus) = bus(true, 3).await;
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register(Arc::new(FlakyHandler { calls, fail_first: usize::MAX }));
        let warnings = bus.dispatch(EventKind::PostReweave, json!({}), None).await.unwrap();
        assert_eq!(warnings.len(), 3);
        let mut conn = store.pool().acquire().await.unwrap();
        let dead = queries::events_with_status(&mut conn, &["dead_letter"]).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retries, 3);
    }

    #[tokio::test]
    async fn test_drain_flushes_async_dispatches() {
        let (_d, store, bus) = bus(false, 3).await;
        for _ in 0..5 {
            bus.dispatch(EventKind::PostUpdate, json!({}), None).await.unwrap();
        }
        bus.drain().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        let done = queries::events_with_status(&mut conn, &["completed"]).await.unwrap();
        assert_eq!(done.len(), 5);
        assert_eq!(bus.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_replays_rows_left_by_a_previous_invocation() {
        let (_d, store, bus) = bus(true, 3).await;
        // Simulate a crash that persisted the event but never dispatched it.
        let mut conn = store.pool().acquire().await.unwrap();
        queries::insert_event(&mut conn, "post_create", "{}", None, Utc::now()).await.unwrap();
        drop(conn);
        let report = bus.drain().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.dead_lettered, 0);
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [
            EventKind::PostCreate,
            EventKind::PostUpdate,
            EventKind::PostClose,
            EventKind::PostReweave,
            EventKind::PostSessionStart,
            EventKind::PostSessionClose,
            EventKind::PostCheck,
            EventKind::PostInit,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
    }
}
