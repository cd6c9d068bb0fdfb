//! Session services: start, log append, brief, cost, and the close
//! pipeline.
//!
//! Close is a sync barrier: **Log Close → Cross-session Reweave → Orphan
//! Sweep → Integrity Check → Drain Event WAL → Report**. The function does
//! not return until the WAL is drained.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use ztlctl_events::EventKind;
use ztlctl_store::queries;
use ztlctl_store::StoreError;
use ztlctl_types::ServiceResult;

use crate::{respond, EngineError, Vault};

/// Input to `session.log`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionLogRequest {
    /// Session to append to.
    pub session: String,
    /// Entry kind: `log`, `checkpoint`, `decision-made`, ...
    pub entry_kind: String,
    /// One-line summary.
    pub summary: String,
    /// Optional full detail.
    pub detail: Option<String>,
    /// Pinned entries survive every context reduction.
    pub pinned: bool,
    /// Referenced node ids.
    pub refs: Vec<String>,
    /// Free-form metadata.
    pub meta: Option<Value>,
}

/// Approximate token cost of a text (chars / 4, rounded up).
pub(crate) fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() as i64 + 3) / 4
}

impl Vault {
    /// Start a new session; returns its identifier.
    pub async fn session_start(&self) -> ServiceResult {
        respond("session.start", self.session_start_inner().await)
    }

    /// Append one entry to a session log.
    pub async fn session_log(&self, request: SessionLogRequest) -> ServiceResult {
        respond("session.log", self.session_log_inner(request).await)
    }

    /// Close a session: reweave, sweep orphans, check integrity, drain.
    pub async fn session_close(&self, session: &str) -> ServiceResult {
        respond("session.close", self.session_close_inner(session).await)
    }

    /// Compact view of a session: pinned entries plus the latest activity.
    pub async fn session_brief(&self, session: &str) -> ServiceResult {
        respond("session.brief", self.session_brief_inner(session).await)
    }

    /// Token-cost accounting for a session.
    pub async fn session_cost(&self, session: &str) -> ServiceResult {
        respond("session.cost", self.session_cost_inner(session).await)
    }

    async fn session_start_inner(&self) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();
        let mut txn = crate::txn::VaultTxn::begin(self).await?;
        let session = format!("sess-{:04}", queries::next_counter(txn.conn(), "SESS").await?);
        queries::append_session_entry(
            txn.conn(),
            &session,
            "session-started",
            "session started",
            None,
            estimate_tokens("session started"),
            false,
            &[],
            &Value::Null,
            Utc::now(),
        )
        .await?;
        txn.commit().await?;
        info!(%session, "session started");
        self.emit(
            EventKind::PostSessionStart,
            serde_json::json!({"session": session}),
            Some(&session),
            &mut warnings,
        )
        .await;
        Ok((ztlctl_types::result_map! {"session" => session}, warnings))
    }

    async fn session_log_inner(&self, request: SessionLogRequest) -> crate::PipelineOutcome {
        if request.session.is_empty() {
            return Err(EngineError::InvalidInput("session is required".to_string()));
        }
        if request.summary.trim().is_empty() {
            return Err(EngineError::InvalidInput("summary must not be empty".to_string()));
        }
        let entry_kind = if request.entry_kind.is_empty() { "log" } else { &request.entry_kind };
        let tokens = estimate_tokens(&request.summary)
            + request.detail.as_deref().map(estimate_tokens).unwrap_or(0);

        let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
        let id = queries::append_session_entry(
            &mut conn,
            &request.session,
            entry_kind,
            &request.summary,
            request.detail.as_deref(),
            tokens,
            request.pinned,
            &request.refs,
            request.meta.as_ref().unwrap_or(&Value::Null),
            Utc::now(),
        )
        .await?;
        let data = ztlctl_types::result_map! {
            "id" => id,
            "session" => request.session,
            "kind" => entry_kind,
            "tokens" => tokens,
        };
        Ok((data, Vec::new()))
    }

    async fn session_close_inner(&self, session: &str) -> crate::PipelineOutcome {
        let mut warnings = Vec::new();

        // Log Close.
        {
            let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
            queries::append_session_entry(
                &mut conn,
                session,
                "session-closed",
                "session closed",
                None,
                estimate_tokens("session closed"),
                false,
                &[],
                &Value::Null,
                Utc::now(),
            )
            .await?;
        }

        // Cross-session Reweave over content this session produced.
        let session_nodes: Vec<String> = {
            let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
            queries::all_nodes(&mut conn)
                .await?
                .into_iter()
                .filter(|n| {
                    n.session.as_deref() == Some(session)
                        && n.kind.uses_content_hash()
                        && !n.archived
                })
                .map(|n| n.id)
                .collect()
        };
        let mut reweave_added = 0u64;
        for id in &session_nodes {
            let (data, w) = self.reweave_one_inner(id, false, None).await?;
            reweave_added += data.get("added").and_then(Value::as_u64).unwrap_or(0);
            warnings.extend(w);
        }

        // Orphan Sweep at the lower threshold.
        let orphan_threshold = self.config().reweave.orphan_threshold;
        let orphans: Vec<String> = {
            let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
            let mut out = Vec::new();
            for node in queries::all_nodes(&mut conn).await? {
                if node.kind.uses_content_hash()
                    && !node.archived
                    && queries::out_degree(&mut conn, &node.id).await? == 0
                {
                    out.push(node.id);
                }
            }
            out
        };
        let mut orphans_connected = 0u64;
        for id in &orphans {
            let (data, w) = self.reweave_one_inner(id, false, Some(orphan_threshold)).await?;
            orphans_connected += data.get("added").and_then(Value::as_u64).unwrap_or(0);
            warnings.extend(w);
        }

        // Integrity Check (report only).
        let check = self.check_report().await?;
        let check_summary = serde_json::json!({
            "issues": check.issues.len(),
            "ok": check.issues.is_empty(),
        });

        // Drain Event WAL. The close event itself is persisted first so the
        // drain barrier flushes it too.
        self.emit(
            EventKind::PostSessionClose,
            serde_json::json!({"session": session}),
            Some(session),
            &mut warnings,
        )
        .await;
        let drain = self.events().drain().await.map_err(EngineError::from)?;
        warnings.extend(drain.warnings.clone());

        info!(%session, reweave_added, orphans = orphans.len(), "session closed");
        let data = ztlctl_types::result_map! {
            "session" => session,
            "reweave" => serde_json::json!({
                "sources": session_nodes.len(),
                "added": reweave_added,
            }),
            "orphans" => serde_json::json!({
                "swept": orphans.len(),
                "connected": orphans_connected,
            }),
            "check" => check_summary,
            "drain" => serde_json::json!({
                "completed": drain.completed,
                "dead_lettered": drain.dead_lettered,
            }),
        };
        Ok((data, warnings))
    }

    async fn session_brief_inner(&self, session: &str) -> crate::PipelineOutcome {
        let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
        let entries = queries::session_entries(&mut conn, session).await?;
        if entries.is_empty() {
            return Err(EngineError::NotFound(format!("session '{}' has no entries", session)));
        }
        let pinned: Vec<Value> = entries
            .iter()
            .filter(|e| e.pinned)
            .map(|e| serde_json::json!({"id": e.id, "summary": e.summary, "kind": e.entry_kind}))
            .collect();
        let recent: Vec<Value> = entries
            .iter()
            .rev()
            .take(10)
            .map(|e| {
                serde_json::json!({
                    "id": e.id, "kind": e.entry_kind, "summary": e.summary,
                    "pinned": e.pinned, "refs": e.refs,
                })
            })
            .collect();
        let data = ztlctl_types::result_map! {
            "session" => session,
            "entries" => entries.len(),
            "pinned" => pinned,
            "recent" => recent,
        };
        Ok((data, Vec::new()))
    }

    async fn session_cost_inner(&self, session: &str) -> crate::PipelineOutcome {
        let mut conn = self.store().pool().acquire().await.map_err(StoreError::from)?;
        let entries = queries::session_entries(&mut conn, session).await?;
        let total: i64 = entries.iter().map(|e| e.tokens).sum();
        let mut by_kind: Vec<(String, i64)> = Vec::new();
        for entry in &entries {
            match by_kind.iter_mut().find(|(k, _)| *k == entry.entry_kind) {
                Some((_, tokens)) => *tokens += entry.tokens,
                None => by_kind.push((entry.entry_kind.clone(), entry.tokens)),
            }
        }
        let breakdown: Vec<Value> = by_kind
            .iter()
            .map(|(kind, tokens)| serde_json::json!({"kind": kind, "tokens": tokens}))
            .collect();
        let data = ztlctl_types::result_map! {
            "session" => session,
            "entries" => entries.len(),
            "total_tokens" => total,
            "by_kind" => breakdown,
        };
        Ok((data, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
