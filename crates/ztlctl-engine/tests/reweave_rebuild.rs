//! Reweave idempotence and undo, rebuild equivalence, work-queue ranking.

use std::path::Path;

use anyhow::Result;
use serde_json::Value;
use ztlctl_engine::{CreateRequest, QueryFilter, Vault};
use ztlctl_store::queries;

async fn vault(dir: &Path) -> Vault {
    let init = Vault::init(dir).await;
    assert!(init.ok, "init failed: {:?}", init.error);
    open_quiet(dir).await
}

async fn open_quiet(dir: &Path) -> Vault {
    let mut vault = Vault::open(dir).await.unwrap();
    let mut config = vault.config().clone();
    config.events.sync = true;
    config.reweave.auto = false;
    config.reweave.min_score_threshold = 0.3;
    vault.set_config(config);
    vault
}

async fn seed_related_notes(vault: &Vault, count: usize) -> Vec<String> {
    let mut ids = Vec::new();
    for i in 0..count {
        let result = vault
            .create(CreateRequest {
                kind: "note".into(),
                title: format!("Attention mechanisms part {}", i + 1),
                topic: Some("ml".into()),
                tags: vec!["ml/attention".into()],
                body: Some("Transformers route information through attention heads.".into()),
                ..CreateRequest::default()
            })
            .await;
        assert!(result.ok, "{:?}", result.error);
        ids.push(result.data["id"].as_str().unwrap().to_string());
    }
    ids
}

async fn edge_set(vault: &Vault) -> Vec<(String, String, String)> {
    let mut conn = vault.store().pool().acquire().await.unwrap();
    queries::all_edges(&mut conn)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.source_id, e.target_id, e.edge_type))
        .collect()
}

#[tokio::test]
async fn test_reweave_connects_then_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;
    let ids = seed_related_notes(&vault, 10).await;

    let first = vault.reweave(Some(&ids[0]), false).await;
    assert!(first.ok, "{:?}", first.error);
    let added = first.data["added"].as_u64().unwrap();
    assert!(added > 0, "expected new edges, got {:?}", first.data);
    assert!(added <= vault.config().reweave.max_links_per_note as u64);

    let after_first = edge_set(&vault).await;
    let second = vault.reweave(Some(&ids[0]), false).await;
    assert!(second.ok, "{:?}", second.error);
    assert_eq!(second.data["added"].as_u64(), Some(0));
    assert!(second.warnings.iter().all(|w| !w.contains("stale")));
    assert_eq!(edge_set(&vault).await, after_first);
    Ok(())
}

#[tokio::test]
async fn test_reweave_dry_run_commits_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;
    let ids = seed_related_notes(&vault, 5).await;

    let before = edge_set(&vault).await;
    let preview = vault.reweave(Some(&ids[0]), true).await;
    assert!(preview.ok);
    assert_eq!(preview.data["dry_run"], Value::from(true));
    assert!(!preview.data["candidates"].as_array().unwrap().is_empty());
    assert_eq!(edge_set(&vault).await, before);
    Ok(())
}

#[tokio::test]
async fn test_reweave_undo_restores_the_edge_set() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;
    let ids = seed_related_notes(&vault, 8).await;

    let before = edge_set(&vault).await;
    let run = vault.reweave(Some(&ids[0]), false).await;
    assert!(run.ok);
    assert!(run.data["added"].as_u64().unwrap() > 0);
    assert_ne!(edge_set(&vault).await, before);

    let undo = vault.reweave_undo(None).await;
    assert!(undo.ok, "{:?}", undo.error);
    assert_eq!(edge_set(&vault).await, before);

    // A second undo of the same batch is refused.
    let batch = undo.data["batch"].as_i64().unwrap();
    let twice = vault.reweave_undo(Some(batch)).await;
    assert!(!twice.ok);
    Ok(())
}

#[tokio::test]
async fn test_garden_source_gets_no_body_wikilinks() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;
    let ids = seed_related_notes(&vault, 6).await;

    let promote = vault
        .update(ztlctl_engine::UpdateRequest {
            id: ids[0].clone(),
            maturity: Some("evergreen".into()),
            ..Default::default()
        })
        .await;
    assert!(promote.ok);
    let path = vault.get(&ids[0]).await.data["path"].as_str().unwrap().to_string();
    let body_before = std::fs::read_to_string(dir.path().join(&path))?;

    let run = vault.reweave(Some(&ids[0]), false).await;
    assert!(run.ok, "{:?}", run.error);
    assert!(run.data["added"].as_u64().unwrap() > 0);

    // Frontmatter links were added; body bytes carry no injected wikilinks.
    let after = std::fs::read_to_string(dir.path().join(&path))?;
    let (fm, body) = ztlctl_types::Frontmatter::parse_document(&after)?;
    assert!(fm.links.iter().any(|(t, targets)| t == "relates" && !targets.is_empty()));
    assert!(!body.contains("## Related"));
    let (_, original_body) = ztlctl_types::Frontmatter::parse_document(&body_before)?;
    assert_eq!(body, original_body);
    Ok(())
}

#[tokio::test]
async fn test_rebuild_reproduces_nodes_and_edges() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    // A mixed vault: linked notes, a reference, a task, a log.
    let ids = seed_related_notes(&vault, 5).await;
    assert!(vault.reweave(Some(&ids[0]), false).await.ok);
    assert!(vault
        .create(CreateRequest {
            kind: "reference".into(),
            subtype: Some("paper".into()),
            title: "Attention Is All You Need".into(),
            topic: Some("ml".into()),
            links: vec![ids[0].clone()],
            ..Default::default()
        })
        .await
        .ok);
    assert!(vault
        .create(CreateRequest { kind: "task".into(), title: "Summarize".into(), ..Default::default() })
        .await
        .ok);
    assert!(vault
        .create(CreateRequest { kind: "log".into(), title: "Week 31".into(), ..Default::default() })
        .await
        .ok);

    let nodes_before: Vec<(String, String, String, bool)> = {
        let mut conn = vault.store().pool().acquire().await.unwrap();
        queries::all_nodes(&mut conn)
            .await?
            .into_iter()
            .map(|n| (n.id, n.status, n.path, n.archived))
            .collect()
    };
    let edges_before = edge_set(&vault).await;
    vault.store().close().await;

    // Lose the index entirely; files are the only survivors.
    std::fs::remove_file(dir.path().join(".ztlctl/ztlctl.db"))?;
    for suffix in ["-wal", "-shm"] {
        let _ = std::fs::remove_file(dir.path().join(format!(".ztlctl/ztlctl.db{}", suffix)));
    }

    let vault = open_quiet(dir.path()).await;
    let rebuilt = vault.rebuild().await;
    assert!(rebuilt.ok, "{:?}", rebuilt.error);

    let nodes_after: Vec<(String, String, String, bool)> = {
        let mut conn = vault.store().pool().acquire().await.unwrap();
        queries::all_nodes(&mut conn)
            .await?
            .into_iter()
            .map(|n| (n.id, n.status, n.path, n.archived))
            .collect()
    };
    assert_eq!(nodes_before, nodes_after);
    assert_eq!(edges_before, edge_set(&vault).await);

    // Sequential counters resume past the rebuilt high-water mark.
    let next_task = vault
        .create(CreateRequest { kind: "task".into(), title: "After rebuild".into(), ..Default::default() })
        .await;
    assert_eq!(next_task.data["id"], Value::from("TASK-0002"));
    Ok(())
}

#[tokio::test]
async fn test_work_queue_order_and_scores() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let specs = [
        ("Critical fix", "high", "high", "low"),
        ("Routine chore", "medium", "medium", "medium"),
        ("Someday maybe", "low", "low", "high"),
    ];
    for (title, priority, impact, effort) in specs {
        let result = vault
            .create(CreateRequest {
                kind: "task".into(),
                title: title.into(),
                meta: vec![
                    ("priority".into(), priority.into()),
                    ("impact".into(), impact.into()),
                    ("effort".into(), effort.into()),
                ],
                ..Default::default()
            })
            .await;
        assert!(result.ok, "{:?}", result.error);
    }

    let queue = vault.work_queue().await;
    let rows = queue.data["results"].as_array().unwrap();
    let titles: Vec<&str> = rows.iter().map(|r| r["title"].as_str().unwrap()).collect();
    assert_eq!(titles, vec!["Critical fix", "Routine chore", "Someday maybe"]);
    let scores: Vec<f64> = rows.iter().map(|r| r["score"].as_f64().unwrap()).collect();
    assert_eq!(scores, vec![10.5, 6.5, 2.5]);

    // `list --sort priority` returns the same order.
    let listed = vault
        .list(QueryFilter {
            kind: Some("task".into()),
            sort: Some("priority".into()),
            ..Default::default()
        })
        .await;
    let listed_titles: Vec<&str> = listed.data["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["title"].as_str().unwrap())
        .collect();
    assert_eq!(listed_titles, vec!["Critical fix", "Routine chore", "Someday maybe"]);
    Ok(())
}
