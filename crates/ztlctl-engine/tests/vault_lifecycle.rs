//! End-to-end lifecycle tests: create, collide, update, archive, protect.

use std::path::Path;

use anyhow::Result;
use serde_json::Value;
use ztlctl_engine::{CreateRequest, QueryFilter, UpdateRequest, Vault};
use ztlctl_types::Frontmatter;

async fn vault(dir: &Path) -> Vault {
    let init = Vault::init(dir).await;
    assert!(init.ok, "init failed: {:?}", init.error);
    let mut vault = Vault::open(dir).await.unwrap();
    let mut config = vault.config().clone();
    config.events.sync = true;
    config.reweave.auto = false;
    vault.set_config(config);
    vault
}

fn note(title: &str) -> CreateRequest {
    CreateRequest {
        kind: "note".into(),
        title: title.into(),
        topic: Some("ml".into()),
        tags: vec!["ml/architecture".into()],
        ..CreateRequest::default()
    }
}

#[tokio::test]
async fn test_create_note_happy_path() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let result = vault.create(note("Transformer Architectures")).await;
    assert!(result.ok, "{:?}", result.error);
    let id = result.data["id"].as_str().unwrap();
    assert!(id.starts_with("ztl_") && id.len() == 12);
    assert_eq!(result.data["type"], Value::from("note"));

    // The file exists at the reported path and parses with a draft status.
    let path = result.data["path"].as_str().unwrap();
    let document = std::fs::read_to_string(dir.path().join(path))?;
    let (fm, _) = Frontmatter::parse_document(&document)?;
    assert_eq!(fm.id, id);
    assert_eq!(fm.status, "draft");
    Ok(())
}

#[tokio::test]
async fn test_title_collision_is_a_conflict_with_detail() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let first = vault.create(note("Transformer Architectures")).await;
    assert!(first.ok);
    let existing_id = first.data["id"].as_str().unwrap().to_string();

    let second = vault.create(note("Transformer Architectures")).await;
    assert!(!second.ok);
    let error = second.error.unwrap();
    assert_eq!(error.code, ztlctl_types::ErrorCode::Conflict);
    assert_eq!(error.detail["existing_id"], Value::from(existing_id));
    assert_eq!(error.detail["existing_title"], Value::from("Transformer Architectures"));
    Ok(())
}

#[tokio::test]
async fn test_hash_stability_across_spellings() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    assert!(vault.create(note("Café — Notes!")).await.ok);
    let clash = vault.create(note("  Café   notes")).await;
    assert!(!clash.ok);
    assert_eq!(clash.error.unwrap().code, ztlctl_types::ErrorCode::Conflict);
    Ok(())
}

#[tokio::test]
async fn test_unknown_type_returns_failure_never_panics() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let result = vault
        .create(CreateRequest { kind: "recipe".into(), title: "Soup".into(), ..Default::default() })
        .await;
    assert!(!result.ok);
    assert_eq!(result.error.unwrap().code, ztlctl_types::ErrorCode::InvalidInput);
    Ok(())
}

#[tokio::test]
async fn test_sequential_ids_are_monotonic() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let first = vault
        .create(CreateRequest { kind: "task".into(), title: "First".into(), ..Default::default() })
        .await;
    let second = vault
        .create(CreateRequest { kind: "task".into(), title: "Second".into(), ..Default::default() })
        .await;
    assert_eq!(first.data["id"], Value::from("TASK-0001"));
    assert_eq!(second.data["id"], Value::from("TASK-0002"));
    Ok(())
}

#[tokio::test]
async fn test_unscoped_tag_warns_but_creates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let result = vault
        .create(CreateRequest {
            kind: "note".into(),
            title: "Untidy tags".into(),
            tags: vec!["misc".into()],
            ..Default::default()
        })
        .await;
    assert!(result.ok);
    assert!(result.warnings.iter().any(|w| w.contains("misc")));
    Ok(())
}

#[tokio::test]
async fn test_note_status_follows_outgoing_edges() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    for title in ["Alpha", "Beta", "Gamma"] {
        assert!(vault.create(note(title)).await.ok);
    }
    let hub = vault
        .create(CreateRequest {
            links: vec!["Alpha".into(), "Beta".into(), "Gamma".into()],
            ..note("Hub note")
        })
        .await;
    assert!(hub.ok);
    let id = hub.data["id"].as_str().unwrap();

    let fetched = vault.get(id).await;
    assert_eq!(fetched.data["status"], Value::from("connected"));

    // A body edit re-extracts links; the frontmatter links persist, so the
    // status stays connected and the machine recompute is a no-op.
    let edited = vault
        .update(UpdateRequest {
            id: id.to_string(),
            body: Some("Still about [[Alpha]].".into()),
            ..Default::default()
        })
        .await;
    assert!(edited.ok, "{:?}", edited.error);
    assert_eq!(vault.get(id).await.data["status"], Value::from("connected"));
    Ok(())
}

#[tokio::test]
async fn test_task_transition_table_is_enforced() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let task = vault
        .create(CreateRequest { kind: "task".into(), title: "Ship it".into(), ..Default::default() })
        .await;
    let id = task.data["id"].as_str().unwrap().to_string();

    let to_active = vault
        .update(UpdateRequest { id: id.clone(), status: Some("active".into()), ..Default::default() })
        .await;
    assert!(to_active.ok);

    // inbox -> done is not in the table; neither is re-entering from done.
    let task2 = vault
        .create(CreateRequest { kind: "task".into(), title: "Another".into(), ..Default::default() })
        .await;
    let id2 = task2.data["id"].as_str().unwrap().to_string();
    let illegal = vault
        .update(UpdateRequest { id: id2, status: Some("done".into()), ..Default::default() })
        .await;
    assert!(!illegal.ok);
    assert_eq!(illegal.error.unwrap().code, ztlctl_types::ErrorCode::Transition);
    Ok(())
}

#[tokio::test]
async fn test_garden_protection_rejects_body_with_warning() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let created = vault.create(note("Garden note")).await;
    let id = created.data["id"].as_str().unwrap().to_string();
    let path = created.data["path"].as_str().unwrap().to_string();

    let promote = vault
        .update(UpdateRequest { id: id.clone(), maturity: Some("seed".into()), ..Default::default() })
        .await;
    assert!(promote.ok);

    let before = std::fs::read_to_string(dir.path().join(&path))?;
    let attempt = vault
        .update(UpdateRequest {
            id: id.clone(),
            body: Some("machine overwrite".into()),
            ..Default::default()
        })
        .await;
    // Not a hard error: the update succeeds, the body change is rejected.
    assert!(attempt.ok);
    assert!(attempt.warnings.iter().any(|w| w.contains("human-owned")));
    let after = std::fs::read_to_string(dir.path().join(&path))?;
    let (_, body_before) = Frontmatter::parse_document(&before)?;
    let (_, body_after) = Frontmatter::parse_document(&after)?;
    assert_eq!(body_before, body_after);
    Ok(())
}

#[tokio::test]
async fn test_archive_keeps_file_and_edges() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    assert!(vault.create(note("Target")).await.ok);
    let source = vault.create(CreateRequest { links: vec!["Target".into()], ..note("Source") }).await;
    let id = source.data["id"].as_str().unwrap().to_string();
    let path = source.data["path"].as_str().unwrap().to_string();

    let archived = vault.archive(&id, None).await;
    assert!(archived.ok);
    assert!(dir.path().join(&path).exists());

    // Edges survive; default listings hide the node, --archived shows it.
    let fetched = vault.get(&id).await;
    assert_eq!(fetched.data["archived"], Value::from(true));
    assert_eq!(fetched.data["links"].as_array().unwrap().len(), 1);

    let hidden = vault.list(QueryFilter { kind: Some("note".into()), ..Default::default() }).await;
    let shown: Vec<&str> = hidden.data["results"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v["id"].as_str())
        .collect();
    assert!(!shown.contains(&id.as_str()));

    let with_archived = vault
        .list(QueryFilter { kind: Some("note".into()), include_archived: true, ..Default::default() })
        .await;
    let shown: Vec<&str> = with_archived.data["results"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v["id"].as_str())
        .collect();
    assert!(shown.contains(&id.as_str()));
    Ok(())
}

#[tokio::test]
async fn test_identifier_survives_rename_and_archive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let created = vault.create(note("Original title")).await;
    let id = created.data["id"].as_str().unwrap().to_string();

    let renamed = vault
        .update(UpdateRequest { id: id.clone(), title: Some("Renamed".into()), ..Default::default() })
        .await;
    assert!(renamed.ok);
    assert!(vault.archive(&id, None).await.ok);

    let fetched = vault.get(&id).await;
    assert!(fetched.ok);
    assert_eq!(fetched.data["title"], Value::from("Renamed"));
    assert_eq!(fetched.data["id"], Value::from(id));
    Ok(())
}
