//! Decision lifecycle: acceptance freezes the body; change means
//! supersession.

use std::path::Path;

use anyhow::Result;
use serde_json::Value;
use ztlctl_engine::{CreateRequest, UpdateRequest, Vault};

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

fn decision(title: &str) -> CreateRequest {
    CreateRequest {
        kind: "note".into(),
        subtype: Some("decision".into()),
        title: title.into(),
        topic: Some("architecture".into()),
        sections: vec![
            ("Context".into(), "We need a persistent index.".into()),
            ("Choice".into(), "SQLite with FTS5.".into()),
            ("Rationale".into(), "Single file, zero ops.".into()),
            ("Alternatives".into(), "Postgres, tantivy.".into()),
            ("Consequences".into(), "One writer per vault.".into()),
        ],
        ..CreateRequest::default()
    }
}

#[tokio::test]
async fn test_decision_starts_proposed_with_required_sections() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let created = vault.create(decision("Use SQLite")).await;
    assert!(created.ok, "{:?}", created.error);
    let id = created.data["id"].as_str().unwrap();
    assert_eq!(vault.get(id).await.data["status"], Value::from("proposed"));

    // An explicit body missing required sections is rejected.
    let invalid = vault
        .create(CreateRequest {
            body: Some("Just vibes.".into()),
            sections: Vec::new(),
            ..decision("Use Postgres")
        })
        .await;
    assert!(!invalid.ok);
    assert_eq!(invalid.error.unwrap().code, ztlctl_types::ErrorCode::InvalidInput);
    Ok(())
}

#[tokio::test]
async fn test_accepted_decision_body_is_immutable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let created = vault.create(decision("Use SQLite")).await;
    let id = created.data["id"].as_str().unwrap().to_string();

    let accept = vault
        .update(UpdateRequest { id: id.clone(), status: Some("accepted".into()), ..Default::default() })
        .await;
    assert!(accept.ok, "{:?}", accept.error);

    let body_edit = vault
        .update(UpdateRequest { id: id.clone(), body: Some("rewritten".into()), ..Default::default() })
        .await;
    assert!(!body_edit.ok);
    assert_eq!(body_edit.error.unwrap().code, ztlctl_types::ErrorCode::Immutable);

    // Frontmatter-only updates are still allowed.
    let tag_edit = vault
        .update(UpdateRequest {
            id: id.clone(),
            add_tags: vec!["architecture/storage".into()],
            ..Default::default()
        })
        .await;
    assert!(tag_edit.ok, "{:?}", tag_edit.error);
    Ok(())
}

#[tokio::test]
async fn test_manual_superseded_transition_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let created = vault.create(decision("Use SQLite")).await;
    let id = created.data["id"].as_str().unwrap().to_string();
    vault
        .update(UpdateRequest { id: id.clone(), status: Some("accepted".into()), ..Default::default() })
        .await;

    let manual = vault
        .update(UpdateRequest { id, status: Some("superseded".into()), ..Default::default() })
        .await;
    assert!(!manual.ok);
    assert_eq!(manual.error.unwrap().code, ztlctl_types::ErrorCode::Transition);
    Ok(())
}

#[tokio::test]
async fn test_supersession_creates_pair_and_flips_old_status() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let created = vault.create(decision("Use SQLite")).await;
    let old_id = created.data["id"].as_str().unwrap().to_string();
    vault
        .update(UpdateRequest {
            id: old_id.clone(),
            status: Some("accepted".into()),
            ..Default::default()
        })
        .await;

    let superseded = vault.supersede(&old_id, decision("Use SQLite in WAL mode")).await;
    assert!(superseded.ok, "{:?}", superseded.error);
    let new_id = superseded.data["id"].as_str().unwrap().to_string();
    assert_eq!(superseded.data["supersedes"], Value::from(old_id.clone()));

    let old = vault.get(&old_id).await;
    assert_eq!(old.data["status"], Value::from("superseded"));
    let old_links = old.data["links"].as_array().unwrap();
    assert!(old_links
        .iter()
        .any(|l| l["type"] == "superseded_by" && l["target"] == Value::from(new_id.clone())));

    let new = vault.get(&new_id).await;
    let new_links = new.data["links"].as_array().unwrap();
    assert!(new_links
        .iter()
        .any(|l| l["type"] == "supersedes" && l["target"] == Value::from(old_id.clone())));

    // The decision-support view exposes the chain.
    let support = vault.decision_support(Default::default()).await;
    let rows = support.data["results"].as_array().unwrap();
    let new_row = rows.iter().find(|r| r["id"] == Value::from(new_id.clone())).unwrap();
    assert_eq!(new_row["supersedes"][0], Value::from(old_id.clone()));
    Ok(())
}

#[tokio::test]
async fn test_supersession_of_unaccepted_decision_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let vault = vault(dir.path()).await;

    let created = vault.create(decision("Use SQLite")).await;
    let id = created.data["id"].as_str().unwrap().to_string();
    let premature = vault.supersede(&id, decision("Use something else")).await;
    assert!(!premature.ok);
    assert_eq!(premature.error.unwrap().code, ztlctl_types::ErrorCode::Transition);
    Ok(())
}
