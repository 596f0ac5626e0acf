use std::time::Duration;

use super::*;
use shared::domain::StandardConceptId;

fn memory_settings(catalog_path: Option<String>) -> Settings {
    Settings {
        alignment_database_url: "sqlite::memory:".into(),
        review_database_url: "sqlite::memory:".into(),
        catalog_path,
        catalog_timeout_ms: 120,
        ..Settings::default()
    }
}

#[tokio::test]
async fn opens_with_configured_catalog_and_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("vocab.json");
    std::fs::write(
        &path,
        serde_json::json!({
            "standard": [{
                "concept_id": 201826,
                "code": "44054006",
                "name": "Type 2 diabetes mellitus",
                "vocabulary": "SNOMED",
                "is_valid": true,
                "is_standard": true
            }]
        })
        .to_string(),
    )
    .expect("write catalog");

    let state = AppState::open(&memory_settings(Some(path.to_string_lossy().into_owned())))
        .await
        .expect("open");
    assert_eq!(state.resolver.timeout(), Duration::from_millis(120));
    let found = state.resolver.standard(StandardConceptId(201826)).await.found();
    assert_eq!(found.map(|c| c.vocabulary), Some("SNOMED".to_string()));
}

#[tokio::test]
async fn empty_catalog_file_still_opens() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("empty.json");
    std::fs::write(&path, "{}").expect("write catalog");

    let state = AppState::open(&memory_settings(Some(path.to_string_lossy().into_owned())))
        .await
        .expect("open");
    assert!(state
        .resolver
        .standard(StandardConceptId(1))
        .await
        .found()
        .is_none());
}

#[tokio::test]
async fn missing_catalog_file_fails_to_open() {
    let settings = memory_settings(Some("/nonexistent/vocab.json".into()));
    assert!(AppState::open(&settings).await.is_err());
}
