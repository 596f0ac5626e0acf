use super::*;
use shared::domain::{AlignmentId, Assignment, DictionaryConceptId, RowId};
use storage::{ReviewStore, SqliteReviewStore};

async fn engine_with_mapping() -> (EvaluationEngine<SqliteReviewStore>, MappingId) {
    let store = SqliteReviewStore::new("sqlite::memory:").await.expect("db");
    let mapping_id = store
        .upsert_mapping(
            AlignmentId(1),
            RowId(1),
            &Assignment::dictionary_only(DictionaryConceptId(3)),
            &UserId::new("curator"),
        )
        .await
        .expect("mapping");
    (EvaluationEngine::new(Arc::new(store)), mapping_id)
}

#[tokio::test]
async fn evaluators_tally_independently() {
    let (engine, mapping) = engine_with_mapping().await;
    let u1 = UserId::new("u1");
    let u2 = UserId::new("u2");

    engine.vote(mapping, &u1, Verdict::Approved).await.expect("u1");
    engine.vote(mapping, &u2, Verdict::Rejected).await.expect("u2");
    engine.vote(mapping, &u1, Verdict::Uncertain).await.expect("u1 again");
    assert_eq!(
        engine.tally(mapping).await.expect("tally"),
        Tally {
            approved: 0,
            rejected: 1,
            uncertain: 1,
        }
    );

    engine.clear(mapping, &u1).await.expect("clear");
    assert_eq!(
        engine.tally(mapping).await.expect("tally"),
        Tally {
            approved: 0,
            rejected: 1,
            uncertain: 0,
        }
    );
    let remaining = engine.evaluations(mapping).await.expect("evaluations");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].evaluator_id, u2);
}

#[tokio::test]
async fn comment_and_verdict_do_not_overwrite_each_other() {
    let (engine, mapping) = engine_with_mapping().await;
    let alice = UserId::new("alice");

    engine
        .comment(mapping, &alice, "check the strength")
        .await
        .expect("comment");
    let evaluations = engine.evaluations(mapping).await.expect("evaluations");
    assert_eq!(evaluations[0].verdict, None);

    engine.vote(mapping, &alice, Verdict::Approved).await.expect("vote");
    let evaluations = engine.evaluations(mapping).await.expect("evaluations");
    assert_eq!(evaluations[0].verdict, Some(Verdict::Approved));
    assert_eq!(evaluations[0].comment.as_deref(), Some("check the strength"));

    engine.clear(mapping, &alice).await.expect("clear");
    assert!(engine.evaluations(mapping).await.expect("evaluations").is_empty());
}

#[tokio::test]
async fn missing_mapping_is_not_found_everywhere() {
    let (engine, _) = engine_with_mapping().await;
    let ghost = MappingId(404);
    let bob = UserId::new("bob");

    assert!(matches!(
        engine.vote(ghost, &bob, Verdict::Approved).await,
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        engine.comment(ghost, &bob, "hm").await,
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(engine.clear(ghost, &bob).await, Err(CoreError::NotFound(_))));
    assert!(matches!(engine.tally(ghost).await, Err(CoreError::NotFound(_))));
    assert!(matches!(
        engine.evaluations(ghost).await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn clearing_without_an_evaluation_is_a_no_op() {
    let (engine, mapping) = engine_with_mapping().await;
    engine
        .clear(mapping, &UserId::new("nobody"))
        .await
        .expect("clear");
    assert_eq!(engine.tally(mapping).await.expect("tally"), Tally::default());
}
