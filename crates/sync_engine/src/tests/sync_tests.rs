use super::*;
use shared::domain::{CustomConceptId, DictionaryConceptId, StandardConceptId};
use storage::{SqliteAlignmentStore, SqliteReviewStore};

type Engine = SyncEngine<SqliteAlignmentStore, SqliteReviewStore>;

fn raw(code: &str) -> RawRow {
    let name = format!("Local code {code}");
    RawRow::new([
        ("vocabulary_id", "LOCAL"),
        ("source_code", code),
        ("source_name", name.as_str()),
    ])
}

fn standard(dictionary: i64, target: i64) -> ProposedAssignment {
    ProposedAssignment {
        dictionary_concept_id: Some(dictionary),
        standard_concept_id: Some(target),
        custom_concept_id: None,
    }
}

fn curator() -> UserId {
    UserId::new("curator")
}

async fn engine_with_rows(count: usize) -> (Engine, AlignmentId, Vec<RowId>) {
    let alignments = SqliteAlignmentStore::new("sqlite::memory:").await.expect("alignments");
    let review = SqliteReviewStore::new("sqlite::memory:").await.expect("review");
    let engine = SyncEngine::new(Arc::new(alignments), Arc::new(review));
    let rows = (0..count).map(|i| raw(&format!("L{i}"))).collect();
    let (alignment, row_ids) = engine
        .create_alignment("labs", "", rows)
        .await
        .expect("create");
    (engine, alignment, row_ids)
}

#[tokio::test]
async fn assigning_twice_keeps_one_mapping() {
    let (engine, alignment, rows) = engine_with_rows(2).await;

    let first = engine
        .assign(alignment, rows[0], standard(7, 12345), &curator())
        .await
        .expect("assign");
    let second = engine
        .assign(alignment, rows[0], standard(7, 12345), &curator())
        .await
        .expect("assign again");
    assert_eq!(first, second);

    let mappings = engine.list_mappings(alignment).await.expect("mappings");
    assert_eq!(mappings.len(), 1);
    assert_eq!(
        engine.get_row(alignment, rows[0]).await.expect("row").assignment,
        Some(Assignment::standard(DictionaryConceptId(7), StandardConceptId(12345)))
    );
}

#[tokio::test]
async fn invalid_assignment_leaves_row_untouched() {
    let (engine, alignment, rows) = engine_with_rows(1).await;

    let both_targets = ProposedAssignment {
        dictionary_concept_id: Some(7),
        standard_concept_id: Some(1),
        custom_concept_id: Some(2),
    };
    let error = engine
        .assign(alignment, rows[0], both_targets, &curator())
        .await
        .expect_err("rejected");
    assert!(matches!(error, CoreError::InvalidAssignment(_)));

    let no_dictionary = ProposedAssignment {
        standard_concept_id: Some(1),
        ..ProposedAssignment::default()
    };
    let error = engine
        .assign(alignment, rows[0], no_dictionary, &curator())
        .await
        .expect_err("rejected");
    assert!(matches!(error, CoreError::InvalidAssignment(_)));

    assert_eq!(engine.get_row(alignment, rows[0]).await.expect("row").assignment, None);
    assert_eq!(engine.find_mapping(alignment, rows[0]).await.expect("find"), None);
}

#[tokio::test]
async fn assigning_missing_row_is_not_found() {
    let (engine, alignment, _) = engine_with_rows(1).await;
    let error = engine
        .assign(alignment, RowId(40), standard(7, 1), &curator())
        .await
        .expect_err("missing row");
    assert!(matches!(error, CoreError::NotFound(_)));
    assert!(engine.list_mappings(alignment).await.expect("mappings").is_empty());
}

#[tokio::test]
async fn unassign_missing_row_without_mapping_is_not_found() {
    let (engine, alignment, _) = engine_with_rows(1).await;
    let error = engine
        .unassign(alignment, RowId(9))
        .await
        .expect_err("missing row");
    assert!(matches!(error, CoreError::NotFound(_)));
}

#[tokio::test]
async fn unassign_removes_mapping_of_row_deleted_out_of_band() {
    let (engine, alignment, rows) = engine_with_rows(2).await;
    engine
        .assign(alignment, rows[1], standard(7, 1), &curator())
        .await
        .expect("assign");
    engine
        .alignment_store()
        .delete_rows(alignment, &[rows[1]])
        .await
        .expect("delete");

    engine.unassign(alignment, rows[1]).await.expect("unassign");
    assert_eq!(engine.find_mapping(alignment, rows[1]).await.expect("find"), None);
}

#[tokio::test]
async fn reconcile_heals_each_kind_of_drift() {
    let (engine, alignment, rows) = engine_with_rows(4).await;
    for row in &rows[..3] {
        engine
            .assign(alignment, *row, standard(7, 100), &curator())
            .await
            .expect("assign");
    }

    let store = engine.alignment_store();
    store.delete_rows(alignment, &[rows[0]]).await.expect("delete");
    store.clear_assignment(alignment, rows[1]).await.expect("clear");
    let changed = Assignment::custom(DictionaryConceptId(7), CustomConceptId(5));
    store
        .set_assignment(alignment, rows[2], &changed)
        .await
        .expect("change");
    store
        .set_assignment(alignment, rows[3], &Assignment::dictionary_only(DictionaryConceptId(8)))
        .await
        .expect("assign out of band");

    let report = engine.reconcile(alignment).await.expect("reconcile");
    assert_eq!(
        report,
        ReconcileReport {
            removed_missing_row: 1,
            removed_unassigned: 1,
            updated: 1,
            created: 1,
        }
    );

    let mappings = engine.list_mappings(alignment).await.expect("mappings");
    let rows_mapped: Vec<_> = mappings.iter().map(|m| m.mapping.row_id).collect();
    assert_eq!(rows_mapped, vec![rows[2], rows[3]]);
    assert_eq!(mappings[0].mapping.assignment, changed);
    assert_eq!(mappings[1].mapping.assigned_by, UserId::system());

    assert!(engine.reconcile(alignment).await.expect("again").is_clean());
}

#[tokio::test]
async fn create_alignment_with_bad_rows_creates_nothing() {
    let alignments = SqliteAlignmentStore::new("sqlite::memory:").await.expect("alignments");
    let review = SqliteReviewStore::new("sqlite::memory:").await.expect("review");
    let engine = SyncEngine::new(Arc::new(alignments), Arc::new(review));

    let missing_name = RawRow::new([("vocabulary_id", "LOCAL"), ("source_code", "X")]);
    let error = engine
        .create_alignment("broken", "", vec![raw("A"), missing_name])
        .await
        .expect_err("import fails");
    assert!(matches!(error, CoreError::Import(_)));

    let error = engine
        .create_alignment("empty", "", Vec::new())
        .await
        .expect_err("no rows");
    assert!(matches!(error, CoreError::Import(_)));

    assert!(engine.list_alignments().await.expect("list").is_empty());
}

#[tokio::test]
async fn delete_alignment_drops_its_mappings() {
    let (engine, alignment, rows) = engine_with_rows(2).await;
    engine
        .assign(alignment, rows[0], standard(7, 1), &curator())
        .await
        .expect("assign");

    engine.delete_alignment(alignment).await.expect("delete");
    assert!(engine.list_mappings(alignment).await.expect("mappings").is_empty());
    assert!(matches!(
        engine.get_alignment(alignment).await,
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        engine.delete_alignment(alignment).await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn reconcile_purges_mappings_left_by_interrupted_delete() {
    let (engine, alignment, rows) = engine_with_rows(1).await;
    engine
        .assign(alignment, rows[0], standard(7, 1), &curator())
        .await
        .expect("assign");
    engine.alignment_store().delete(alignment).await.expect("drop table only");

    let report = engine.reconcile(alignment).await.expect("reconcile");
    assert_eq!(report.removed_missing_row, 1);
    assert!(matches!(
        engine.reconcile(alignment).await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn rename_and_describe_alignment() {
    let (engine, alignment, _) = engine_with_rows(1).await;
    engine.rename_alignment(alignment, "chemistry").await.expect("rename");
    engine
        .describe_alignment(alignment, "panel codes")
        .await
        .expect("describe");

    let loaded = engine.get_alignment(alignment).await.expect("alignment");
    assert_eq!(loaded.name, "chemistry");
    assert_eq!(loaded.description, "panel codes");
}

#[tokio::test]
async fn empty_alignment_accepts_rows_later() {
    let alignments = SqliteAlignmentStore::new("sqlite::memory:").await.expect("alignments");
    let review = SqliteReviewStore::new("sqlite::memory:").await.expect("review");
    let engine = SyncEngine::new(Arc::new(alignments), Arc::new(review));

    let alignment = engine
        .create_empty_alignment("later", "rows follow")
        .await
        .expect("create");
    let summaries = engine.list_alignments().await.expect("list");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].row_count, 0);

    let row_ids = engine
        .import_rows(alignment, vec![raw("L1"), raw("L2")])
        .await
        .expect("import");
    assert_eq!(row_ids, vec![RowId(1), RowId(2)]);
}
