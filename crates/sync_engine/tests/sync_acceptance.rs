use std::{collections::BTreeSet, sync::Arc, time::Duration};

use catalog::{CatalogResolver, StaticCatalog};
use shared::{
    domain::{AlignmentId, ProposedAssignment, RowId, Tally, UserId, Verdict},
    error::CoreError,
    protocol::RawRow,
};
use storage::{AlignmentStore, SqliteAlignmentStore, SqliteReviewStore};
use sync_engine::{EvaluationEngine, SyncEngine};

struct Harness {
    sync: SyncEngine<SqliteAlignmentStore, SqliteReviewStore>,
    evaluations: EvaluationEngine<SqliteReviewStore>,
}

async fn harness() -> Harness {
    let alignments = Arc::new(
        SqliteAlignmentStore::new("sqlite::memory:")
            .await
            .expect("alignments"),
    );
    let review = Arc::new(SqliteReviewStore::new("sqlite::memory:").await.expect("review"));
    Harness {
        sync: SyncEngine::new(alignments, Arc::clone(&review)),
        evaluations: EvaluationEngine::new(review),
    }
}

fn rows(codes: &[&str]) -> Vec<RawRow> {
    codes
        .iter()
        .map(|code| {
            RawRow::new([
                ("vocabulary_id", "HOSP"),
                ("source_code", *code),
                ("source_name", *code),
            ])
        })
        .collect()
}

fn proposed(dictionary: i64, standard: Option<i64>) -> ProposedAssignment {
    ProposedAssignment {
        dictionary_concept_id: Some(dictionary),
        standard_concept_id: standard,
        custom_concept_id: None,
    }
}

async fn assigned_rows(harness: &Harness, alignment: AlignmentId, all: &[RowId]) -> BTreeSet<RowId> {
    let mut assigned = BTreeSet::new();
    for row_id in all {
        if let Some(row) = harness
            .sync
            .alignment_store()
            .find_row(alignment, *row_id)
            .await
            .expect("row")
        {
            if row.assignment.is_some() {
                assigned.insert(*row_id);
            }
        }
    }
    assigned
}

async fn mapped_rows(harness: &Harness, alignment: AlignmentId) -> BTreeSet<RowId> {
    harness
        .sync
        .list_mappings(alignment)
        .await
        .expect("mappings")
        .into_iter()
        .map(|summary| summary.mapping.row_id)
        .collect()
}

#[tokio::test]
async fn assign_vote_unassign_walkthrough() {
    let harness = harness().await;
    let (alignment, row_ids) = harness
        .sync
        .create_alignment("meds", "", rows(&["M1", "M2", "M3"]))
        .await
        .expect("create");
    let row2 = row_ids[1];

    let mapping = harness
        .sync
        .assign(alignment, row2, proposed(7, Some(12345)), &UserId::new("curator"))
        .await
        .expect("assign");
    assert_eq!(
        harness.evaluations.tally(mapping).await.expect("tally"),
        Tally::default()
    );

    harness
        .evaluations
        .vote(mapping, &UserId::new("alice"), Verdict::Approved)
        .await
        .expect("vote");
    assert_eq!(
        harness.evaluations.tally(mapping).await.expect("tally"),
        Tally {
            approved: 1,
            rejected: 0,
            uncertain: 0,
        }
    );

    harness.sync.unassign(alignment, row2).await.expect("unassign");
    assert_eq!(harness.sync.find_mapping(alignment, row2).await.expect("find"), None);
    assert!(matches!(
        harness.evaluations.evaluations(mapping).await,
        Err(CoreError::NotFound(_))
    ));
    assert_eq!(
        harness.sync.get_row(alignment, row2).await.expect("row").assignment,
        None
    );
}

#[tokio::test]
async fn row_deleted_out_of_band_loses_mapping_and_votes_on_reconcile() {
    let harness = harness().await;
    let (alignment, row_ids) = harness
        .sync
        .create_alignment("meds", "", rows(&["M1", "M2", "M3"]))
        .await
        .expect("create");
    let row3 = row_ids[2];
    let mapping = harness
        .sync
        .assign(alignment, row3, proposed(7, None), &UserId::new("curator"))
        .await
        .expect("assign");
    harness
        .evaluations
        .comment(mapping, &UserId::new("alice"), "looks right")
        .await
        .expect("comment");

    harness
        .sync
        .alignment_store()
        .delete_rows(alignment, &[row3])
        .await
        .expect("delete");
    let report = harness.sync.reconcile(alignment).await.expect("reconcile");
    assert_eq!(report.removed_missing_row, 1);
    assert_eq!(harness.sync.find_mapping(alignment, row3).await.expect("find"), None);
    assert!(matches!(
        harness.evaluations.tally(mapping).await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn dictionary_only_row_exports_zero_target() {
    let harness = harness().await;
    let (alignment, row_ids) = harness
        .sync
        .create_alignment("meds", "", rows(&["M1"]))
        .await
        .expect("create");
    harness
        .sync
        .assign(alignment, row_ids[0], proposed(7, None), &UserId::new("curator"))
        .await
        .expect("assign");

    let resolver = CatalogResolver::new(Arc::new(StaticCatalog::new()), Duration::from_millis(100));
    let csv = harness
        .sync
        .export_csv(alignment, &resolver)
        .await
        .expect("export");
    let line = csv.lines().nth(1).expect("one record");
    let fields: Vec<_> = line.split(',').collect();
    assert_eq!(fields[0], "M1");
    assert_eq!(fields[3], "0");
    assert_eq!(fields[6], "2099-12-31");
}

#[tokio::test]
async fn assigned_rows_match_mappings_after_mixed_operations() {
    let harness = harness().await;
    let codes: Vec<String> = (0..12).map(|i| format!("S{i}")).collect();
    let code_refs: Vec<&str> = codes.iter().map(String::as_str).collect();
    let (alignment, row_ids) = harness
        .sync
        .create_alignment("mixed", "", rows(&code_refs))
        .await
        .expect("create");

    let user = UserId::new("curator");
    for (step, row_id) in row_ids.iter().cycle().take(40).enumerate() {
        match step % 5 {
            0 | 2 => {
                harness
                    .sync
                    .assign(alignment, *row_id, proposed(step as i64 + 1, Some(900)), &user)
                    .await
                    .expect("assign");
            }
            3 => {
                harness
                    .sync
                    .assign(alignment, *row_id, proposed(3, None), &user)
                    .await
                    .expect("assign");
            }
            _ => {
                let _ = harness.sync.unassign(alignment, *row_id).await;
            }
        }
        assert_eq!(
            assigned_rows(&harness, alignment, &row_ids).await,
            mapped_rows(&harness, alignment).await
        );
    }
    assert!(harness.sync.reconcile(alignment).await.expect("reconcile").is_clean());
}

#[tokio::test]
async fn concurrent_assigns_on_different_rows_all_land() {
    let harness = harness().await;
    let codes: Vec<String> = (0..16).map(|i| format!("P{i}")).collect();
    let code_refs: Vec<&str> = codes.iter().map(String::as_str).collect();
    let (alignment, row_ids) = harness
        .sync
        .create_alignment("parallel", "", rows(&code_refs))
        .await
        .expect("create");

    let tasks: Vec<_> = row_ids
        .iter()
        .map(|row_id| {
            let sync = harness.sync.clone();
            let row_id = *row_id;
            tokio::spawn(async move {
                sync.assign(alignment, row_id, proposed(5, Some(row_id.0)), &UserId::new("bulk"))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("assign");
    }

    assert_eq!(mapped_rows(&harness, alignment).await.len(), row_ids.len());
    assert!(harness.sync.reconcile(alignment).await.expect("reconcile").is_clean());
}
