use std::{sync::Arc, time::Duration};

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{
        Alignment, AlignmentId, Assignment, MappingId, MappingSummary, ProposedAssignment, RowId,
        SourceRow, UserId,
    },
    error::{CoreError, CoreResult},
    protocol::{AlignmentSummary, RawRow},
};
use storage::{prepare_import, AlignmentStore, ReviewStore};
use tracing::{debug, error, info, warn};

use crate::locks::LockTable;

/// Attempts at the review-side write of an assignment before rolling back.
pub const REVIEW_WRITE_ATTEMPTS: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(25);

/// What a reconciliation pass changed in the review store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub removed_missing_row: u64,
    pub removed_unassigned: u64,
    pub updated: u64,
    pub created: u64,
}

impl ReconcileReport {
    pub fn changes(&self) -> u64 {
        self.removed_missing_row + self.removed_unassigned + self.updated + self.created
    }

    pub fn is_clean(&self) -> bool {
        self.changes() == 0
    }
}

/// Keeps each row's assignment and its review Mapping in step.
///
/// The alignment store is written first and is authoritative; a review write
/// that keeps failing is undone on the alignment side and surfaced as
/// [`CoreError::SyncFailure`]. Drift left behind by crashes is repaired by
/// [`SyncEngine::reconcile`].
pub struct SyncEngine<A, R> {
    pub(crate) alignments: Arc<A>,
    pub(crate) review: Arc<R>,
    pub(crate) locks: Arc<LockTable>,
    retry_delay: Duration,
}

impl<A, R> Clone for SyncEngine<A, R> {
    fn clone(&self) -> Self {
        Self {
            alignments: Arc::clone(&self.alignments),
            review: Arc::clone(&self.review),
            locks: Arc::clone(&self.locks),
            retry_delay: self.retry_delay,
        }
    }
}

impl<A, R> SyncEngine<A, R>
where
    A: AlignmentStore,
    R: ReviewStore,
{
    pub fn new(alignments: Arc<A>, review: Arc<R>) -> Self {
        Self {
            alignments,
            review,
            locks: Arc::new(LockTable::default()),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn alignment_store(&self) -> &A {
        &self.alignments
    }

    pub fn review_store(&self) -> &R {
        &self.review
    }

    /// Creates an alignment and imports its rows. Rows are validated before
    /// anything is written; an import failure removes the new alignment.
    pub async fn create_alignment(
        &self,
        name: &str,
        description: &str,
        rows: Vec<RawRow>,
    ) -> CoreResult<(AlignmentId, Vec<RowId>)> {
        let rows = prepare_import(rows)?;
        let alignment_id = self.alignments.create_alignment(name, description).await?;

        match self.alignments.import_rows(alignment_id, rows).await {
            Ok(row_ids) => {
                info!(
                    alignment_id = alignment_id.0,
                    rows = row_ids.len(),
                    "alignment created"
                );
                Ok((alignment_id, row_ids))
            }
            Err(import_error) => {
                if let Err(cleanup_error) = self.alignments.delete(alignment_id).await {
                    error!(
                        alignment_id = alignment_id.0,
                        error = %cleanup_error,
                        "failed to remove alignment after import failure"
                    );
                }
                Err(import_error)
            }
        }
    }

    /// Creates an alignment with no rows; rows arrive later through
    /// [`Self::import_rows`].
    pub async fn create_empty_alignment(
        &self,
        name: &str,
        description: &str,
    ) -> CoreResult<AlignmentId> {
        let alignment_id = self.alignments.create_alignment(name, description).await?;
        info!(alignment_id = alignment_id.0, "empty alignment created");
        Ok(alignment_id)
    }

    pub async fn import_rows(
        &self,
        alignment_id: AlignmentId,
        rows: Vec<RawRow>,
    ) -> CoreResult<Vec<RowId>> {
        let _scope = self.locks.shared(alignment_id).await;
        let row_ids = self.alignments.import_rows(alignment_id, rows).await?;
        info!(
            alignment_id = alignment_id.0,
            rows = row_ids.len(),
            "rows imported"
        );
        Ok(row_ids)
    }

    pub async fn get_alignment(&self, alignment_id: AlignmentId) -> CoreResult<Alignment> {
        self.alignments.get_alignment(alignment_id).await
    }

    pub async fn list_alignments(&self) -> CoreResult<Vec<AlignmentSummary>> {
        self.alignments.list_alignments().await
    }

    pub async fn rename_alignment(&self, alignment_id: AlignmentId, name: &str) -> CoreResult<()> {
        self.alignments.rename(alignment_id, name).await
    }

    pub async fn describe_alignment(
        &self,
        alignment_id: AlignmentId,
        description: &str,
    ) -> CoreResult<()> {
        self.alignments.describe(alignment_id, description).await
    }

    /// Drops the row table before the Mappings, so an interrupted delete
    /// leaves only orphaned Mappings for [`Self::reconcile`] to purge.
    pub async fn delete_alignment(&self, alignment_id: AlignmentId) -> CoreResult<()> {
        let _scope = self.locks.exclusive(alignment_id).await;
        let existed = self.alignments.delete(alignment_id).await?;
        let removed = self.review.delete_mappings_for_alignment(alignment_id).await?;
        if !existed && removed == 0 {
            return Err(CoreError::not_found(format!("alignment {alignment_id}")));
        }
        info!(
            alignment_id = alignment_id.0,
            mappings_removed = removed,
            "alignment deleted"
        );
        Ok(())
    }

    pub async fn get_row(&self, alignment_id: AlignmentId, row_id: RowId) -> CoreResult<SourceRow> {
        self.alignments.get_row(alignment_id, row_id).await
    }

    pub async fn find_mapping(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
    ) -> CoreResult<Option<MappingId>> {
        self.review.find_mapping(alignment_id, row_id).await
    }

    pub async fn list_mappings(&self, alignment_id: AlignmentId) -> CoreResult<Vec<MappingSummary>> {
        self.review.list_mappings(alignment_id).await
    }

    /// Records an assignment on the row and mirrors it as a Mapping.
    pub async fn assign(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
        proposed: ProposedAssignment,
        user_id: &UserId,
    ) -> CoreResult<MappingId> {
        let assignment = proposed.validate()?;
        let _guard = self.locks.row(alignment_id, row_id).await;

        let previous = self.alignments.get_row(alignment_id, row_id).await?.assignment;
        self.alignments
            .set_assignment(alignment_id, row_id, &assignment)
            .await?;

        match self
            .upsert_with_retry(alignment_id, row_id, &assignment, user_id)
            .await
        {
            Ok(mapping_id) => {
                debug!(
                    alignment_id = alignment_id.0,
                    row_id = row_id.0,
                    mapping_id = mapping_id.0,
                    user = %user_id,
                    "row assigned"
                );
                Ok(mapping_id)
            }
            Err(review_error) => {
                self.restore(alignment_id, row_id, previous).await;
                Err(CoreError::SyncFailure(format!(
                    "mapping for row {row_id} in alignment {alignment_id} was not written: {review_error}"
                )))
            }
        }
    }

    /// Clears the row's assignment and removes its Mapping with all
    /// Evaluations.
    pub async fn unassign(&self, alignment_id: AlignmentId, row_id: RowId) -> CoreResult<()> {
        let _guard = self.locks.row(alignment_id, row_id).await;

        let mapping_id = self.review.find_mapping(alignment_id, row_id).await?;
        match self.alignments.clear_assignment(alignment_id, row_id).await {
            Ok(()) => {}
            Err(CoreError::NotFound(what)) if mapping_id.is_some() => {
                warn!(
                    alignment_id = alignment_id.0,
                    row_id = row_id.0,
                    missing = %what,
                    "row is gone, removing its mapping"
                );
            }
            Err(error) => return Err(error),
        }

        if let Some(mapping_id) = mapping_id {
            self.review.delete_mapping(mapping_id).await?;
        }
        debug!(alignment_id = alignment_id.0, row_id = row_id.0, "row unassigned");
        Ok(())
    }

    /// Brings the review store back in line with the alignment store.
    ///
    /// Mappings of an alignment that no longer exists are purged. Running it
    /// twice in a row yields a clean second report.
    pub async fn reconcile(&self, alignment_id: AlignmentId) -> CoreResult<ReconcileReport> {
        let _scope = self.locks.exclusive(alignment_id).await;
        let mut report = ReconcileReport::default();

        if self.alignments.find_alignment(alignment_id).await?.is_none() {
            report.removed_missing_row = self.review.delete_mappings_for_alignment(alignment_id).await?;
            if report.is_clean() {
                return Err(CoreError::not_found(format!("alignment {alignment_id}")));
            }
            warn!(
                alignment_id = alignment_id.0,
                removed = report.removed_missing_row,
                "purged mappings of deleted alignment"
            );
            return Ok(report);
        }

        for summary in self.review.list_mappings(alignment_id).await? {
            let mapping = summary.mapping;
            match self.alignments.find_row(alignment_id, mapping.row_id).await? {
                None => {
                    self.review.delete_mapping(mapping.id).await?;
                    report.removed_missing_row += 1;
                }
                Some(SourceRow {
                    assignment: None, ..
                }) => {
                    self.review.delete_mapping(mapping.id).await?;
                    report.removed_unassigned += 1;
                }
                Some(SourceRow {
                    assignment: Some(current),
                    ..
                }) if current != mapping.assignment => {
                    self.review
                        .upsert_mapping(alignment_id, mapping.row_id, &current, &UserId::system())
                        .await?;
                    report.updated += 1;
                }
                Some(_) => {}
            }
        }

        let mut assigned = self.alignments.scan_assigned(alignment_id);
        while let Some(row) = assigned.try_next().await? {
            let Some(assignment) = row.assignment else {
                continue;
            };
            if self.review.find_mapping(alignment_id, row.row_id).await?.is_none() {
                self.review
                    .upsert_mapping(alignment_id, row.row_id, &assignment, &UserId::system())
                    .await?;
                report.created += 1;
            }
        }

        if report.is_clean() {
            debug!(alignment_id = alignment_id.0, "alignment already consistent");
        } else {
            info!(
                alignment_id = alignment_id.0,
                removed_missing_row = report.removed_missing_row,
                removed_unassigned = report.removed_unassigned,
                updated = report.updated,
                created = report.created,
                "alignment reconciled"
            );
        }
        Ok(report)
    }

    async fn upsert_with_retry(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
        assignment: &Assignment,
        user_id: &UserId,
    ) -> CoreResult<MappingId> {
        let mut attempt = 1;
        loop {
            match self
                .review
                .upsert_mapping(alignment_id, row_id, assignment, user_id)
                .await
            {
                Ok(mapping_id) => return Ok(mapping_id),
                Err(error) if attempt < REVIEW_WRITE_ATTEMPTS => {
                    warn!(
                        alignment_id = alignment_id.0,
                        row_id = row_id.0,
                        attempt,
                        %error,
                        "mapping write failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn restore(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
        previous: Option<Assignment>,
    ) {
        let restored = match previous {
            Some(previous) => {
                self.alignments
                    .set_assignment(alignment_id, row_id, &previous)
                    .await
            }
            None => self.alignments.clear_assignment(alignment_id, row_id).await,
        };
        match restored {
            Ok(()) => warn!(
                alignment_id = alignment_id.0,
                row_id = row_id.0,
                "assignment rolled back after mapping write failure"
            ),
            Err(error) => error!(
                alignment_id = alignment_id.0,
                row_id = row_id.0,
                %error,
                "rollback failed, alignment needs reconcile"
            ),
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
