use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use shared::domain::{AlignmentId, RowId};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Mutual-exclusion scopes for the sync engine.
///
/// Row writers share their alignment's scope and serialize on the row;
/// bulk operations take the alignment scope exclusively.
#[derive(Default)]
pub(crate) struct LockTable {
    alignments: StdMutex<HashMap<AlignmentId, Arc<RwLock<()>>>>,
    rows: StdMutex<HashMap<(AlignmentId, RowId), Arc<Mutex<()>>>>,
}

pub(crate) struct RowGuard {
    _row: OwnedMutexGuard<()>,
    _alignment: OwnedRwLockReadGuard<()>,
}

impl LockTable {
    pub(crate) async fn row(&self, alignment_id: AlignmentId, row_id: RowId) -> RowGuard {
        let alignment = self.alignment_lock(alignment_id).read_owned().await;
        let row = self.row_lock(alignment_id, row_id).lock_owned().await;
        RowGuard {
            _row: row,
            _alignment: alignment,
        }
    }

    pub(crate) async fn shared(&self, alignment_id: AlignmentId) -> OwnedRwLockReadGuard<()> {
        self.alignment_lock(alignment_id).read_owned().await
    }

    pub(crate) async fn exclusive(&self, alignment_id: AlignmentId) -> OwnedRwLockWriteGuard<()> {
        self.alignment_lock(alignment_id).write_owned().await
    }

    fn alignment_lock(&self, alignment_id: AlignmentId) -> Arc<RwLock<()>> {
        let mut alignments = self
            .alignments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if alignments.len() >= LOCK_PRUNE_THRESHOLD {
            alignments.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        alignments.entry(alignment_id).or_default().clone()
    }

    fn row_lock(&self, alignment_id: AlignmentId, row_id: RowId) -> Arc<Mutex<()>> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if rows.len() >= LOCK_PRUNE_THRESHOLD {
            rows.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        rows.entry((alignment_id, row_id)).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn different_rows_do_not_block_each_other() {
        let locks = LockTable::default();
        let _first = locks.row(AlignmentId(1), RowId(1)).await;
        let second = tokio::time::timeout(
            Duration::from_millis(100),
            locks.row(AlignmentId(1), RowId(2)),
        )
        .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn same_row_is_serialized() {
        let locks = LockTable::default();
        let _first = locks.row(AlignmentId(1), RowId(1)).await;
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            locks.row(AlignmentId(1), RowId(1)),
        )
        .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn exclusive_scope_waits_for_row_writers() {
        let locks = LockTable::default();
        let row = locks.row(AlignmentId(1), RowId(1)).await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), locks.exclusive(AlignmentId(1))).await;
        assert!(blocked.is_err());

        drop(row);
        let _exclusive = locks.exclusive(AlignmentId(1)).await;
        let other_alignment = tokio::time::timeout(
            Duration::from_millis(100),
            locks.row(AlignmentId(2), RowId(1)),
        )
        .await;
        assert!(other_alignment.is_ok());
    }

    #[tokio::test]
    async fn idle_alignment_scopes_are_pruned() {
        let locks = LockTable::default();
        let held = locks.shared(AlignmentId(0)).await;
        for id in 1..(3 * LOCK_PRUNE_THRESHOLD as i64) {
            drop(locks.shared(AlignmentId(id)).await);
        }
        let tracked = locks
            .alignments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        assert!(tracked.len() <= LOCK_PRUNE_THRESHOLD);
        assert!(tracked.contains_key(&AlignmentId(0)));
        drop(tracked);
        drop(held);
    }
}
