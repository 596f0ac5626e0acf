use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{
        Alignment, AlignmentId, Assignment, Evaluation, Mapping, MappingId, MappingSummary, RowId,
        SourceRow, Tally, UserId, Verdict,
    },
    error::{CoreError, CoreResult},
    protocol::{AlignmentSummary, RawRow},
};

mod alignment;
mod review;

pub use alignment::{prepare_import, SqliteAlignmentStore};
pub use review::SqliteReviewStore;

/// Owner of every alignment's source-row table.
///
/// Assignment columns are only ever written through `set_assignment` and
/// `clear_assignment`; neither has side effects outside this store.
#[async_trait]
pub trait AlignmentStore: Send + Sync {
    async fn create_alignment(&self, name: &str, description: &str) -> CoreResult<AlignmentId>;
    async fn find_alignment(&self, alignment_id: AlignmentId) -> CoreResult<Option<Alignment>>;
    async fn list_alignments(&self) -> CoreResult<Vec<AlignmentSummary>>;
    async fn rename(&self, alignment_id: AlignmentId, name: &str) -> CoreResult<()>;
    async fn describe(&self, alignment_id: AlignmentId, description: &str) -> CoreResult<()>;
    /// Drops the alignment and its row table. Returns false if it did not exist.
    async fn delete(&self, alignment_id: AlignmentId) -> CoreResult<bool>;

    /// Appends rows with freshly minted row ids, all or nothing.
    async fn import_rows(&self, alignment_id: AlignmentId, rows: Vec<RawRow>)
        -> CoreResult<Vec<RowId>>;
    async fn find_row(&self, alignment_id: AlignmentId, row_id: RowId)
        -> CoreResult<Option<SourceRow>>;
    async fn set_assignment(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
        assignment: &Assignment,
    ) -> CoreResult<()>;
    async fn clear_assignment(&self, alignment_id: AlignmentId, row_id: RowId) -> CoreResult<()>;
    /// Lazy scan of assigned rows in `row_id` order. Every call starts over.
    fn scan_assigned(&self, alignment_id: AlignmentId) -> BoxStream<'_, CoreResult<SourceRow>>;
    /// Removes rows without touching any other store, as a shrinking re-import does.
    async fn delete_rows(&self, alignment_id: AlignmentId, row_ids: &[RowId]) -> CoreResult<u64>;
    async fn row_count(&self, alignment_id: AlignmentId) -> CoreResult<u64>;

    async fn get_alignment(&self, alignment_id: AlignmentId) -> CoreResult<Alignment> {
        self.find_alignment(alignment_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("alignment {alignment_id}")))
    }

    async fn get_row(&self, alignment_id: AlignmentId, row_id: RowId) -> CoreResult<SourceRow> {
        self.find_row(alignment_id, row_id).await?.ok_or_else(|| {
            CoreError::not_found(format!("row {row_id} in alignment {alignment_id}"))
        })
    }
}

/// Relational mirror of assigned rows.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Inserts or updates the Mapping for `(alignment_id, row_id)` in one
    /// statement. Repeated calls return the same id.
    async fn upsert_mapping(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
        assignment: &Assignment,
        user_id: &UserId,
    ) -> CoreResult<MappingId>;
    /// Deletes the Mapping and its Evaluations atomically.
    async fn delete_mapping(&self, mapping_id: MappingId) -> CoreResult<bool>;
    async fn find_mapping(&self, alignment_id: AlignmentId, row_id: RowId)
        -> CoreResult<Option<MappingId>>;
    async fn get_mapping(&self, mapping_id: MappingId) -> CoreResult<Option<Mapping>>;
    async fn list_mappings(&self, alignment_id: AlignmentId) -> CoreResult<Vec<MappingSummary>>;
    async fn delete_mappings_for_alignment(&self, alignment_id: AlignmentId) -> CoreResult<u64>;
}

/// Evaluation writes. Kept apart from [`ReviewStore`] so that only the
/// evaluation engine is handed a type that can write them.
///
/// Writes return `false` when the Mapping does not exist.
#[async_trait]
pub trait EvaluationStore: Send + Sync {
    async fn record_verdict(
        &self,
        mapping_id: MappingId,
        evaluator_id: &UserId,
        verdict: Verdict,
    ) -> CoreResult<bool>;
    async fn record_comment(
        &self,
        mapping_id: MappingId,
        evaluator_id: &UserId,
        comment: &str,
    ) -> CoreResult<bool>;
    async fn delete_evaluation(&self, mapping_id: MappingId, evaluator_id: &UserId)
        -> CoreResult<bool>;
    async fn tally(&self, mapping_id: MappingId) -> CoreResult<Option<Tally>>;
    async fn list_evaluations(&self, mapping_id: MappingId) -> CoreResult<Option<Vec<Evaluation>>>;
}

/// Opens a pool and applies `migrator`.
///
/// Both stores may share one file, so callers build their migrator with
/// `set_ignore_missing(true)`: each one only knows its own scripts.
///
/// In-memory databases live only as long as their connection, so they get
/// a single connection that is never recycled.
pub async fn connect(database_url: &str, migrator: &Migrator) -> Result<Pool<Sqlite>> {
    ensure_sqlite_parent_dir_exists(database_url)?;

    let connect_options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid sqlite url '{database_url}'"))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool_options = if is_memory_url(database_url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    let pool = pool_options
        .connect_with(connect_options)
        .await
        .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;

    migrator
        .run(&pool)
        .await
        .context("failed to apply migrations")?;
    Ok(pool)
}

pub async fn health_check(pool: &Pool<Sqlite>) -> Result<()> {
    let _: i64 = sqlx::query_scalar("SELECT 1")
        .fetch_one(pool)
        .await
        .context("sqlite ping failed")?;
    Ok(())
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
