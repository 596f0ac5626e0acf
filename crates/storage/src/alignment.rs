use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use sqlx::{sqlite::SqliteRow, Executor, Pool, Row, Sqlite};
use uuid::Uuid;

use shared::{
    domain::{Alignment, AlignmentId, Assignment, RowId, SourceRow},
    error::{CoreError, CoreResult},
    protocol::{
        AlignmentSummary, RawRow, COLUMN_SOURCE_CODE, COLUMN_SOURCE_NAME, COLUMN_SUMMARY,
        COLUMN_VOCABULARY_ID, REQUIRED_COLUMNS,
    },
};

use crate::AlignmentStore;

const SCAN_PAGE_SIZE: i64 = 256;

const ROW_COLUMNS: &str = "row_id, vocabulary_id, source_code, source_name, summary, extra_json, \
     dictionary_concept_id, standard_concept_id, custom_concept_id";

/// SQLite-backed [`AlignmentStore`]. Every alignment gets its own
/// `source_rows_<handle>` table.
#[derive(Clone)]
pub struct SqliteAlignmentStore {
    pool: Pool<Sqlite>,
}

impl SqliteAlignmentStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let mut migrator = sqlx::migrate!("./migrations/alignment");
        migrator.set_ignore_missing(true);
        let pool = crate::connect(database_url, &migrator).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        crate::health_check(&self.pool).await
    }

    async fn next_page(
        &self,
        alignment_id: AlignmentId,
        cursor: Option<RowId>,
    ) -> CoreResult<Option<(Vec<SourceRow>, Option<RowId>)>> {
        let Some(after) = cursor else {
            return Ok(None);
        };
        let page = self.assigned_page(alignment_id, after).await?;
        let next = if (page.len() as i64) < SCAN_PAGE_SIZE {
            None
        } else {
            page.last().map(|row| row.row_id)
        };
        Ok(Some((page, next)))
    }

    async fn assigned_page(
        &self,
        alignment_id: AlignmentId,
        after: RowId,
    ) -> CoreResult<Vec<SourceRow>> {
        let table = row_table(&self.pool, alignment_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM \"{table}\"
             WHERE row_id > ? AND dictionary_concept_id IS NOT NULL
             ORDER BY row_id ASC
             LIMIT ?"
        ))
        .bind(after.0)
        .bind(SCAN_PAGE_SIZE)
        .fetch_all(&self.pool)
        .await
        .context("failed to scan assigned rows")?;

        rows.iter()
            .map(|row| decode_source_row(alignment_id, row).map_err(CoreError::from))
            .collect()
    }

    async fn update_assignment_columns(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
        columns: (Option<i64>, Option<i64>, Option<i64>),
    ) -> CoreResult<()> {
        let table = row_table(&self.pool, alignment_id).await?;
        let updated = sqlx::query(&format!(
            "UPDATE \"{table}\"
             SET dictionary_concept_id = ?, standard_concept_id = ?, custom_concept_id = ?
             WHERE row_id = ?"
        ))
        .bind(columns.0)
        .bind(columns.1)
        .bind(columns.2)
        .bind(row_id.0)
        .execute(&self.pool)
        .await
        .context("failed to update assignment columns")?
        .rows_affected();

        if updated == 0 {
            return Err(CoreError::not_found(format!(
                "row {row_id} in alignment {alignment_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AlignmentStore for SqliteAlignmentStore {
    async fn create_alignment(&self, name: &str, description: &str) -> CoreResult<AlignmentId> {
        let handle = Uuid::new_v4().simple().to_string();
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        let rec = sqlx::query(
            "INSERT INTO alignments (name, description, table_handle, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(name)
        .bind(description)
        .bind(&handle)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert alignment")?;
        let alignment_id = AlignmentId(rec.get::<i64, _>(0));

        sqlx::query(&format!(
            "CREATE TABLE \"{table}\" (
                row_id                INTEGER PRIMARY KEY,
                vocabulary_id         TEXT NOT NULL,
                source_code           TEXT NOT NULL,
                source_name           TEXT NOT NULL,
                summary               TEXT NOT NULL DEFAULT '',
                extra_json            TEXT NOT NULL DEFAULT '{{}}',
                dictionary_concept_id INTEGER,
                standard_concept_id   INTEGER,
                custom_concept_id     INTEGER,
                CHECK (standard_concept_id IS NULL OR custom_concept_id IS NULL),
                CHECK (dictionary_concept_id IS NOT NULL
                       OR (standard_concept_id IS NULL AND custom_concept_id IS NULL))
            )",
            table = table_name(&handle)
        ))
        .execute(&mut *tx)
        .await
        .context("failed to create source row table")?;

        tx.commit().await.context("failed to commit alignment")?;
        Ok(alignment_id)
    }

    async fn find_alignment(&self, alignment_id: AlignmentId) -> CoreResult<Option<Alignment>> {
        let row = sqlx::query(
            "SELECT id, name, description, table_handle, created_at FROM alignments WHERE id = ?",
        )
        .bind(alignment_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load alignment")?;

        Ok(row.map(|r| Alignment {
            id: AlignmentId(r.get::<i64, _>(0)),
            name: r.get::<String, _>(1),
            description: r.get::<String, _>(2),
            table_handle: r.get::<String, _>(3),
            created_at: r.get::<DateTime<Utc>, _>(4),
        }))
    }

    async fn list_alignments(&self) -> CoreResult<Vec<AlignmentSummary>> {
        let rows = sqlx::query("SELECT id, name, description FROM alignments ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list alignments")?;

        let mut summaries = Vec::with_capacity(rows.len());
        for r in rows {
            let alignment_id = AlignmentId(r.get::<i64, _>(0));
            summaries.push(AlignmentSummary {
                alignment_id,
                name: r.get::<String, _>(1),
                description: r.get::<String, _>(2),
                row_count: self.row_count(alignment_id).await?,
            });
        }
        Ok(summaries)
    }

    async fn rename(&self, alignment_id: AlignmentId, name: &str) -> CoreResult<()> {
        let updated = sqlx::query("UPDATE alignments SET name = ? WHERE id = ?")
            .bind(name)
            .bind(alignment_id.0)
            .execute(&self.pool)
            .await
            .context("failed to rename alignment")?
            .rows_affected();
        if updated == 0 {
            return Err(CoreError::not_found(format!("alignment {alignment_id}")));
        }
        Ok(())
    }

    async fn describe(&self, alignment_id: AlignmentId, description: &str) -> CoreResult<()> {
        let updated = sqlx::query("UPDATE alignments SET description = ? WHERE id = ?")
            .bind(description)
            .bind(alignment_id.0)
            .execute(&self.pool)
            .await
            .context("failed to update alignment description")?
            .rows_affected();
        if updated == 0 {
            return Err(CoreError::not_found(format!("alignment {alignment_id}")));
        }
        Ok(())
    }

    async fn delete(&self, alignment_id: AlignmentId) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let handle = sqlx::query_scalar::<_, String>(
            "DELETE FROM alignments WHERE id = ? RETURNING table_handle",
        )
        .bind(alignment_id.0)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to delete alignment")?;

        let Some(handle) = handle else {
            return Ok(false);
        };

        sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table_name(&handle)))
            .execute(&mut *tx)
            .await
            .context("failed to drop source row table")?;
        tx.commit().await.context("failed to commit alignment delete")?;
        Ok(true)
    }

    async fn import_rows(
        &self,
        alignment_id: AlignmentId,
        rows: Vec<RawRow>,
    ) -> CoreResult<Vec<RowId>> {
        let rows = prepare_import(rows)?;

        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let rec = sqlx::query("SELECT table_handle, next_row_id FROM alignments WHERE id = ?")
            .bind(alignment_id.0)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to load alignment for import")?
            .ok_or_else(|| CoreError::not_found(format!("alignment {alignment_id}")))?;
        let table = table_name(&rec.get::<String, _>(0));
        let mut next_row_id = rec.get::<i64, _>(1);

        let insert = format!(
            "INSERT INTO \"{table}\" (row_id, vocabulary_id, source_code, source_name, summary, extra_json)
             VALUES (?, ?, ?, ?, ?, ?)"
        );
        let mut row_ids = Vec::with_capacity(rows.len());
        for raw in rows {
            let extra = extra_columns(&raw);
            sqlx::query(&insert)
                .bind(next_row_id)
                .bind(raw.get(COLUMN_VOCABULARY_ID).unwrap_or_default())
                .bind(raw.get(COLUMN_SOURCE_CODE).unwrap_or_default())
                .bind(raw.get(COLUMN_SOURCE_NAME).unwrap_or_default())
                .bind(raw.get(COLUMN_SUMMARY).unwrap_or_default())
                .bind(serde_json::Value::Object(extra).to_string())
                .execute(&mut *tx)
                .await
                .context("failed to insert source row")?;
            row_ids.push(RowId(next_row_id));
            next_row_id += 1;
        }

        sqlx::query("UPDATE alignments SET next_row_id = ? WHERE id = ?")
            .bind(next_row_id)
            .bind(alignment_id.0)
            .execute(&mut *tx)
            .await
            .context("failed to advance row id counter")?;
        tx.commit().await.context("failed to commit import")?;

        Ok(row_ids)
    }

    async fn find_row(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
    ) -> CoreResult<Option<SourceRow>> {
        let table = row_table(&self.pool, alignment_id).await?;
        let row = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM \"{table}\" WHERE row_id = ?"
        ))
        .bind(row_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load source row")?;

        Ok(row
            .map(|r| decode_source_row(alignment_id, &r))
            .transpose()?)
    }

    async fn set_assignment(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
        assignment: &Assignment,
    ) -> CoreResult<()> {
        self.update_assignment_columns(
            alignment_id,
            row_id,
            (
                Some(assignment.dictionary_concept_id.0),
                assignment.standard_concept_id().map(|id| id.0),
                assignment.custom_concept_id().map(|id| id.0),
            ),
        )
        .await
    }

    async fn clear_assignment(&self, alignment_id: AlignmentId, row_id: RowId) -> CoreResult<()> {
        self.update_assignment_columns(alignment_id, row_id, (None, None, None))
            .await
    }

    fn scan_assigned(&self, alignment_id: AlignmentId) -> BoxStream<'_, CoreResult<SourceRow>> {
        stream::try_unfold(Some(RowId(0)), move |cursor| self.next_page(alignment_id, cursor))
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, CoreError>)))
            .try_flatten()
            .boxed()
    }

    async fn delete_rows(&self, alignment_id: AlignmentId, row_ids: &[RowId]) -> CoreResult<u64> {
        let table = row_table(&self.pool, alignment_id).await?;
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let mut deleted = 0;
        for row_id in row_ids {
            deleted += sqlx::query(&format!("DELETE FROM \"{table}\" WHERE row_id = ?"))
                .bind(row_id.0)
                .execute(&mut *tx)
                .await
                .context("failed to delete source row")?
                .rows_affected();
        }
        tx.commit().await.context("failed to commit row delete")?;
        Ok(deleted)
    }

    async fn row_count(&self, alignment_id: AlignmentId) -> CoreResult<u64> {
        let table = row_table(&self.pool, alignment_id).await?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{table}\""))
            .fetch_one(&self.pool)
            .await
            .context("failed to count source rows")?;
        Ok(count.max(0) as u64)
    }
}

/// Checks required columns and collapses rows identical on every column,
/// keeping first occurrences in input order.
pub fn prepare_import(rows: Vec<RawRow>) -> CoreResult<Vec<RawRow>> {
    if let Some((index, column)) = rows
        .iter()
        .enumerate()
        .find_map(|(index, row)| row.missing_required().map(|column| (index, column)))
    {
        return Err(CoreError::import(format!(
            "row {index} is missing required column '{column}'"
        )));
    }

    let mut seen = HashSet::with_capacity(rows.len());
    let unique: Vec<RawRow> = rows
        .into_iter()
        .filter(|row| seen.insert(row.clone()))
        .collect();

    if unique.is_empty() {
        return Err(CoreError::import("no rows to import"));
    }
    Ok(unique)
}

fn extra_columns(raw: &RawRow) -> serde_json::Map<String, serde_json::Value> {
    raw.0
        .iter()
        .filter(|(column, _)| {
            !REQUIRED_COLUMNS.contains(&column.as_str()) && column.as_str() != COLUMN_SUMMARY
        })
        .map(|(column, value)| (column.clone(), serde_json::Value::String(value.clone())))
        .collect()
}

fn table_name(handle: &str) -> String {
    format!("source_rows_{handle}")
}

async fn row_table<'c, E>(executor: E, alignment_id: AlignmentId) -> CoreResult<String>
where
    E: Executor<'c, Database = Sqlite>,
{
    let handle = sqlx::query_scalar::<_, String>("SELECT table_handle FROM alignments WHERE id = ?")
        .bind(alignment_id.0)
        .fetch_optional(executor)
        .await
        .context("failed to resolve alignment table")?
        .ok_or_else(|| CoreError::not_found(format!("alignment {alignment_id}")))?;

    if !handle.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(anyhow!("corrupt table handle '{handle}' for alignment {alignment_id}").into());
    }
    Ok(table_name(&handle))
}

fn decode_source_row(alignment_id: AlignmentId, row: &SqliteRow) -> Result<SourceRow> {
    let extra_json: String = row.try_get("extra_json")?;
    let extra = match serde_json::from_str::<serde_json::Value>(&extra_json)
        .context("corrupt extra columns")?
    {
        serde_json::Value::Object(map) => map,
        other => return Err(anyhow!("extra columns must be an object, got {other}")),
    };

    let assignment = Assignment::from_columns(
        row.try_get("dictionary_concept_id")?,
        row.try_get("standard_concept_id")?,
        row.try_get("custom_concept_id")?,
    )?;

    Ok(SourceRow {
        alignment_id,
        row_id: RowId(row.try_get("row_id")?),
        vocabulary_id: row.try_get("vocabulary_id")?,
        source_code: row.try_get("source_code")?,
        source_name: row.try_get("source_name")?,
        summary: row.try_get("summary")?,
        extra,
        assignment,
    })
}

#[cfg(test)]
#[path = "tests/alignment_tests.rs"]
mod tests;
