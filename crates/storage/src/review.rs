use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Executor, Pool, Row, Sqlite};

use shared::{
    domain::{
        AlignmentId, Assignment, Evaluation, Mapping, MappingId, MappingSummary, RowId, Tally,
        UserId, Verdict,
    },
    error::CoreResult,
};

use crate::{EvaluationStore, ReviewStore};

const MAPPING_COLUMNS: &str = "m.id, m.alignment_id, m.row_id, m.dictionary_concept_id, \
     m.standard_concept_id, m.custom_concept_id, m.assigned_by, m.assigned_at";

const TALLY_COLUMNS: &str = "COALESCE(SUM(CASE WHEN e.verdict = 'approved' THEN 1 ELSE 0 END), 0), \
     COALESCE(SUM(CASE WHEN e.verdict = 'rejected' THEN 1 ELSE 0 END), 0), \
     COALESCE(SUM(CASE WHEN e.verdict = 'uncertain' THEN 1 ELSE 0 END), 0)";

/// SQLite-backed [`ReviewStore`] and [`EvaluationStore`].
#[derive(Clone)]
pub struct SqliteReviewStore {
    pool: Pool<Sqlite>,
}

impl SqliteReviewStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let mut migrator = sqlx::migrate!("./migrations/review");
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
}

#[async_trait]
impl ReviewStore for SqliteReviewStore {
    async fn upsert_mapping(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
        assignment: &Assignment,
        user_id: &UserId,
    ) -> CoreResult<MappingId> {
        let rec = sqlx::query(
            "INSERT INTO mappings (
                alignment_id,
                row_id,
                dictionary_concept_id,
                standard_concept_id,
                custom_concept_id,
                assigned_by,
                assigned_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(alignment_id, row_id) DO UPDATE SET
                dictionary_concept_id = excluded.dictionary_concept_id,
                standard_concept_id = excluded.standard_concept_id,
                custom_concept_id = excluded.custom_concept_id,
                assigned_by = excluded.assigned_by,
                assigned_at = excluded.assigned_at
             RETURNING id",
        )
        .bind(alignment_id.0)
        .bind(row_id.0)
        .bind(assignment.dictionary_concept_id.0)
        .bind(assignment.standard_concept_id().map(|id| id.0))
        .bind(assignment.custom_concept_id().map(|id| id.0))
        .bind(user_id.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert mapping")?;
        Ok(MappingId(rec.get::<i64, _>(0)))
    }

    async fn delete_mapping(&self, mapping_id: MappingId) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        sqlx::query("DELETE FROM evaluations WHERE mapping_id = ?")
            .bind(mapping_id.0)
            .execute(&mut *tx)
            .await
            .context("failed to delete evaluations")?;
        let deleted = sqlx::query("DELETE FROM mappings WHERE id = ?")
            .bind(mapping_id.0)
            .execute(&mut *tx)
            .await
            .context("failed to delete mapping")?
            .rows_affected();
        tx.commit().await.context("failed to commit mapping delete")?;
        Ok(deleted > 0)
    }

    async fn find_mapping(
        &self,
        alignment_id: AlignmentId,
        row_id: RowId,
    ) -> CoreResult<Option<MappingId>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM mappings WHERE alignment_id = ? AND row_id = ?",
        )
        .bind(alignment_id.0)
        .bind(row_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to find mapping")?;
        Ok(id.map(MappingId))
    }

    async fn get_mapping(&self, mapping_id: MappingId) -> CoreResult<Option<Mapping>> {
        let row = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS} FROM mappings m WHERE m.id = ?"
        ))
        .bind(mapping_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load mapping")?;
        Ok(row.map(|r| decode_mapping(&r)).transpose()?)
    }

    async fn list_mappings(&self, alignment_id: AlignmentId) -> CoreResult<Vec<MappingSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {MAPPING_COLUMNS}, {TALLY_COLUMNS}
             FROM mappings m
             LEFT JOIN evaluations e ON e.mapping_id = m.id
             WHERE m.alignment_id = ?
             GROUP BY m.id
             ORDER BY m.row_id ASC"
        ))
        .bind(alignment_id.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to list mappings")?;

        let summaries = rows
            .iter()
            .map(|r| {
                Ok(MappingSummary {
                    mapping: decode_mapping(r)?,
                    tally: decode_tally(r, 8)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(summaries)
    }

    async fn delete_mappings_for_alignment(&self, alignment_id: AlignmentId) -> CoreResult<u64> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        sqlx::query(
            "DELETE FROM evaluations
             WHERE mapping_id IN (SELECT id FROM mappings WHERE alignment_id = ?)",
        )
        .bind(alignment_id.0)
        .execute(&mut *tx)
        .await
        .context("failed to delete evaluations for alignment")?;
        let deleted = sqlx::query("DELETE FROM mappings WHERE alignment_id = ?")
            .bind(alignment_id.0)
            .execute(&mut *tx)
            .await
            .context("failed to delete mappings for alignment")?
            .rows_affected();
        tx.commit().await.context("failed to commit alignment mapping delete")?;
        Ok(deleted)
    }
}

#[async_trait]
impl EvaluationStore for SqliteReviewStore {
    async fn record_verdict(
        &self,
        mapping_id: MappingId,
        evaluator_id: &UserId,
        verdict: Verdict,
    ) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        if !mapping_exists(&mut *tx, mapping_id).await? {
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO evaluations (mapping_id, evaluator_id, verdict, comment, updated_at)
             VALUES (?, ?, ?, NULL, ?)
             ON CONFLICT(mapping_id, evaluator_id) DO UPDATE SET
                verdict = excluded.verdict,
                updated_at = excluded.updated_at",
        )
        .bind(mapping_id.0)
        .bind(evaluator_id.as_str())
        .bind(verdict.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .context("failed to record verdict")?;
        tx.commit().await.context("failed to commit verdict")?;
        Ok(true)
    }

    async fn record_comment(
        &self,
        mapping_id: MappingId,
        evaluator_id: &UserId,
        comment: &str,
    ) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        if !mapping_exists(&mut *tx, mapping_id).await? {
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO evaluations (mapping_id, evaluator_id, verdict, comment, updated_at)
             VALUES (?, ?, NULL, ?, ?)
             ON CONFLICT(mapping_id, evaluator_id) DO UPDATE SET
                comment = excluded.comment,
                updated_at = excluded.updated_at",
        )
        .bind(mapping_id.0)
        .bind(evaluator_id.as_str())
        .bind(comment)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .context("failed to record comment")?;
        tx.commit().await.context("failed to commit comment")?;
        Ok(true)
    }

    async fn delete_evaluation(
        &self,
        mapping_id: MappingId,
        evaluator_id: &UserId,
    ) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        if !mapping_exists(&mut *tx, mapping_id).await? {
            return Ok(false);
        }
        sqlx::query("DELETE FROM evaluations WHERE mapping_id = ? AND evaluator_id = ?")
            .bind(mapping_id.0)
            .bind(evaluator_id.as_str())
            .execute(&mut *tx)
            .await
            .context("failed to delete evaluation")?;
        tx.commit().await.context("failed to commit evaluation delete")?;
        Ok(true)
    }

    async fn tally(&self, mapping_id: MappingId) -> CoreResult<Option<Tally>> {
        let row = sqlx::query(&format!(
            "SELECT {TALLY_COLUMNS}
             FROM mappings m
             LEFT JOIN evaluations e ON e.mapping_id = m.id
             WHERE m.id = ?
             GROUP BY m.id"
        ))
        .bind(mapping_id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to tally evaluations")?;
        Ok(row.map(|r| decode_tally(&r, 0)).transpose()?)
    }

    async fn list_evaluations(&self, mapping_id: MappingId) -> CoreResult<Option<Vec<Evaluation>>> {
        if !mapping_exists(&self.pool, mapping_id).await? {
            return Ok(None);
        }
        let rows = sqlx::query(
            "SELECT mapping_id, evaluator_id, verdict, comment, updated_at
             FROM evaluations
             WHERE mapping_id = ?
             ORDER BY evaluator_id ASC",
        )
        .bind(mapping_id.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to list evaluations")?;

        let evaluations = rows
            .iter()
            .map(|r| {
                let verdict = r
                    .try_get::<Option<String>, _>(2)?
                    .map(|raw| {
                        Verdict::parse(&raw).ok_or_else(|| anyhow!("unknown verdict '{raw}'"))
                    })
                    .transpose()?;
                Ok(Evaluation {
                    mapping_id: MappingId(r.try_get(0)?),
                    evaluator_id: UserId(r.try_get(1)?),
                    verdict,
                    comment: r.try_get(3)?,
                    updated_at: r.try_get::<DateTime<Utc>, _>(4)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(evaluations))
    }
}

async fn mapping_exists<'c, E>(executor: E, mapping_id: MappingId) -> Result<bool>
where
    E: Executor<'c, Database = Sqlite>,
{
    let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM mappings WHERE id = ?")
        .bind(mapping_id.0)
        .fetch_optional(executor)
        .await
        .context("failed to check mapping")?;
    Ok(found.is_some())
}

fn decode_mapping(row: &SqliteRow) -> Result<Mapping> {
    let assignment = Assignment::from_columns(
        Some(row.try_get::<i64, _>(3)?),
        row.try_get(4)?,
        row.try_get(5)?,
    )?
    .ok_or_else(|| anyhow!("mapping without assignment"))?;

    Ok(Mapping {
        id: MappingId(row.try_get(0)?),
        alignment_id: AlignmentId(row.try_get(1)?),
        row_id: RowId(row.try_get(2)?),
        assignment,
        assigned_by: UserId(row.try_get(6)?),
        assigned_at: row.try_get::<DateTime<Utc>, _>(7)?,
    })
}

fn decode_tally(row: &SqliteRow, offset: usize) -> Result<Tally> {
    let count = |index: usize| -> Result<u32> {
        let value: i64 = row.try_get(offset + index)?;
        Ok(u32::try_from(value).unwrap_or(u32::MAX))
    };
    Ok(Tally {
        approved: count(0)?,
        rejected: count(1)?,
        uncertain: count(2)?,
    })
}

#[cfg(test)]
#[path = "tests/review_tests.rs"]
mod tests;
