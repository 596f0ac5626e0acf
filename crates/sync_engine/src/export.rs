use std::collections::HashMap;

use catalog::CatalogResolver;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{AlignmentId, Target},
    error::CoreResult,
};
use storage::{AlignmentStore, ReviewStore};
use tracing::info;

use crate::SyncEngine;

pub const EXPORT_COLUMNS: [&str; 8] = [
    "source_code",
    "source_description",
    "source_vocabulary_id",
    "target_concept_id",
    "target_vocabulary_id",
    "valid_start_date",
    "valid_end_date",
    "invalid_reason",
];

/// Start date for rows that have no Mapping to take a date from.
pub const DEFAULT_VALID_START_DATE: &str = "1970-01-01";
pub const VALID_END_DATE: &str = "2099-12-31";

/// One line of a source-to-concept map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub source_code: String,
    pub source_description: String,
    pub source_vocabulary_id: String,
    /// Zero unless the target is a standard concept the catalog knows.
    pub target_concept_id: i64,
    pub target_vocabulary_id: String,
    pub valid_start_date: String,
    pub valid_end_date: String,
    pub invalid_reason: String,
}

impl ExportRecord {
    fn fields(&self) -> [String; 8] {
        [
            self.source_code.clone(),
            self.source_description.clone(),
            self.source_vocabulary_id.clone(),
            self.target_concept_id.to_string(),
            self.target_vocabulary_id.clone(),
            self.valid_start_date.clone(),
            self.valid_end_date.clone(),
            self.invalid_reason.clone(),
        ]
    }
}

impl<A, R> SyncEngine<A, R>
where
    A: AlignmentStore,
    R: ReviewStore,
{
    /// Builds export records for every assigned row, in `row_id` order.
    pub async fn export(
        &self,
        alignment_id: AlignmentId,
        resolver: &CatalogResolver,
    ) -> CoreResult<Vec<ExportRecord>> {
        let _scope = self.locks.shared(alignment_id).await;
        self.alignments.get_alignment(alignment_id).await?;

        let start_dates: HashMap<_, _> = self
            .review
            .list_mappings(alignment_id)
            .await?
            .into_iter()
            .map(|summary| {
                (
                    summary.mapping.row_id,
                    summary.mapping.assigned_at.format("%Y-%m-%d").to_string(),
                )
            })
            .collect();

        let mut records = Vec::new();
        let mut assigned = self.alignments.scan_assigned(alignment_id);
        while let Some(row) = assigned.try_next().await? {
            let Some(assignment) = row.assignment else {
                continue;
            };
            let (target_concept_id, target_vocabulary_id) = match assignment.target {
                Some(Target::Standard(concept_id)) => match resolver.standard(concept_id).await.found() {
                    Some(concept) => (concept_id.0, concept.vocabulary),
                    None => (0, String::new()),
                },
                Some(Target::Custom(_)) | None => (0, String::new()),
            };
            records.push(ExportRecord {
                source_code: row.source_code,
                source_description: row.source_name,
                source_vocabulary_id: row.vocabulary_id,
                target_concept_id,
                target_vocabulary_id,
                valid_start_date: start_dates
                    .get(&row.row_id)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_VALID_START_DATE.to_string()),
                valid_end_date: VALID_END_DATE.to_string(),
                invalid_reason: String::new(),
            });
        }

        info!(
            alignment_id = alignment_id.0,
            records = records.len(),
            "alignment exported"
        );
        Ok(records)
    }

    pub async fn export_csv(
        &self,
        alignment_id: AlignmentId,
        resolver: &CatalogResolver,
    ) -> CoreResult<String> {
        Ok(render_csv(&self.export(alignment_id, resolver).await?))
    }
}

/// Renders records with a header line and `\n` line endings, quoting fields
/// the way RFC 4180 asks.
pub fn render_csv(records: &[ExportRecord]) -> String {
    let mut out = String::new();
    push_line(&mut out, EXPORT_COLUMNS.iter().copied());
    for record in records {
        let fields = record.fields();
        push_line(&mut out, fields.iter().map(String::as_str));
    }
    out
}

fn push_line<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    for (index, field) in fields.enumerate() {
        if index > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

#[cfg(test)]
#[path = "tests/export_tests.rs"]
mod tests;
