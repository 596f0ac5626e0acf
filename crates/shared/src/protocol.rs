use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{AlignmentId, MappingId, ProposedAssignment, RowId, UserId, Verdict};

pub const COLUMN_VOCABULARY_ID: &str = "vocabulary_id";
pub const COLUMN_SOURCE_CODE: &str = "source_code";
pub const COLUMN_SOURCE_NAME: &str = "source_name";
pub const COLUMN_SUMMARY: &str = "summary";

pub const REQUIRED_COLUMNS: [&str; 3] = [COLUMN_VOCABULARY_ID, COLUMN_SOURCE_CODE, COLUMN_SOURCE_NAME];

/// One imported row: column name to cell value, delimiter and encoding
/// already resolved by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow(pub BTreeMap<String, String>);

impl RawRow {
    pub fn new<K, V>(columns: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            columns
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn missing_required(&self) -> Option<&'static str> {
        REQUIRED_COLUMNS
            .into_iter()
            .find(|column| !self.0.contains_key(*column))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentSummary {
    pub alignment_id: AlignmentId,
    pub name: String,
    pub description: String,
    pub row_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAlignmentRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAlignmentResponse {
    pub alignment_id: AlignmentId,
    pub row_ids: Vec<RowId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAlignmentRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRowsRequest {
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRowsResponse {
    pub row_ids: Vec<RowId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    /// Callers that do not identify themselves assign as anonymous.
    #[serde(default = "UserId::anonymous")]
    pub user_id: UserId,
    #[serde(flatten)]
    pub assignment: ProposedAssignment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignResponse {
    pub mapping_id: MappingId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRequest {
    pub comment: String,
}
