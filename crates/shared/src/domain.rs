use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(AlignmentId);
id_newtype!(RowId);
id_newtype!(MappingId);
id_newtype!(DictionaryConceptId);
id_newtype!(StandardConceptId);
id_newtype!(CustomConceptId);

/// Opaque user / evaluator identity supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub const ANONYMOUS: &'static str = "anonymous";
    pub const SYSTEM: &'static str = "system";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn anonymous() -> Self {
        Self(Self::ANONYMOUS.to_string())
    }

    /// Identity recorded on Mappings recreated by reconciliation.
    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Standard(StandardConceptId),
    Custom(CustomConceptId),
}

/// A non-empty assignment. A row with no assignment carries `None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub dictionary_concept_id: DictionaryConceptId,
    pub target: Option<Target>,
}

impl Assignment {
    pub fn dictionary_only(dictionary_concept_id: DictionaryConceptId) -> Self {
        Self {
            dictionary_concept_id,
            target: None,
        }
    }

    pub fn standard(
        dictionary_concept_id: DictionaryConceptId,
        standard_concept_id: StandardConceptId,
    ) -> Self {
        Self {
            dictionary_concept_id,
            target: Some(Target::Standard(standard_concept_id)),
        }
    }

    pub fn custom(
        dictionary_concept_id: DictionaryConceptId,
        custom_concept_id: CustomConceptId,
    ) -> Self {
        Self {
            dictionary_concept_id,
            target: Some(Target::Custom(custom_concept_id)),
        }
    }

    pub fn standard_concept_id(&self) -> Option<StandardConceptId> {
        match self.target {
            Some(Target::Standard(id)) => Some(id),
            _ => None,
        }
    }

    pub fn custom_concept_id(&self) -> Option<CustomConceptId> {
        match self.target {
            Some(Target::Custom(id)) => Some(id),
            _ => None,
        }
    }

    /// Rebuilds an assignment from its three nullable storage columns.
    ///
    /// All columns null means "no assignment"; any other combination must
    /// describe a valid shape.
    pub fn from_columns(
        dictionary: Option<i64>,
        standard: Option<i64>,
        custom: Option<i64>,
    ) -> Result<Option<Self>, CoreError> {
        if dictionary.is_none() && standard.is_none() && custom.is_none() {
            return Ok(None);
        }
        ProposedAssignment {
            dictionary_concept_id: dictionary,
            standard_concept_id: standard,
            custom_concept_id: custom,
        }
        .validate()
        .map(Some)
    }
}

/// Unvalidated assignment as it arrives from a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedAssignment {
    pub dictionary_concept_id: Option<i64>,
    #[serde(default)]
    pub standard_concept_id: Option<i64>,
    #[serde(default)]
    pub custom_concept_id: Option<i64>,
}

impl ProposedAssignment {
    pub fn validate(self) -> Result<Assignment, CoreError> {
        let dictionary = self.dictionary_concept_id.ok_or_else(|| {
            CoreError::invalid_assignment("a dictionary concept is required")
        })?;
        if dictionary <= 0 {
            return Err(CoreError::invalid_assignment(format!(
                "dictionary concept id must be positive, got {dictionary}"
            )));
        }

        let target = match (self.standard_concept_id, self.custom_concept_id) {
            (Some(_), Some(_)) => {
                return Err(CoreError::invalid_assignment(
                    "standard and custom targets are mutually exclusive",
                ))
            }
            (Some(id), None) if id > 0 => Some(Target::Standard(StandardConceptId(id))),
            (None, Some(id)) if id > 0 => Some(Target::Custom(CustomConceptId(id))),
            (Some(id), None) | (None, Some(id)) => {
                return Err(CoreError::invalid_assignment(format!(
                    "target concept id must be positive, got {id}"
                )))
            }
            (None, None) => None,
        };

        Ok(Assignment {
            dictionary_concept_id: DictionaryConceptId(dictionary),
            target,
        })
    }
}

impl From<Assignment> for ProposedAssignment {
    fn from(value: Assignment) -> Self {
        Self {
            dictionary_concept_id: Some(value.dictionary_concept_id.0),
            standard_concept_id: value.standard_concept_id().map(|id| id.0),
            custom_concept_id: value.custom_concept_id().map(|id| id.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
    Uncertain,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::Rejected => "rejected",
            Verdict::Uncertain => "uncertain",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "approved" => Some(Verdict::Approved),
            "rejected" => Some(Verdict::Rejected),
            "uncertain" => Some(Verdict::Uncertain),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alignment {
    pub id: AlignmentId,
    pub name: String,
    pub description: String,
    pub table_handle: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub alignment_id: AlignmentId,
    pub row_id: RowId,
    pub vocabulary_id: String,
    pub source_code: String,
    pub source_name: String,
    pub summary: String,
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub assignment: Option<Assignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: MappingId,
    pub alignment_id: AlignmentId,
    pub row_id: RowId,
    pub assignment: Assignment,
    pub assigned_by: UserId,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approved: u32,
    pub rejected: u32,
    pub uncertain: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSummary {
    pub mapping: Mapping,
    pub tally: Tally,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub mapping_id: MappingId,
    pub evaluator_id: UserId,
    pub verdict: Option<Verdict>,
    pub comment: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_both_targets() {
        let err = ProposedAssignment {
            dictionary_concept_id: Some(1),
            standard_concept_id: Some(2),
            custom_concept_id: Some(3),
        }
        .validate()
        .expect_err("both targets");
        assert!(matches!(err, CoreError::InvalidAssignment(_)));
    }

    #[test]
    fn requires_dictionary_concept() {
        let err = ProposedAssignment {
            dictionary_concept_id: None,
            standard_concept_id: Some(2),
            custom_concept_id: None,
        }
        .validate()
        .expect_err("no dictionary");
        assert!(matches!(err, CoreError::InvalidAssignment(_)));
    }

    #[test]
    fn accepts_dictionary_only() {
        let assignment = ProposedAssignment {
            dictionary_concept_id: Some(3),
            ..Default::default()
        }
        .validate()
        .expect("valid");
        assert_eq!(assignment, Assignment::dictionary_only(DictionaryConceptId(3)));
    }

    #[test]
    fn all_null_columns_mean_unassigned() {
        assert_eq!(Assignment::from_columns(None, None, None).expect("ok"), None);
        assert!(Assignment::from_columns(None, Some(4), None).is_err());
    }

    #[test]
    fn verdict_text_round_trips() {
        for verdict in [Verdict::Approved, Verdict::Rejected, Verdict::Uncertain] {
            assert_eq!(Verdict::parse(verdict.as_str()), Some(verdict));
        }
        assert_eq!(Verdict::parse("maybe"), None);
    }
}
