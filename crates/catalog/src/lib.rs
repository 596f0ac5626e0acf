use std::{collections::HashMap, fs, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::{Assignment, CustomConceptId, DictionaryConceptId, StandardConceptId, Target};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(750);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardConcept {
    pub concept_id: StandardConceptId,
    pub code: String,
    pub name: String,
    pub vocabulary: String,
    pub is_valid: bool,
    pub is_standard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryConcept {
    pub concept_id: DictionaryConceptId,
    pub name: String,
    pub category: String,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("concept {0} not found")]
    NotFound(i64),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Read-only concept lookup. Both lookups are pure functions of the id.
#[async_trait]
pub trait ConceptCatalog: Send + Sync {
    async fn lookup_standard(&self, id: StandardConceptId)
        -> Result<StandardConcept, CatalogError>;
    async fn lookup_dictionary(
        &self,
        id: DictionaryConceptId,
    ) -> Result<DictionaryConcept, CatalogError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    standard: Vec<StandardConcept>,
    #[serde(default)]
    dictionary: Vec<DictionaryConcept>,
}

/// In-memory catalog, usually loaded from a JSON snapshot of the vocabulary.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    standard: HashMap<StandardConceptId, StandardConcept>,
    dictionary: HashMap<DictionaryConceptId, DictionaryConcept>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_standard(mut self, concept: StandardConcept) -> Self {
        self.standard.insert(concept.concept_id, concept);
        self
    }

    pub fn with_dictionary(mut self, concept: DictionaryConcept) -> Self {
        self.dictionary.insert(concept.concept_id, concept);
        self
    }

    /// Parses `{"standard": [...], "dictionary": [...]}`.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_json::from_str(raw).context("invalid catalog json")?;
        Ok(Self {
            standard: file
                .standard
                .into_iter()
                .map(|concept| (concept.concept_id, concept))
                .collect(),
            dictionary: file
                .dictionary
                .into_iter()
                .map(|concept| (concept.concept_id, concept))
                .collect(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog '{}'", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn len(&self) -> usize {
        self.standard.len() + self.dictionary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConceptCatalog for StaticCatalog {
    async fn lookup_standard(
        &self,
        id: StandardConceptId,
    ) -> Result<StandardConcept, CatalogError> {
        self.standard
            .get(&id)
            .cloned()
            .ok_or(CatalogError::NotFound(id.0))
    }

    async fn lookup_dictionary(
        &self,
        id: DictionaryConceptId,
    ) -> Result<DictionaryConcept, CatalogError> {
        self.dictionary
            .get(&id)
            .cloned()
            .ok_or(CatalogError::NotFound(id.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "concept", rename_all = "snake_case")]
pub enum Resolution<T> {
    Found(T),
    /// Rendered as "unknown target"; never an error for the caller.
    Unresolved,
}

impl<T> Resolution<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Resolution::Found(concept) => Some(concept),
            Resolution::Unresolved => None,
        }
    }

    pub fn as_found(&self) -> Option<&T> {
        match self {
            Resolution::Found(concept) => Some(concept),
            Resolution::Unresolved => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedTarget {
    Standard {
        concept_id: StandardConceptId,
        resolution: Resolution<StandardConcept>,
    },
    Custom {
        concept_id: CustomConceptId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAssignment {
    pub dictionary: Resolution<DictionaryConcept>,
    pub target: Option<ResolvedTarget>,
}

/// Bounds every lookup by a timeout and folds all failures into
/// [`Resolution::Unresolved`].
#[derive(Clone)]
pub struct CatalogResolver {
    catalog: Arc<dyn ConceptCatalog>,
    timeout: Duration,
}

impl CatalogResolver {
    pub fn new(catalog: Arc<dyn ConceptCatalog>, timeout: Duration) -> Self {
        Self { catalog, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn standard(&self, id: StandardConceptId) -> Resolution<StandardConcept> {
        settle(
            "standard",
            id.0,
            tokio::time::timeout(self.timeout, self.catalog.lookup_standard(id)).await,
        )
    }

    pub async fn dictionary(&self, id: DictionaryConceptId) -> Resolution<DictionaryConcept> {
        settle(
            "dictionary",
            id.0,
            tokio::time::timeout(self.timeout, self.catalog.lookup_dictionary(id)).await,
        )
    }

    pub async fn describe(&self, assignment: &Assignment) -> ResolvedAssignment {
        let dictionary = self.dictionary(assignment.dictionary_concept_id).await;
        let target = match assignment.target {
            Some(Target::Standard(concept_id)) => Some(ResolvedTarget::Standard {
                concept_id,
                resolution: self.standard(concept_id).await,
            }),
            Some(Target::Custom(concept_id)) => Some(ResolvedTarget::Custom { concept_id }),
            None => None,
        };
        ResolvedAssignment { dictionary, target }
    }
}

fn settle<T>(
    kind: &'static str,
    id: i64,
    outcome: Result<Result<T, CatalogError>, tokio::time::error::Elapsed>,
) -> Resolution<T> {
    match outcome {
        Ok(Ok(concept)) => Resolution::Found(concept),
        Ok(Err(CatalogError::NotFound(_))) => {
            debug!(kind, id, "concept not in catalog");
            Resolution::Unresolved
        }
        Ok(Err(error)) => {
            warn!(kind, id, %error, "catalog lookup failed");
            Resolution::Unresolved
        }
        Err(_) => {
            warn!(kind, id, "catalog lookup timed out");
            Resolution::Unresolved
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
