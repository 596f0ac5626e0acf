use std::sync::Arc;

use catalog::{CatalogResolver, ConceptCatalog, StaticCatalog};
use storage::{SqliteAlignmentStore, SqliteReviewStore};
use sync_engine::{EvaluationEngine, SyncEngine};
use tracing::{info, warn};

use crate::config::{prepare_database_url, Settings};

pub(crate) type CurationSync = SyncEngine<SqliteAlignmentStore, SqliteReviewStore>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) sync: CurationSync,
    pub(crate) evaluations: EvaluationEngine<SqliteReviewStore>,
    pub(crate) resolver: CatalogResolver,
}

impl AppState {
    pub(crate) fn new(
        alignments: SqliteAlignmentStore,
        review: SqliteReviewStore,
        resolver: CatalogResolver,
    ) -> Self {
        let review = Arc::new(review);
        Self {
            sync: SyncEngine::new(Arc::new(alignments), Arc::clone(&review)),
            evaluations: EvaluationEngine::new(review),
            resolver,
        }
    }

    pub(crate) async fn open(settings: &Settings) -> anyhow::Result<Self> {
        let defaults = Settings::default();
        let alignment_url = prepare_database_url(
            &settings.alignment_database_url,
            &defaults.alignment_database_url,
        )?;
        let review_url =
            prepare_database_url(&settings.review_database_url, &defaults.review_database_url)?;

        let alignments = SqliteAlignmentStore::new(&alignment_url).await?;
        let review = SqliteReviewStore::new(&review_url).await?;

        let catalog: Arc<dyn ConceptCatalog> = match &settings.catalog_path {
            Some(path) => {
                let catalog = StaticCatalog::load(path)?;
                if catalog.is_empty() {
                    warn!(path = %path, "catalog has no concepts, targets will export as unknown");
                } else {
                    info!(path = %path, concepts = catalog.len(), "catalog loaded");
                }
                Arc::new(catalog)
            }
            None => {
                warn!("no catalog configured, targets will export as unknown");
                Arc::new(StaticCatalog::new())
            }
        };

        let resolver = CatalogResolver::new(catalog, settings.catalog_timeout());
        info!(
            timeout_ms = resolver.timeout().as_millis() as u64,
            "catalog lookups bounded"
        );
        Ok(Self::new(alignments, review, resolver))
    }
}

#[cfg(test)]
#[path = "tests/app_state_tests.rs"]
mod tests;
