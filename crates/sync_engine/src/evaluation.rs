use std::sync::Arc;

use shared::{
    domain::{Evaluation, MappingId, Tally, UserId, Verdict},
    error::{CoreError, CoreResult},
};
use storage::EvaluationStore;
use tracing::debug;

/// Per-evaluator verdicts and comments on Mappings.
///
/// Each evaluator owns one Evaluation per Mapping; no operation here touches
/// another evaluator's record.
pub struct EvaluationEngine<E> {
    store: Arc<E>,
}

impl<E> Clone for EvaluationEngine<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<E: EvaluationStore> EvaluationEngine<E> {
    pub fn new(store: Arc<E>) -> Self {
        Self { store }
    }

    /// Sets the evaluator's verdict, leaving any comment in place.
    pub async fn vote(
        &self,
        mapping_id: MappingId,
        evaluator_id: &UserId,
        verdict: Verdict,
    ) -> CoreResult<()> {
        if !self
            .store
            .record_verdict(mapping_id, evaluator_id, verdict)
            .await?
        {
            return Err(missing(mapping_id));
        }
        debug!(
            mapping_id = mapping_id.0,
            evaluator = %evaluator_id,
            verdict = verdict.as_str(),
            "verdict recorded"
        );
        Ok(())
    }

    /// Sets the evaluator's comment, leaving any verdict in place.
    pub async fn comment(
        &self,
        mapping_id: MappingId,
        evaluator_id: &UserId,
        comment: &str,
    ) -> CoreResult<()> {
        if !self
            .store
            .record_comment(mapping_id, evaluator_id, comment)
            .await?
        {
            return Err(missing(mapping_id));
        }
        debug!(mapping_id = mapping_id.0, evaluator = %evaluator_id, "comment recorded");
        Ok(())
    }

    /// Removes the evaluator's verdict and comment together.
    pub async fn clear(&self, mapping_id: MappingId, evaluator_id: &UserId) -> CoreResult<()> {
        if !self.store.delete_evaluation(mapping_id, evaluator_id).await? {
            return Err(missing(mapping_id));
        }
        debug!(mapping_id = mapping_id.0, evaluator = %evaluator_id, "evaluation cleared");
        Ok(())
    }

    pub async fn tally(&self, mapping_id: MappingId) -> CoreResult<Tally> {
        self.store
            .tally(mapping_id)
            .await?
            .ok_or_else(|| missing(mapping_id))
    }

    pub async fn evaluations(&self, mapping_id: MappingId) -> CoreResult<Vec<Evaluation>> {
        self.store
            .list_evaluations(mapping_id)
            .await?
            .ok_or_else(|| missing(mapping_id))
    }
}

fn missing(mapping_id: MappingId) -> CoreError {
    CoreError::not_found(format!("mapping {mapping_id}"))
}

#[cfg(test)]
#[path = "tests/evaluation_tests.rs"]
mod tests;
