use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use catalog::ResolvedAssignment;
use serde::Serialize;
use shared::{
    domain::{AlignmentId, Evaluation, MappingId, MappingSummary, RowId, Tally, UserId},
    error::{ApiError, CoreError, ErrorCode},
    protocol::{
        AlignmentSummary, AssignRequest, AssignResponse, CommentRequest, CreateAlignmentRequest,
        CreateAlignmentResponse, ImportRowsRequest, ImportRowsResponse, UpdateAlignmentRequest,
        VoteRequest,
    },
};
use sync_engine::ReconcileReport;
use tracing::error;

use crate::app_state::AppState;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// A Mapping with its tally and the catalog's view of its concepts.
/// Lookups that fail come back unresolved rather than failing the listing.
#[derive(Debug, Serialize)]
struct ResolvedMapping {
    #[serde(flatten)]
    summary: MappingSummary,
    resolved: ResolvedAssignment,
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/alignments", get(list_alignments).post(create_alignment))
        .route(
            "/alignments/:alignment_id",
            patch(update_alignment).delete(delete_alignment),
        )
        .route("/alignments/:alignment_id/rows", post(import_rows))
        .route(
            "/alignments/:alignment_id/rows/:row_id/assignment",
            put(assign).delete(unassign),
        )
        .route("/alignments/:alignment_id/reconcile", post(reconcile))
        .route("/alignments/:alignment_id/mappings", get(list_mappings))
        .route("/alignments/:alignment_id/export", get(export))
        .route(
            "/mappings/:mapping_id/evaluations/:evaluator/verdict",
            put(vote),
        )
        .route(
            "/mappings/:mapping_id/evaluations/:evaluator/comment",
            put(comment),
        )
        .route(
            "/mappings/:mapping_id/evaluations/:evaluator",
            delete(clear_evaluation),
        )
        .route("/mappings/:mapping_id/evaluations", get(list_evaluations))
        .route("/mappings/:mapping_id/tally", get(tally))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    let alignments = state.sync.alignment_store().health_check().await;
    let review = state.sync.review_store().health_check().await;
    if let Err(e) = alignments.and(review) {
        error!(error = %e, "store health check failed");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        ));
    }
    Ok("ok")
}

async fn list_alignments(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<AlignmentSummary>>> {
    let alignments = state.sync.list_alignments().await.map_err(reject)?;
    Ok(Json(alignments))
}

async fn create_alignment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAlignmentRequest>,
) -> ApiResult<(StatusCode, Json<CreateAlignmentResponse>)> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(ErrorCode::Validation, "alignment name cannot be empty")),
        ));
    }
    let (alignment_id, row_ids) = state
        .sync
        .create_alignment(name, &req.description, req.rows)
        .await
        .map_err(reject)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateAlignmentResponse {
            alignment_id,
            row_ids,
        }),
    ))
}

async fn update_alignment(
    State(state): State<Arc<AppState>>,
    Path(alignment_id): Path<i64>,
    Json(req): Json<UpdateAlignmentRequest>,
) -> ApiResult<StatusCode> {
    let alignment_id = AlignmentId(alignment_id);
    if let Some(name) = req.name.as_deref().map(str::trim) {
        if name.is_empty() {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ApiError::new(ErrorCode::Validation, "alignment name cannot be empty")),
            ));
        }
        state
            .sync
            .rename_alignment(alignment_id, name)
            .await
            .map_err(reject)?;
    }
    if let Some(description) = req.description.as_deref() {
        state
            .sync
            .describe_alignment(alignment_id, description)
            .await
            .map_err(reject)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_alignment(
    State(state): State<Arc<AppState>>,
    Path(alignment_id): Path<i64>,
) -> ApiResult<StatusCode> {
    state
        .sync
        .delete_alignment(AlignmentId(alignment_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn import_rows(
    State(state): State<Arc<AppState>>,
    Path(alignment_id): Path<i64>,
    Json(req): Json<ImportRowsRequest>,
) -> ApiResult<Json<ImportRowsResponse>> {
    let row_ids = state
        .sync
        .import_rows(AlignmentId(alignment_id), req.rows)
        .await
        .map_err(reject)?;
    Ok(Json(ImportRowsResponse { row_ids }))
}

async fn assign(
    State(state): State<Arc<AppState>>,
    Path((alignment_id, row_id)): Path<(i64, i64)>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<Json<AssignResponse>> {
    let mapping_id = state
        .sync
        .assign(
            AlignmentId(alignment_id),
            RowId(row_id),
            req.assignment,
            &req.user_id,
        )
        .await
        .map_err(reject)?;
    Ok(Json(AssignResponse { mapping_id }))
}

async fn unassign(
    State(state): State<Arc<AppState>>,
    Path((alignment_id, row_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    state
        .sync
        .unassign(AlignmentId(alignment_id), RowId(row_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reconcile(
    State(state): State<Arc<AppState>>,
    Path(alignment_id): Path<i64>,
) -> ApiResult<Json<ReconcileReport>> {
    let report = state
        .sync
        .reconcile(AlignmentId(alignment_id))
        .await
        .map_err(reject)?;
    Ok(Json(report))
}

async fn list_mappings(
    State(state): State<Arc<AppState>>,
    Path(alignment_id): Path<i64>,
) -> ApiResult<Json<Vec<ResolvedMapping>>> {
    let alignment_id = AlignmentId(alignment_id);
    state.sync.get_alignment(alignment_id).await.map_err(reject)?;
    let summaries = state.sync.list_mappings(alignment_id).await.map_err(reject)?;

    let mut mappings = Vec::with_capacity(summaries.len());
    for summary in summaries {
        let resolved = state.resolver.describe(&summary.mapping.assignment).await;
        mappings.push(ResolvedMapping { summary, resolved });
    }
    Ok(Json(mappings))
}

async fn export(
    State(state): State<Arc<AppState>>,
    Path(alignment_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let csv = state
        .sync
        .export_csv(AlignmentId(alignment_id), &state.resolver)
        .await
        .map_err(reject)?;
    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv))
}

async fn vote(
    State(state): State<Arc<AppState>>,
    Path((mapping_id, evaluator)): Path<(i64, String)>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<StatusCode> {
    state
        .evaluations
        .vote(MappingId(mapping_id), &UserId::new(evaluator), req.verdict)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn comment(
    State(state): State<Arc<AppState>>,
    Path((mapping_id, evaluator)): Path<(i64, String)>,
    Json(req): Json<CommentRequest>,
) -> ApiResult<StatusCode> {
    state
        .evaluations
        .comment(MappingId(mapping_id), &UserId::new(evaluator), &req.comment)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_evaluation(
    State(state): State<Arc<AppState>>,
    Path((mapping_id, evaluator)): Path<(i64, String)>,
) -> ApiResult<StatusCode> {
    state
        .evaluations
        .clear(MappingId(mapping_id), &UserId::new(evaluator))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_evaluations(
    State(state): State<Arc<AppState>>,
    Path(mapping_id): Path<i64>,
) -> ApiResult<Json<Vec<Evaluation>>> {
    let evaluations = state
        .evaluations
        .evaluations(MappingId(mapping_id))
        .await
        .map_err(reject)?;
    Ok(Json(evaluations))
}

async fn tally(
    State(state): State<Arc<AppState>>,
    Path(mapping_id): Path<i64>,
) -> ApiResult<Json<Tally>> {
    let tally = state
        .evaluations
        .tally(MappingId(mapping_id))
        .await
        .map_err(reject)?;
    Ok(Json(tally))
}

fn reject(err: CoreError) -> (StatusCode, Json<ApiError>) {
    let status = match &err {
        CoreError::InvalidAssignment(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Import(_) => StatusCode::BAD_REQUEST,
        CoreError::SyncFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Storage(e) => {
            error!(error = %e, "storage failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ApiError::from(err)))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
