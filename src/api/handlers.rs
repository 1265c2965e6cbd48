use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    engine::{CreateJobRequest, PublishRequest},
    store::{JobFilter, JobStore},
};

use super::dtos::{
    ClearTenantResponse, CreateJobBody, ErrorResponse, JobDetailResponse, ListJobsQuery,
    ListJobsResponse, PublishBody, PublishResponse, RetryBody, RetryResponse,
};

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: message.into() }),
    )
        .into_response()
}

fn internal_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: err.to_string() }),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse { error: "Job not found".to_string() }),
    )
        .into_response()
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<CreateJobBody>,
) -> Response {
    let request = CreateJobRequest {
        tenant: body.tenant,
        job_type: body.job_type,
        language: body.language,
        meta_title: body.meta_title,
        meta_description: body.meta_description,
        generation_hints: body.generation_hints,
        pro_plan: body.pro_plan,
        targets: body.targets,
    };
    match state.producer.create_job(request).await {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(err) => bad_request(err.to_string()),
    }
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let filter = JobFilter {
        status: query.status,
        phase: query.phase,
        job_type: query.job_type,
        id_query: query.q,
        cursor: query.cursor,
        limit: query.limit.unwrap_or(50),
    };
    match state.store.list_jobs(&query.tenant, filter).await {
        Ok(page) => Json(ListJobsResponse {
            jobs: page.jobs,
            next_cursor: page.next_cursor,
        })
        .into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let job = match state.store.job(id).await {
        Ok(Some(job)) => job,
        Ok(None) => return not_found(),
        Err(err) => return internal_error(err),
    };
    match state.store.items(id).await {
        Ok(items) => Json(JobDetailResponse { job, items }).into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.producer.cancel_job(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => bad_request("job is not cancellable"),
        Err(err) => internal_error(err),
    }
}

pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RetryBody>,
) -> Response {
    match state.producer.retry_failed(id, body.phase).await {
        Ok(retried) => Json(RetryResponse { retried }).into_response(),
        Err(err) => internal_error(err),
    }
}

pub async fn publish_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PublishBody>,
) -> Response {
    let request = PublishRequest {
        item_ids: body.item_ids,
        apply_only_changed: body.apply_only_changed,
    };
    match state.producer.start_publish(id, request).await {
        Ok(queued) => Json(PublishResponse { queued }).into_response(),
        Err(err) => bad_request(err.to_string()),
    }
}

pub async fn clear_tenant(State(state): State<AppState>, Path(tenant): Path<String>) -> Response {
    match state.producer.clear_tenant(&tenant).await {
        Ok(removed) => Json(ClearTenantResponse { removed }).into_response(),
        Err(err) => internal_error(err),
    }
}
