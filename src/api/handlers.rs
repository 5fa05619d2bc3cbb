use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use crate::api::types::{
    AcquireLeaseRequest, AcquireLeaseResponse, CreateJobRequest, CreateJobResponse,
    FailJobRequest, HeartbeatRequest, JobResponse, JobStateResponse, ListJobsParams,
    ListJobsResponse,
};
use crate::api::{ApiError, AppState};
use crate::error::ConductorError;
use crate::store::JobState;

type ApiResult<T> = std::result::Result<T, ApiError>;

fn bad_request(message: impl Into<String>) -> ApiError {
    ConductorError::Validation(message.into()).into()
}

fn parse_job_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| bad_request("invalid job id"))
}

pub async fn create_job(
    State(state): State<AppState>,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body.map_err(|rejection| bad_request(rejection.body_text()))?;

    if request.max_attempts < 1 {
        return Err(bad_request("max_attempts must be at least 1"));
    }
    if request.timeout_seconds <= 0 {
        return Err(bad_request("timeout_seconds must be positive"));
    }

    let job_id = Uuid::new_v4();
    let payload = request.payload.get().as_bytes().to_vec();

    state
        .store
        .create_job(job_id, payload, request.max_attempts, request.timeout_seconds)
        .await?;

    tracing::info!(job_id = %job_id, "job created");

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id,
            state: JobState::Pending,
        }),
    ))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> ApiResult<Json<ListJobsResponse>> {
    let state_filter = params
        .state
        .as_deref()
        .map(str::parse::<JobState>)
        .transpose()
        .map_err(|_| bad_request("invalid state filter"))?;
    let limit = params.limit.unwrap_or(100);

    let jobs = state.store.list_jobs(state_filter, limit).await?;
    let jobs = jobs
        .into_iter()
        .map(JobResponse::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(ListJobsResponse { jobs }))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job_id = parse_job_id(&job_id)?;

    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or(ConductorError::JobNotFound(job_id))?;

    Ok(Json(JobResponse::try_from(job)?))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<StatusCode> {
    let job_id = parse_job_id(&job_id)?;

    state.store.cancel_job(job_id).await?;
    tracing::info!(job_id = %job_id, "job cancelled");

    Ok(StatusCode::OK)
}

pub async fn acquire_lease(
    State(state): State<AppState>,
    body: Result<Json<AcquireLeaseRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = body.map_err(|rejection| bad_request(rejection.body_text()))?;

    if request.lease_duration_seconds <= 0 {
        return Err(bad_request("lease duration must be positive"));
    }

    let grant = state
        .store
        .acquire_lease(
            request.scheduler_id,
            Duration::from_secs(request.lease_duration_seconds as u64),
        )
        .await?;

    match grant {
        Some(grant) => Ok(Json(AcquireLeaseResponse {
            job_id: grant.job_id,
            lease_expires_at: grant.lease_expires_at,
        })
        .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn recover_leases(State(state): State<AppState>) -> StatusCode {
    let store = Arc::clone(&state.store);

    tokio::spawn(async move {
        match store.recover_expired_leases(Utc::now()).await {
            Ok(recovered) if !recovered.is_empty() => {
                tracing::info!(count = recovered.len(), "recovered expired leases");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(error = %error, "lease recovery failed"),
        }
    });

    StatusCode::ACCEPTED
}

pub async fn start_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStateResponse>> {
    let job_id = parse_job_id(&job_id)?;

    state.store.mark_job_running(job_id).await?;

    Ok(Json(JobStateResponse {
        job_id,
        state: JobState::Running,
    }))
}

pub async fn complete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStateResponse>> {
    let job_id = parse_job_id(&job_id)?;

    state.store.mark_job_completed(job_id).await?;

    Ok(Json(JobStateResponse {
        job_id,
        state: JobState::Completed,
    }))
}

pub async fn fail_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Result<Json<FailJobRequest>, JsonRejection>,
) -> ApiResult<Json<JobStateResponse>> {
    let job_id = parse_job_id(&job_id)?;
    let Json(request) = body.map_err(|rejection| bad_request(rejection.body_text()))?;

    if request.error.is_empty() {
        return Err(bad_request("error message required"));
    }

    let final_state = state
        .store
        .mark_job_failed(job_id, &request.error, request.retryable)
        .await?;

    Ok(Json(JobStateResponse {
        job_id,
        state: final_state,
    }))
}

pub async fn worker_heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    body: Option<Json<HeartbeatRequest>>,
) -> ApiResult<StatusCode> {
    let worker_id = Uuid::parse_str(&worker_id).map_err(|_| bad_request("invalid worker id"))?;
    let capacity = body.map(|Json(request)| request.capacity).unwrap_or(1);

    state.store.heartbeat_worker(worker_id, capacity).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match tokio::time::timeout(Duration::from_secs(1), state.store.ping()).await {
        Ok(Ok(())) => (StatusCode::OK, "ready"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let counts: HashMap<JobState, i64> = state
        .store
        .count_jobs_by_state()
        .await?
        .into_iter()
        .collect();

    let mut body = String::from(
        "# HELP conductor_jobs Number of jobs by state.\n# TYPE conductor_jobs gauge\n",
    );
    for state in JobState::ALL {
        let count = counts.get(&state).copied().unwrap_or(0);
        let _ = writeln!(body, "conductor_jobs{{state=\"{state}\"}} {count}");
    }

    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
