//! Control-plane HTTP surface.
//!
//! A thin adapter: every endpoint maps to one store capability and
//! translates the error taxonomy to status codes. All authoritative state
//! lives in the store; this layer is stateless and horizontally scalable.

pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::error::ConductorError;
use crate::store::JobStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
}

pub fn router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    Router::new()
        // Public
        .route(
            "/v1/jobs",
            post(handlers::create_job).get(handlers::list_jobs),
        )
        .route("/v1/jobs/:job_id", get(handlers::get_job))
        .route("/v1/jobs/:job_id/cancel", post(handlers::cancel_job))
        // Internal - scheduler
        .route("/internal/jobs/lease", post(handlers::acquire_lease))
        .route("/internal/jobs/recover", post(handlers::recover_leases))
        // Internal - worker
        .route("/internal/jobs/:job_id/start", post(handlers::start_job))
        .route(
            "/internal/jobs/:job_id/complete",
            post(handlers::complete_job),
        )
        .route("/internal/jobs/:job_id/fail", post(handlers::fail_job))
        .route(
            "/internal/workers/:worker_id/heartbeat",
            post(handlers::worker_heartbeat),
        )
        // Ops
        .route("/healthz", get(handlers::health))
        .route("/readyz", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .layer(middleware)
        .with_state(state)
}

/// Maps the error taxonomy to user-visible responses: conflicts for gate
/// violations, plain-text reasons for caller mistakes, opaque 500s for
/// store trouble.
pub struct ApiError(ConductorError);

impl From<ConductorError> for ApiError {
    fn from(error: ConductorError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ConductorError::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, self.0.to_string())
            }
            ConductorError::JobNotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            ConductorError::Validation(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            ConductorError::Cancelled => (
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily unavailable".to_string(),
            ),
            ConductorError::Store(error) => {
                tracing::error!(error = %error, "store failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            ConductorError::Internal(error) => {
                tracing::error!(error = %error, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, message).into_response()
    }
}
