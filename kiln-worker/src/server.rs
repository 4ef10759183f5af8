use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use kiln_core::DiffusionBackend;
use serde::Serialize;
use tracing::warn;

use crate::orchestrator::{ErrorMessage, Job, JobOutput, Worker};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn run_job<B: DiffusionBackend + 'static>(
    State(worker): State<Arc<Worker<B>>>,
    payload: Result<Json<Job>, JsonRejection>,
) -> (StatusCode, Json<JobOutput>) {
    match payload {
        Ok(Json(job)) => (StatusCode::OK, Json(worker.handle(job).await)),
        Err(rejection) => {
            warn!(status = %rejection.status(), "rejected job body");
            let error = ErrorMessage::One(rejection.body_text());
            (rejection.status(), Json(JobOutput::Error { error }))
        }
    }
}

/// `POST /run` takes `{"id": ..., "input": {...}}` and answers the job output, job
/// errors included, with 200. Submissions queue behind the job in flight. A body that
/// is not a job gets the rejection status with the same `{"error": ...}` shape.
pub fn router<B: DiffusionBackend + 'static>(worker: Arc<Worker<B>>) -> Router {
    Router::new()
        .route("/run", post(run_job::<B>))
        .route("/health", get(health))
        .with_state(worker)
}
