//! HTTP surface for the web layer

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::comparator::CompareMode;
use crate::core::{
    LimitOverride, Priority, Submission, SubmissionId, TestCase, VerdictStatus,
};
use crate::engine::{EngineHealth, JudgeEngine};
use crate::error::{EngineError, ErrorBody};
use crate::reporter::SubmissionVerdict;

type AppState = Arc<JudgeEngine>;

pub fn router(engine: Arc<JudgeEngine>) -> Router {
    Router::new()
        .route("/submissions", post(submit))
        .route("/submissions/{id}", delete(cancel))
        .route("/run", post(run))
        .route("/languages", get(languages))
        .route("/health", get(health))
        .with_state(engine)
}

/// Engine error rendered as `{code, message, retryable}`
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            EngineError::UnsupportedLanguage(_) | EngineError::MalformedRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::QueueFull { .. } | EngineError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::UnknownSubmission(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody::from(&self.0))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub submission_id: Option<SubmissionId>,
    pub language: String,
    pub code: String,
    pub problem_id: i64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub limits: LimitOverride,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub submission_id: SubmissionId,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub stdin: String,
    pub expected_output: String,
    #[serde(default)]
    pub compare: CompareMode,
    #[serde(default)]
    pub limits: LimitOverride,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub verdict: VerdictStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_case: Option<usize>,
    pub time: u32,
    pub memory: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
}

impl From<SubmissionVerdict> for RunResponse {
    fn from(verdict: SubmissionVerdict) -> Self {
        let output = verdict
            .cases
            .into_iter()
            .next()
            .and_then(|case| case.output_preview);
        Self {
            verdict: verdict.verdict,
            failing_case: verdict.failing_case,
            time: verdict.time,
            memory: verdict.memory,
            stderr: verdict.stderr,
            output,
            compile_output: verdict.compile_output,
        }
    }
}

async fn submit(
    State(engine): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let id = request
        .submission_id
        .unwrap_or_else(|| engine.next_submission_id());
    let submission = Submission::for_problem(id, request.language, request.code, request.problem_id)
        .with_priority(request.priority)
        .with_limits(request.limits);

    let handle = engine.submit(submission)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            submission_id: handle.id(),
        }),
    ))
}

async fn run(
    State(engine): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let case = TestCase::new(request.stdin, request.expected_output);
    let submission = Submission::inline(
        engine.next_submission_id(),
        request.language,
        request.code,
        vec![case],
        request.compare,
    )
    .with_priority(Priority::High)
    .with_limits(request.limits);

    let verdict = engine.run(submission).await?;
    Ok(Json(RunResponse::from(verdict)))
}

async fn cancel(
    State(engine): State<AppState>,
    Path(id): Path<SubmissionId>,
) -> Result<StatusCode, ApiError> {
    engine.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct LanguagesResponse {
    pub languages: Vec<String>,
}

async fn languages(State(engine): State<AppState>) -> Json<LanguagesResponse> {
    Json(LanguagesResponse {
        languages: engine.languages().supported().to_vec(),
    })
}

async fn health(State(engine): State<AppState>) -> Json<EngineHealth> {
    Json(engine.health())
}
