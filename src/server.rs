//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | `{status, version}` |
//! | `POST` | `/classify` | Split and classify uploads into logical documents |
//! | `POST` | `/suggest-fields` | Propose header and line-item fields |
//! | `POST` | `/extract` | Single-shot extraction |
//! | `POST` | `/extract/stream` | Streamed extraction as server-sent events |
//! | `POST` | `/templates/match` | Rank saved templates for a supplier |
//! | `POST` | `/templates` | Save (upsert) a template |
//! | `POST` | `/export/csv` | Render an extraction result as CSV |
//! | `POST` | `/agent` | Run the orchestrator for a job |
//! | `GET` | `/jobs/{id}/extraction` | Latest extraction snapshot of a job |
//! | `GET` | `/jobs/{id}/documents` | Logical documents recorded for a job |
//! | `GET` | `/jobs/{id}/turns` | Conversation turns of a job |
//! | `GET` | `/files/{*id}` | Stored excerpt bytes |
//!
//! Document endpoints take either `files` (base64 uploads) or `fileUrls`,
//! never both.
//!
//! # Errors
//!
//! Errors are JSON: `{"error": {"code": "...", "message": "..."}}`.
//!
//! | Failure | Status | Code |
//! |---------|--------|------|
//! | invalid input | 400 | `bad_request` |
//! | capability disabled | 400 | `embeddings_disabled` / `model_disabled` |
//! | not found | 404 | `not_found` |
//! | unsupported mime type | 415 | `unsupported_media_type` |
//! | unreadable PDF | 422 | `pdf_error` |
//! | model answer malformed | 502 | `malformed_response` |
//! | model or fetch failure | 502 | `model_error` / `fetch_error` |
//! | model not configured | 503 | `model_disabled` |
//! | storage failure | 500 | `storage_error` |

use std::collections::HashMap;
use std::convert::Infallible;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use compileflow_core::csv::{export_csv, CsvLayout};
use compileflow_core::models::{ExtractionResult, FieldSet, LogicalDocument, Template, TemplateMatch};

use crate::agent::{AgentOutcome, AgentRequest};
use crate::config::Config;
use crate::error::PipelineError;
use crate::extract::{ExtractionEnvelope, ExtractionFrame};
use crate::llm::ModelError;
use crate::pipeline::Pipeline;
use crate::segmenter::{BatchOutcome, FileError};
use crate::source::{check_exclusive, fetch_url, guess_mime, resolve_sources, FileInput, SourcesInput};
use crate::suggest::FieldSuggestion;

/// Uploads arrive base64-encoded inside JSON.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Start the server on `[server].bind`. Runs until the process ends.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pipeline = Pipeline::from_config(config).await?;
    let app = router(pipeline);

    println!("CompileFlow server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(pipeline: Pipeline) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/classify", post(handle_classify))
        .route("/suggest-fields", post(handle_suggest_fields))
        .route("/extract", post(handle_extract))
        .route("/extract/stream", post(handle_extract_stream))
        .route("/templates/match", post(handle_match_templates))
        .route("/templates", post(handle_save_template))
        .route("/export/csv", post(handle_export_csv))
        .route("/agent", post(handle_agent))
        .route("/jobs/{id}/extraction", get(handle_job_extraction))
        .route("/jobs/{id}/documents", get(handle_job_documents))
        .route("/jobs/{id}/turns", get(handle_job_turns))
        .route("/files/{*id}", get(handle_file))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(pipeline)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError::from(PipelineError::storage(err))
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let (status, code) = match &err {
            PipelineError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "bad_request".to_string()),
            PipelineError::Disabled(what) => (StatusCode::BAD_REQUEST, format!("{}_disabled", what)),
            PipelineError::UnsupportedMime(_) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_media_type".to_string(),
            ),
            PipelineError::Pdf(_) => (StatusCode::UNPROCESSABLE_ENTITY, "pdf_error".to_string()),
            PipelineError::MalformedResponse(_) => {
                (StatusCode::BAD_GATEWAY, "malformed_response".to_string())
            }
            PipelineError::Model(ModelError::NotConfigured(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "model_disabled".to_string())
            }
            PipelineError::Model(_) => (StatusCode::BAD_GATEWAY, "model_error".to_string()),
            PipelineError::Fetch { .. } => (StatusCode::BAD_GATEWAY, "fetch_error".to_string()),
            PipelineError::Storage(_) | PipelineError::Persistence(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_error".to_string())
            }
        };
        if status.is_server_error() {
            warn!(%status, error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /classify ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyRequest {
    #[serde(flatten)]
    sources: SourcesInput,
    /// When set, the documents are recorded for the job.
    #[serde(default)]
    job_id: Option<String>,
}

/// URLs are fetched one by one so a bad URL is reported like a bad file.
async fn handle_classify(
    State(pipeline): State<Pipeline>,
    Json(req): Json<ClassifyRequest>,
) -> ApiResult<Json<BatchOutcome>> {
    check_exclusive(&req.sources)?;

    let mut fetch_errors = Vec::new();
    let mut files = Vec::new();
    if !req.sources.files.is_empty() {
        files = req
            .sources
            .files
            .iter()
            .map(FileInput::decode)
            .collect::<Result<_, _>>()?;
    } else {
        for url in &req.sources.file_urls {
            match fetch_url(url, pipeline.blobs(), pipeline.http()).await {
                Ok(file) => files.push(file),
                Err(e) => fetch_errors.push(FileError {
                    file_name: url.clone(),
                    message: e.to_string(),
                }),
            }
        }
    }

    let mut outcome = if files.is_empty() {
        BatchOutcome::default()
    } else {
        pipeline.segmenter().segment_batch(&files).await?
    };
    fetch_errors.append(&mut outcome.errors);
    outcome.errors = fetch_errors;

    if let Some(job_id) = req.job_id.as_deref().filter(|j| !j.trim().is_empty()) {
        if let Err(e) = pipeline.jobs().record_documents(job_id, &outcome.documents).await {
            warn!(job_id, error = %PipelineError::persistence(e), "failed to record documents");
        }
    }
    Ok(Json(outcome))
}

// ============ POST /suggest-fields ============

async fn handle_suggest_fields(
    State(pipeline): State<Pipeline>,
    Json(req): Json<SourcesInput>,
) -> ApiResult<Json<FieldSuggestion>> {
    let sources = resolve_sources(&req, pipeline.blobs(), pipeline.http()).await?;
    Ok(Json(pipeline.suggester().suggest(&sources).await?))
}

// ============ POST /extract, /extract/stream ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractRequest {
    #[serde(flatten)]
    sources: SourcesInput,
    #[serde(flatten)]
    fields: FieldSet,
    #[serde(default)]
    job_id: Option<String>,
}

async fn handle_extract(
    State(pipeline): State<Pipeline>,
    Json(req): Json<ExtractRequest>,
) -> ApiResult<Json<ExtractionEnvelope>> {
    let sources = resolve_sources(&req.sources, pipeline.blobs(), pipeline.http()).await?;
    let result = pipeline.extractor().extract(&sources, &req.fields).await?;

    if let Some(job_id) = req.job_id.as_deref().filter(|j| !j.trim().is_empty()) {
        let snapshot = serde_json::json!({ "final": true, "data": &result });
        if let Err(e) = pipeline.jobs().put_snapshot(job_id, &snapshot).await {
            warn!(job_id, error = %PipelineError::persistence(e), "failed to persist extraction");
        }
    }
    Ok(Json(ExtractionEnvelope::new(result, &req.fields, sources.len())))
}

fn frame_event(frame: ExtractionFrame) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&frame).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "message": e.to_string() }).to_string()
    });
    Ok(Event::default().data(data))
}

async fn handle_extract_stream(
    State(pipeline): State<Pipeline>,
    Json(req): Json<ExtractRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let job_id = req.job_id.clone().unwrap_or_default();
    if job_id.trim().is_empty() {
        return Err(PipelineError::invalid("jobId is required").into());
    }
    let sources = resolve_sources(&req.sources, pipeline.blobs(), pipeline.http()).await?;
    let frames = pipeline
        .extractor()
        .extract_streaming(&job_id, sources, req.fields)
        .await?;
    Ok(Sse::new(frames.map(frame_event)).keep_alive(KeepAlive::default()))
}

// ============ Templates ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchRequest {
    #[serde(default)]
    supplier: String,
    #[serde(default)]
    client_name: Option<String>,
}

async fn handle_match_templates(
    State(pipeline): State<Pipeline>,
    Json(req): Json<MatchRequest>,
) -> ApiResult<Json<Vec<TemplateMatch>>> {
    let matches = pipeline
        .templates()
        .match_templates(&req.supplier, req.client_name.as_deref())
        .await?;
    Ok(Json(matches))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveTemplateRequest {
    #[serde(default)]
    supplier: String,
    #[serde(default)]
    client_name: Option<String>,
    #[serde(flatten)]
    fields: FieldSet,
}

async fn handle_save_template(
    State(pipeline): State<Pipeline>,
    Json(req): Json<SaveTemplateRequest>,
) -> ApiResult<Json<Template>> {
    let template = pipeline
        .templates()
        .save_template(&req.supplier, req.client_name.as_deref(), req.fields)
        .await?;
    Ok(Json(template))
}

// ============ POST /export/csv ============

#[derive(Deserialize)]
struct ExportRequest {
    data: ExtractionResult,
    #[serde(default)]
    labels: HashMap<String, String>,
    /// Optional field lists; they fix the column order.
    #[serde(flatten)]
    fields: FieldSet,
}

async fn handle_export_csv(Json(req): Json<ExportRequest>) -> Response {
    let mut layout = CsvLayout::from_fields(&req.fields);
    layout.labels.extend(req.labels);
    let csv = export_csv(&req.data, &layout);
    (
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        csv,
    )
        .into_response()
}

// ============ POST /agent ============

async fn handle_agent(
    State(pipeline): State<Pipeline>,
    Json(req): Json<AgentRequest>,
) -> ApiResult<Json<AgentOutcome>> {
    Ok(Json(pipeline.orchestrator().run(req).await?))
}

// ============ Jobs and files ============

async fn handle_job_extraction(
    State(pipeline): State<Pipeline>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    pipeline
        .jobs()
        .get_snapshot(&id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(format!("no extraction for job {}", id)))
}

async fn handle_job_documents(
    State(pipeline): State<Pipeline>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<LogicalDocument>>> {
    Ok(Json(pipeline.jobs().list_documents(&id).await.map_err(internal)?))
}

async fn handle_job_turns(
    State(pipeline): State<Pipeline>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let turns = pipeline.jobs().list_turns(&id).await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "jobId": id, "turns": turns })))
}

async fn handle_file(State(pipeline): State<Pipeline>, Path(id): Path<String>) -> ApiResult<Response> {
    // Ids that do not resolve inside the store are reported as missing.
    let bytes = pipeline
        .blobs()
        .get(&id)
        .await
        .ok()
        .flatten()
        .ok_or_else(|| not_found(format!("file not found: {}", id)))?;
    Ok(([(header::CONTENT_TYPE, guess_mime(&id))], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (PipelineError::invalid("x"), StatusCode::BAD_REQUEST, "bad_request"),
            (PipelineError::Disabled("embeddings"), StatusCode::BAD_REQUEST, "embeddings_disabled"),
            (
                PipelineError::UnsupportedMime("text/plain".into()),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_media_type",
            ),
            (PipelineError::Pdf("bad".into()), StatusCode::UNPROCESSABLE_ENTITY, "pdf_error"),
            (
                PipelineError::MalformedResponse("x".into()),
                StatusCode::BAD_GATEWAY,
                "malformed_response",
            ),
            (
                PipelineError::Model(ModelError::NotConfigured("model".into())),
                StatusCode::SERVICE_UNAVAILABLE,
                "model_disabled",
            ),
            (
                PipelineError::Fetch {
                    url: "u".into(),
                    message: "m".into(),
                },
                StatusCode::BAD_GATEWAY,
                "fetch_error",
            ),
        ];
        for (err, status, code) in cases {
            let app = AppError::from(err);
            assert_eq!(app.status, status);
            assert_eq!(app.code, code);
        }
    }
}
