use crate::config::ApiConfig;
use crate::document_store::DocumentStore;
use crate::file_validator::{UploadedFile, MAX_FILE_SIZE_BYTES};
use crate::operations::{Operation, OperationDescriptor};
use crate::processor::{cleanup_file, ImageProcessor, ProcessingError, ProcessingOutcome};
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Path as PathParam, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Room for multipart framing on top of the largest accepted file
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<ImageProcessor>,
    pub store: Arc<dyn DocumentStore>,
    pub upload_dir: PathBuf,
}

/// Errors raised while handling an upload request
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Failed to read multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("Failed to store upload: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

/// Body of a successful processing response
#[derive(Debug, Serialize)]
pub struct SuccessEnvelope {
    pub message: &'static str,
    #[serde(flatten)]
    pub outcome: ProcessingOutcome,
}

/// Body of every failed response
#[derive(Debug, Serialize)]
pub struct FailureEnvelope {
    pub success: bool,
    pub message: String,
    pub error: String,
}

impl FailureEnvelope {
    fn response(status: StatusCode, message: impl Into<String>, error: impl Into<String>) -> Response {
        (
            status,
            Json(Self {
                success: false,
                message: message.into(),
                error: error.into(),
            }),
        )
            .into_response()
    }
}

/// Operation catalogue response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationsResponse {
    pub success: bool,
    pub operations: BTreeMap<&'static str, OperationDescriptor>,
    pub total_operations: usize,
}

/// Fields collected from an upload form
#[derive(Debug, Default)]
struct UploadForm {
    file: Option<UploadedFile>,
    custom_prompt: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(AnyOrigin)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin)
        }
    } else {
        CorsLayer::new()
    };

    let mut router = Router::new()
        .route("/", get(welcome))
        .route("/ready", get(readiness_check))
        .route("/operations", get(list_operations))
        .route("/operations/:operation", get(describe_operation))
        .route("/process/refrigerator", post(process_refrigerator))
        .route("/process/bill", post(process_bill));

    if let Some(dir) = config.static_dir.as_ref().filter(|d| d.is_dir()) {
        info!(dir = %dir.display(), "Serving static files");
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(DefaultBodyLimit::max(
            MAX_FILE_SIZE_BYTES as usize + MULTIPART_OVERHEAD_BYTES,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// Liveness endpoint
async fn welcome() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Welcome to Pikit App",
        "status": "Server is running successfully",
        "timestamp": Utc::now(),
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

async fn list_operations() -> Json<OperationsResponse> {
    let operations: BTreeMap<_, _> = Operation::ALL
        .iter()
        .map(|op| (op.as_str(), op.descriptor()))
        .collect();

    Json(OperationsResponse {
        success: true,
        total_operations: operations.len(),
        operations,
    })
}

async fn describe_operation(PathParam(tag): PathParam<String>) -> Response {
    match tag.parse::<Operation>() {
        Ok(operation) => Json(operation.descriptor()).into_response(),
        Err(e) => FailureEnvelope::response(StatusCode::NOT_FOUND, "Unknown operation", e.to_string()),
    }
}

async fn process_refrigerator(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    run_operation(&state, multipart, Operation::ObjectDetection).await
}

async fn process_bill(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    run_operation(&state, multipart, Operation::BillExtraction).await
}

/// Response messages for each upload route
fn route_messages(operation: Operation) -> (&'static str, &'static str) {
    match operation {
        Operation::ObjectDetection => (
            "Refrigerator analysis completed successfully",
            "Failed to analyze refrigerator",
        ),
        Operation::BillExtraction => (
            "Bill extraction completed successfully",
            "Failed to extract bill data",
        ),
    }
}

#[instrument(skip(state, multipart))]
async fn run_operation(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
    operation: Operation,
) -> Response {
    let (success_message, failure_message) = route_messages(operation);

    match handle_upload(state, multipart, operation).await {
        Ok(outcome) => Json(SuccessEnvelope {
            message: success_message,
            outcome,
        })
        .into_response(),
        Err(e) => {
            error!(operation = %operation, error = %e, "Upload request failed");
            FailureEnvelope::response(StatusCode::BAD_REQUEST, failure_message, e.to_string())
        }
    }
}

async fn handle_upload(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
    operation: Operation,
) -> Result<ProcessingOutcome, ApiError> {
    let form = match multipart {
        Ok(mut multipart) => read_upload(&mut multipart, &state.upload_dir).await?,
        Err(rejection) => {
            // Treated like a form without a file so validation reports it
            debug!(error = %rejection, "Request body is not multipart");
            UploadForm::default()
        }
    };

    let prompt = form.custom_prompt.as_deref();
    let outcome = match operation {
        Operation::ObjectDetection => state.processor.detect_objects(form.file, prompt).await?,
        Operation::BillExtraction => state.processor.extract_bill_data(form.file, prompt).await?,
    };

    Ok(outcome)
}

/// Collect the `file` and `customPrompt` fields, spooling the file to disk
async fn read_upload(multipart: &mut Multipart, upload_dir: &Path) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();

    let result = collect_fields(multipart, upload_dir, &mut form).await;
    if let Err(e) = result {
        if let Some(file) = form.file.take() {
            cleanup_file(&file.path).await;
        }
        return Err(e);
    }

    Ok(form)
}

async fn collect_fields(
    multipart: &mut Multipart,
    upload_dir: &Path,
    form: &mut UploadForm,
) -> Result<(), ApiError> {
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") if form.file.is_none() => {
                let file = spool_file(field, upload_dir).await?;
                let oversized = file.size > MAX_FILE_SIZE_BYTES;
                form.file = Some(file);
                if oversized {
                    // The rest of the body may be cut off by the request limit
                    break;
                }
            }
            Some("customPrompt") => {
                let text = field.text().await?;
                if !text.trim().is_empty() {
                    form.custom_prompt = Some(text);
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Stream one multipart field into a uniquely named file.
///
/// Bytes past the size ceiling are counted but not written, so an oversized
/// upload reaches validation with its size instead of failing as a body error.
async fn spool_file(mut field: Field<'_>, upload_dir: &Path) -> Result<UploadedFile, ApiError> {
    let original_name = field.file_name().unwrap_or_default().to_string();
    let mime_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();

    tokio::fs::create_dir_all(upload_dir).await?;
    let path = upload_dir.join(Uuid::new_v4().simple().to_string());
    let mut out = tokio::fs::File::create(&path).await?;

    let mut size: u64 = 0;
    let written = async {
        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(_) if size > MAX_FILE_SIZE_BYTES => break,
                Err(e) => return Err(ApiError::from(e)),
            };
            size += chunk.len() as u64;
            if size <= MAX_FILE_SIZE_BYTES {
                out.write_all(&chunk).await?;
            }
        }
        out.flush().await?;
        Ok::<(), ApiError>(())
    }
    .await;

    if let Err(e) = written {
        cleanup_file(&path).await;
        return Err(e);
    }

    debug!(path = %path.display(), size = size, mime_type = %mime_type, "Upload spooled");

    Ok(UploadedFile {
        path,
        original_name,
        mime_type,
        size,
    })
}

/// Turn a handler panic into a JSON 500
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    };

    error!(error = %detail, "Unhandled error");

    FailureEnvelope::response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error",
        detail,
    )
}

/// Start the HTTP API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting image processing API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
