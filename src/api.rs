//! Control-plane HTTP API.
//!
//! The routes of the external surface: printer registry and worker
//! lifecycle, job intake (multipart gcode upload), approval and
//! cancellation. Mutating verbs follow the `resource:verb` path style, so
//! the verb rides in the final path segment and is split off here.

use std::path::Path as FsPath;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::context::AppContext;
use crate::models::{Job, JobHistory, JobStatus, Printer, PrinterApi};
use crate::store::{NewJob, NewPrinter, Store, StoreError};

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/printers", get(list_printers).post(create_printer))
        .route("/printers/:id/status", get(printer_status))
        .route("/printers/:id/:verb", put(printer_worker_verb))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(job_details).put(job_verb))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub enum ApiError {
    BadRequest(String),
    NotFound(&'static str),
    Conflict(String),
    Internal(anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> ApiError {
        match err {
            StoreError::NotFound(kind) => ApiError::NotFound(kind),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::NotFound(kind) => (StatusCode::NOT_FOUND, format!("{kind} not exist")),
            ApiError::Conflict(detail) => (StatusCode::CONFLICT, detail),
            ApiError::Internal(err) => {
                error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PrinterFilter {
    group: Option<String>,
}

async fn list_printers(
    State(ctx): State<AppContext>,
    Query(filter): Query<PrinterFilter>,
) -> Result<Json<Vec<Printer>>, ApiError> {
    let printers = ctx.store.printers(filter.group.as_deref(), None)?;
    Ok(Json(printers))
}

#[derive(Debug, Deserialize)]
struct CreatePrinterForm {
    url: String,
    api: String,
    api_key: Option<String>,
    group_name: Option<String>,
    opcua_name: Option<String>,
    camera_url: Option<String>,
    model: Option<String>,
    /// Start a worker for the printer right away.
    #[serde(default)]
    worker: bool,
}

async fn create_printer(
    State(ctx): State<AppContext>,
    axum::Form(form): axum::Form<CreatePrinterForm>,
) -> Result<Response, ApiError> {
    let api = PrinterApi::parse(&form.api)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown printer api {:?}", form.api)))?;

    let printer = ctx.store.create_printer(NewPrinter {
        url: form.url,
        api_key: form.api_key,
        api,
        group_name: form.group_name,
        active: form.worker,
        opcua_name: form.opcua_name,
        camera_url: form.camera_url,
        model: form.model,
    })?;

    if form.worker {
        ctx.manager.start_new(&printer);
    }

    info!(printer = printer.id, url = %printer.url, "printer registered");
    Ok((StatusCode::CREATED, Json(json!({ "id": printer.id }))).into_response())
}

async fn printer_status(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    if ctx.store.get_printer(id)?.is_none() {
        return Err(ApiError::NotFound("printer"));
    }
    Ok(Json(ctx.manager.get_status(id)).into_response())
}

async fn printer_worker_verb(
    State(ctx): State<AppContext>,
    Path((id, verb)): Path<(i64, String)>,
) -> Result<StatusCode, ApiError> {
    match verb.as_str() {
        "worker:start" => {
            if ctx.store.get_printer(id)?.is_none() {
                return Err(ApiError::NotFound("printer"));
            }
            let printer = ctx.store.set_printer_active(id, true)?;
            ctx.manager.start_new(&printer);
            Ok(StatusCode::NO_CONTENT)
        }
        "worker:stop" => {
            if ctx.store.get_printer(id)?.is_none() {
                return Err(ApiError::NotFound("printer"));
            }
            ctx.store.set_printer_active(id, false)?;
            ctx.manager.stop(id).await;
            Ok(StatusCode::NO_CONTENT)
        }
        _ => Err(ApiError::NotFound("route")),
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct JobDetails {
    job: Job,
    history: Vec<JobHistory>,
}

async fn job_details(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> Result<Json<JobDetails>, ApiError> {
    let job = ctx.store.get_job(id)?.ok_or(ApiError::NotFound("job"))?;
    let history = ctx.store.get_job_history(id)?;
    Ok(Json(JobDetails { job, history }))
}

/// Accepted gcode extensions for uploaded files.
fn valid_gcode_extension(filename: &str) -> bool {
    matches!(
        FsPath::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("gcode") | Some("bgcode")
    )
}

async fn submit_job(
    State(ctx): State<AppContext>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut user_id: Option<String> = None;
    let mut printer_id: Option<i64> = None;
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("user_id") => {
                user_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                );
            }
            Some("printer_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                if !text.is_empty() {
                    printer_id = Some(
                        text.parse()
                            .map_err(|_| ApiError::BadRequest("invalid printer_id".into()))?,
                    );
                }
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or("unknown").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                upload = Some((filename, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let user_id = user_id.ok_or_else(|| ApiError::BadRequest("user_id is required".into()))?;
    let (original_filename, content) =
        upload.ok_or_else(|| ApiError::BadRequest("file is required".into()))?;

    if !valid_gcode_extension(&original_filename) {
        return Err(ApiError::BadRequest(
            "invalid file extension, must be .gcode or .bgcode".into(),
        ));
    }

    if !ctx.store.user_exists(&user_id)? {
        return Err(ApiError::NotFound("user"));
    }
    if let Some(printer_id) = printer_id {
        if ctx.store.get_printer(printer_id)?.is_none() {
            return Err(ApiError::NotFound("printer"));
        }
    }

    let stored_name = Store::generate_gcode_filename(&original_filename);
    let file_path = ctx.settings.upload_path.join(&stored_name);
    tokio::fs::write(&file_path, content)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;

    let job = ctx.store.create_job(NewJob {
        user_id: Some(user_id),
        printer_id,
        status: JobStatus::CREATED,
        from_server: true,
        gcode_file_path: Some(file_path.to_string_lossy().into_owned()),
        original_filename: Some(original_filename),
        ..NewJob::default()
    })?;

    info!(job = job.id, "job submitted");
    Ok((StatusCode::CREATED, Json(json!({ "id": job.id }))).into_response())
}

/// `PUT /jobs/{id}:approve` and `PUT /jobs/{id}:cancel`. The id and verb
/// share the final path segment.
fn parse_job_verb(segment: &str) -> Option<(i64, &str)> {
    let (id, verb) = segment.split_once(':')?;
    Some((id.parse().ok()?, verb))
}

async fn job_verb(
    State(ctx): State<AppContext>,
    Path(segment): Path<String>,
) -> Result<StatusCode, ApiError> {
    let Some((id, verb)) = parse_job_verb(&segment) else {
        return Err(ApiError::NotFound("route"));
    };

    let mut job = ctx.store.get_job(id)?.ok_or(ApiError::NotFound("job"))?;

    match verb {
        "approve" => {
            if job.status.contains(JobStatus::PICKED) || job.status.contains(JobStatus::CANCELLED)
            {
                return Err(ApiError::Conflict("job is terminal".into()));
            }
            if !job.status.contains(JobStatus::APPROVED) {
                ctx.store.update_job(&mut job, Some(JobStatus::APPROVED))?;
            }
            Ok(StatusCode::ACCEPTED)
        }
        "cancel" => {
            if job.status.contains(JobStatus::PICKED) || job.status.contains(JobStatus::CANCELLED)
            {
                return Err(ApiError::Conflict("job is terminal".into()));
            }
            if !job.status.contains(JobStatus::CANCEL_ISSUED) {
                ctx.store
                    .update_job(&mut job, Some(JobStatus::CANCEL_ISSUED))?;
            }
            Ok(StatusCode::ACCEPTED)
        }
        _ => Err(ApiError::NotFound("route")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_gcode_extension() {
        assert!(valid_gcode_extension("benchy.gcode"));
        assert!(valid_gcode_extension("BENCHY.GCODE"));
        assert!(valid_gcode_extension("part.bgcode"));
        assert!(!valid_gcode_extension("part.stl"));
        assert!(!valid_gcode_extension("gcode"));
        assert!(!valid_gcode_extension(""));
    }

    #[test]
    fn test_parse_job_verb() {
        assert_eq!(parse_job_verb("12:approve"), Some((12, "approve")));
        assert_eq!(parse_job_verb("3:cancel"), Some((3, "cancel")));
        assert_eq!(parse_job_verb("12"), None);
        assert_eq!(parse_job_verb("abc:approve"), None);
        assert_eq!(parse_job_verb(":approve"), None);
    }
}
