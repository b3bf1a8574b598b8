use std::path::PathBuf;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Multipart, Path as AxumPath, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    AppState, maintenance,
    pipeline::{BatchRunner, BatchState, BatchTracker},
    spreadsheet::{self, ParsedSheet, PromptRow},
    store::{Job, NewJob},
    web::{
        ApiError, AuthUser, internal_error, json_error, require_user,
        storage::{XLSX_CONTENT_TYPE, stream_file},
        uploads::{FileFieldConfig, receive_single_file},
    },
};

const UPLOAD_FIELD: FileFieldConfig<'static> = FileFieldConfig {
    field_name: "file",
    allowed_extensions: &["xlsx"],
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/content/upload", post(upload))
        .route("/api/content/:id/status", get(job_status))
        .route("/api/content/:id/download", get(download))
}

#[derive(Serialize)]
struct UploadResponse {
    status: bool,
    job_id: Uuid,
    status_url: String,
    /// Header first, then every accepted data row as `[topic, prompt]`.
    data: Vec<[String; 2]>,
}

#[derive(Serialize)]
struct JobStatusResponse {
    status: bool,
    job_id: Uuid,
    source_file_name: String,
    /// `None` once the batch has been forgotten (restart or pruning).
    state: Option<BatchState>,
    total_rows: Option<usize>,
    completed_rows: Option<usize>,
    persisted_rows: usize,
    error_message: Option<String>,
    download_url: String,
}

async fn upload(
    State(state): State<AppState>,
    jar: CookieJar,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let user = require_user(&state, &jar).await?;
    let settings = state.settings();

    let upload_dir = settings.uploads_dir().join(Uuid::new_v4().to_string());
    let saved = match receive_single_file(multipart, &upload_dir, UPLOAD_FIELD).await {
        Ok(saved) => saved,
        Err(err) => {
            let _ = tokio::fs::remove_dir_all(&upload_dir).await;
            if err.is_client_error() {
                return Err(json_error(StatusCode::BAD_REQUEST, err.to_string()));
            }
            return Err(internal_error(err.into()));
        }
    };
    maintenance::schedule_removal(upload_dir.clone(), settings.file_retention);

    let sheet = match parse_upload(saved.bytes).await {
        Ok(sheet) => sheet,
        Err(err) => {
            let _ = tokio::fs::remove_dir_all(&upload_dir).await;
            return Err(err);
        }
    };

    let job = state
        .store()
        .create_job(NewJob {
            source_file_name: saved.original_name,
            created_by: user.id,
        })
        .await
        .map_err(internal_error)?;

    info!(
        job_id = %job.id,
        user = %user.username,
        rows = sheet.rows.len(),
        file = %job.source_file_name,
        "content job created"
    );

    state.tracker().start(job.id, sheet.rows.len()).await;
    spawn_batch_worker(&state, job.id, sheet.rows.clone());

    Ok(Json(UploadResponse {
        status: true,
        job_id: job.id,
        status_url: format!("/api/content/{}/status", job.id),
        data: echo_table(&sheet),
    }))
}

async fn parse_upload(bytes: Vec<u8>) -> Result<ParsedSheet, ApiError> {
    tokio::task::spawn_blocking(move || spreadsheet::parse_rows(&bytes))
        .await
        .context("spreadsheet parser panicked")
        .map_err(internal_error)?
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))
}

fn spawn_batch_worker(state: &AppState, job_id: Uuid, rows: Vec<PromptRow>) {
    let runner = state.batch_runner();
    let tracker = state.tracker().clone();
    tokio::spawn(async move {
        run_and_record(&runner, &tracker, job_id, &rows).await;
    });
}

/// Run one batch to completion and record its outcome on the tracker.
async fn run_and_record(
    runner: &BatchRunner,
    tracker: &BatchTracker,
    job_id: Uuid,
    rows: &[PromptRow],
) {
    match runner.run_batch(job_id, rows, tracker).await {
        Ok(results) => {
            tracker.complete(job_id).await;
            info!(%job_id, rows = results.len(), "content job completed");
        }
        Err(err) => {
            error!(
                %job_id,
                row = err.row(),
                completed = err.completed(),
                ?err,
                "content job failed"
            );
            let message = format!("{:#}", anyhow::Error::new(err));
            tracker.fail(job_id, message).await;
        }
    }
}

async fn job_status(
    State(state): State<AppState>,
    jar: CookieJar,
    AxumPath(job_id): AxumPath<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let user = require_user(&state, &jar).await?;
    let job = load_owned_job(&state, &user, job_id).await?;

    let persisted_rows = state
        .store()
        .list_row_results(job_id)
        .await
        .map_err(internal_error)?
        .len();
    let batch = state.tracker().get(job_id).await;

    Ok(Json(JobStatusResponse {
        status: true,
        job_id,
        source_file_name: job.source_file_name,
        state: batch.as_ref().map(|b| b.state),
        total_rows: batch.as_ref().map(|b| b.total_rows),
        completed_rows: batch.as_ref().map(|b| b.completed_rows),
        persisted_rows,
        error_message: batch.and_then(|b| b.error_message),
        download_url: format!("/api/content/{job_id}/download"),
    }))
}

async fn download(
    State(state): State<AppState>,
    jar: CookieJar,
    AxumPath(job_id): AxumPath<Uuid>,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &jar).await?;
    let job = load_owned_job(&state, &user, job_id).await?;

    let results = state
        .store()
        .list_row_results(job_id)
        .await
        .map_err(internal_error)?;
    if results.is_empty() {
        return Err(json_error(
            StatusCode::NOT_FOUND,
            "No generated content is available for this job yet.",
        ));
    }

    let workbook = tokio::task::spawn_blocking(move || spreadsheet::write_rows(&results))
        .await
        .context("spreadsheet writer panicked")
        .and_then(|written| written)
        .map_err(internal_error)?;

    let settings = state.settings();
    let file_name = download_name(&job.source_file_name);
    let download_dir: PathBuf = settings.downloads_dir().join(Uuid::new_v4().to_string());
    let path = download_dir.join(&file_name);

    tokio::fs::create_dir_all(&download_dir)
        .await
        .context("failed to create download directory")
        .map_err(internal_error)?;
    tokio::fs::write(&path, workbook)
        .await
        .context("failed to write download workbook")
        .map_err(internal_error)?;
    maintenance::schedule_removal(download_dir, settings.file_retention);

    info!(%job_id, file = %file_name, "content workbook prepared");
    stream_file(&path, &file_name, XLSX_CONTENT_TYPE).await
}

async fn load_owned_job(state: &AppState, user: &AuthUser, job_id: Uuid) -> Result<Job, ApiError> {
    let job = state
        .store()
        .find_job(job_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "Job not found."))?;

    if !user.can_access(job.created_by) {
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "You do not have access to this job.",
        ));
    }
    Ok(job)
}

fn echo_table(sheet: &ParsedSheet) -> Vec<[String; 2]> {
    let header = [
        sheet.header.first().cloned().unwrap_or_default(),
        sheet.header.get(1).cloned().unwrap_or_default(),
    ];
    std::iter::once(header)
        .chain(
            sheet
                .rows
                .iter()
                .map(|row| [row.topic.clone(), row.prompt.clone()]),
        )
        .collect()
}

/// Sanitized source file name, always ending in `.xlsx`.
fn download_name(source: &str) -> String {
    let sanitized = sanitize_filename::sanitize(source);
    let stem = sanitized.trim();
    if stem.is_empty() {
        return "content.xlsx".to_string();
    }
    if stem.to_ascii_lowercase().ends_with(".xlsx") {
        stem.to_string()
    } else {
        format!("{stem}.xlsx")
    }
}
