use std::path::Path;

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio_util::io::ReaderStream;

use crate::app_state::AppState;
use crate::models::job::{JobId, JobStatus, SheetJob};
use crate::models::sheet::SheetResponse;
use crate::routes::ApiError;
use crate::services::descriptor::{INTERCHANGE_FILE, PACKAGE_FILE};
use crate::services::storage::StoreError;

const MUSICXML_MIME: &str = "application/vnd.recordare.musicxml+xml";
const MXL_MIME: &str = "application/vnd.recordare.musicxml";
/// Download name of the packaged score, whatever the job id.
const DOWNLOAD_NAME: &str = "score.mxl";

async fn load(state: &AppState, raw_id: &str) -> Result<SheetJob, ApiError> {
    let id: JobId = raw_id.parse().map_err(|_| ApiError::NotFound)?;
    Ok(state.jobs.load(&id).await?)
}

/// GET /sheet/{id} — the job descriptor, whatever its status.
pub async fn get_sheet(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<SheetResponse>, ApiError> {
    let job = load(&state, &id).await?;
    Ok(Json(job.into()))
}

/// GET /sheet/{id}/data — the cleaned MusicXML document once conversion is done.
pub async fn get_sheet_data(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let job = load(&state, &id).await?;
    match job.status {
        JobStatus::Done => {
            stream_file(&state.jobs.artifact_path(&job.id, INTERCHANGE_FILE), MUSICXML_MIME, None)
                .await
        }
        JobStatus::Fail => Err(ApiError::ConversionFailed),
        JobStatus::Pending | JobStatus::InProgress => Err(ApiError::InProgress),
    }
}

/// GET /sheet/{id}/input — the uploaded image, available in every status.
pub async fn get_sheet_input(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let job = load(&state, &id).await?;
    let path = state
        .jobs
        .artifact_path(&job.id, job.content_type.input_file_name());
    stream_file(&path, job.content_type.mime(), None).await
}

/// GET /sheet/{id}/download — the packaged score as an attachment.
pub async fn download_sheet(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let job = load(&state, &id).await?;
    if job.status != JobStatus::Done {
        return Err(ApiError::NotReady);
    }
    stream_file(
        &state.jobs.artifact_path(&job.id, PACKAGE_FILE),
        MXL_MIME,
        Some(DOWNLOAD_NAME),
    )
    .await
}

/// GET /sheet/{id}/error — why a failed conversion failed.
pub async fn get_sheet_error(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let job = load(&state, &id).await?;
    if job.status != JobStatus::Fail {
        return Err(ApiError::NotFound);
    }
    let detail = state
        .jobs
        .read_error(&job.id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], detail).into_response())
}

async fn stream_file(
    path: &Path,
    content_type: &'static str,
    attachment: Option<&str>,
) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(StoreError::io("open artifact"))?;
    let len = file
        .metadata()
        .await
        .map_err(StoreError::io("stat artifact"))?
        .len();

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, len);
    if let Some(name) = attachment {
        response = response.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        );
    }
    response
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(ApiError::from)
}
