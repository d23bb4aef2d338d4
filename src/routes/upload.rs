use std::io;

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::Redirect;
use futures::TryStreamExt;
use tokio_util::io::StreamReader;

use crate::app_state::AppState;
use crate::routes::ApiError;
use crate::services::validation::{self, ValidationError, MAX_UPLOAD_BYTES};

/// POST /upload — store a sheet image and start converting it.
///
/// Redirects to `/sheet/{id}` as soon as the upload is stored; conversion runs
/// in the background. Re-uploading identical bytes redirects to the existing job.
pub async fn upload_sheet(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Redirect, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(rejection)? {
        if field.name() != Some("file") {
            continue;
        }

        let content_type = validation::parse_content_type(field.content_type())?;
        let body = std::pin::pin!(StreamReader::new(field.map_err(read_error)));
        let stored = state.content.store(content_type, body).await?;

        metrics::counter!("sheet_uploads_total").increment(1);
        if stored.created {
            state.runner.spawn(stored.job.clone());
        } else {
            metrics::counter!("sheet_uploads_deduplicated").increment(1);
        }
        tracing::info!(
            job_id = %stored.job.id,
            created = stored.created,
            status = %stored.job.status,
            "Upload accepted"
        );

        return Ok(Redirect::to(&format!("/sheet/{}", stored.job.id)));
    }

    Err(ValidationError::MissingFile.into())
}

/// Hitting the request body cap means the file was too big, not malformed.
fn rejection(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return too_large().into();
    }
    ApiError::Multipart(err.body_text())
}

fn read_error(err: MultipartError) -> io::Error {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return io::Error::new(io::ErrorKind::InvalidData, too_large());
    }
    io::Error::other(err)
}

fn too_large() -> ValidationError {
    ValidationError::TooLarge {
        limit: MAX_UPLOAD_BYTES,
    }
}
