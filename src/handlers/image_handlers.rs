//! HTTP handlers for uploads, downloads, deletes and short-link redirects.
//! Everything past request parsing is delegated to `ShareService`.

use crate::{
    errors::AppError,
    models::upload::UploadRequest,
    services::{
        share_service::{DeleteOutcome, ShareService},
        short_code,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use bytes::Bytes;
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

/// Upper bound on files accepted by a single upload request.
pub const MAX_FILES_PER_UPLOAD: usize = 10;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub links: Vec<UploadedLink>,
    pub errors: Vec<FailedUpload>,
}

#[derive(Debug, Serialize)]
pub struct UploadedLink {
    pub file_name: String,
    pub short_code: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct FailedUpload {
    pub file_name: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub unique_link_id: Uuid,
    pub outcome: DeleteOutcome,
}

/// `POST /api/images/upload`
///
/// Multipart form with one or more `file` parts and `duration_minutes`,
/// given once for all files or once per file in the same order.
pub async fn upload_images(
    State(service): State<ShareService>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut files: Vec<(String, Bytes)> = Vec::new();
    let mut durations: Vec<String> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::bad_request(err.to_string()))?;
                files.push((file_name, bytes));
            }
            Some("duration_minutes") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.to_string()))?;
                durations.push(text);
            }
            other => debug!(field = ?other, "ignoring unknown multipart field"),
        }
    }

    if files.len() > MAX_FILES_PER_UPLOAD {
        return Err(AppError::bad_request(format!(
            "at most {} files per upload",
            MAX_FILES_PER_UPLOAD
        )));
    }

    info!(files = files.len(), "received upload request");
    let requests = pair_durations(files, &durations)?;
    let outcomes = service.upload_batch(requests).await?;

    let mut response = UploadResponse {
        links: Vec::new(),
        errors: Vec::new(),
    };
    for outcome in outcomes {
        match outcome.result {
            Ok(code) => response.links.push(UploadedLink {
                file_name: outcome.file_name,
                url: format!("/s/{}", code),
                short_code: code,
            }),
            Err(err) => response.errors.push(FailedUpload {
                file_name: outcome.file_name,
                error: AppError::from(err).message,
            }),
        }
    }

    if response.links.is_empty() {
        return Err(AppError::internal("upload failed"));
    }
    let status = if response.errors.is_empty() {
        StatusCode::CREATED
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok((status, Json(response)).into_response())
}

/// Attach a duration to every file: one shared value or one per file.
fn pair_durations(
    files: Vec<(String, Bytes)>,
    durations: &[String],
) -> Result<Vec<UploadRequest>, AppError> {
    let parsed = durations
        .iter()
        .map(|raw| {
            raw.trim().parse::<f64>().map_err(|_| {
                AppError::bad_request(format!("duration_minutes `{}` is not a number", raw))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let per_file: Vec<f64> = match parsed.len() {
        0 if files.is_empty() => Vec::new(),
        0 => return Err(AppError::bad_request("duration_minutes is required")),
        1 => vec![parsed[0]; files.len()],
        n if n == files.len() => parsed,
        n => {
            return Err(AppError::bad_request(format!(
                "got {} durations for {} files",
                n,
                files.len()
            )));
        }
    };

    Ok(files
        .into_iter()
        .zip(per_file)
        .map(|((file_name, bytes), minutes)| UploadRequest::new(file_name, bytes, minutes))
        .collect())
}

/// `GET /api/images/{unique_link_id}`: stream the image body.
pub async fn get_image(
    State(service): State<ShareService>,
    Path(unique_link_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let fetched = service.fetch_image(unique_link_id).await?;
    let remaining = (fetched.record.expires_at - service.now()).num_seconds().max(0);

    let body = Body::from_stream(ReaderStream::new(fetched.body));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&fetched.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("private, max-age={}", remaining)) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    Ok(response)
}

/// `DELETE /api/images/{unique_link_id}`
///
/// Deleting an image that is already gone succeeds with `already_absent`.
pub async fn delete_image(
    State(service): State<ShareService>,
    Path(unique_link_id): Path<Uuid>,
) -> Result<Json<DeleteResponse>, AppError> {
    let outcome = service.delete_image(unique_link_id).await?;
    Ok(Json(DeleteResponse {
        unique_link_id,
        outcome,
    }))
}

/// `GET /s/{short_code}`: redirect to the image it points at.
pub async fn redirect_short_link(
    State(service): State<ShareService>,
    Path(code): Path<String>,
) -> Result<Redirect, AppError> {
    if !short_code::is_well_formed(&code) {
        return Err(AppError::not_found(format!("short link `{}` not found", code)));
    }
    let unique_link_id = service.resolve_short_link(&code).await?;
    Ok(Redirect::temporary(&format!("/api/images/{}", unique_link_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(n: usize) -> Vec<(String, Bytes)> {
        (0..n)
            .map(|i| (format!("f{i}.png"), Bytes::from_static(b"x")))
            .collect()
    }

    #[test]
    fn single_duration_applies_to_every_file() {
        let requests = pair_durations(files(3), &["15".to_string()]).expect("pair");
        assert!(requests.iter().all(|r| r.duration_minutes == 15.0));
    }

    #[test]
    fn per_file_durations_pair_in_order() {
        let requests =
            pair_durations(files(2), &["5".to_string(), " 7.5 ".to_string()]).expect("pair");
        assert_eq!(requests[0].duration_minutes, 5.0);
        assert_eq!(requests[1].duration_minutes, 7.5);
    }

    #[test]
    fn mismatched_or_missing_durations_are_rejected() {
        let err = pair_durations(files(3), &["1".into(), "2".into()]).expect_err("mismatch");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err = pair_durations(files(1), &[]).expect_err("missing");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err = pair_durations(files(1), &["ten".into()]).expect_err("not a number");
        assert!(err.message.contains("ten"));
    }
}
