//! Route table for the image sharing API.
//!
//! - `POST   /api/images/upload`              -> multipart upload, returns short links
//! - `GET    /api/images/{unique_link_id}`    -> stream image bytes
//! - `DELETE /api/images/{unique_link_id}`    -> delete image, idempotent
//! - `GET    /s/{short_code}`                 -> 307 redirect to the image
//! - `GET    /healthz`, `GET /readyz`         -> probes

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        image_handlers::{
            MAX_FILES_PER_UPLOAD, delete_image, get_image, redirect_short_link, upload_images,
        },
    },
    services::{share_service::ShareService, validation::MAX_FILE_SIZE_BYTES},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Slack on top of the raw file bytes for multipart boundaries and text fields.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build the router. State (`ShareService`) is attached by the caller.
pub fn routes() -> Router<ShareService> {
    let upload_limit = MAX_FILES_PER_UPLOAD * MAX_FILE_SIZE_BYTES + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/api/images/upload",
            post(upload_images).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/images/{unique_link_id}",
            get(get_image).delete(delete_image),
        )
        .route("/s/{short_code}", get(redirect_short_link))
}
