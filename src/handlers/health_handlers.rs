//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok"), no I/O
//! - GET /readyz   -> checks metadata store connectivity and object store I/O

use crate::services::share_service::ShareService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs `SELECT 1` against the metadata store and a write/read/delete probe
/// against the object store. 200 when both pass, 503 otherwise.
pub async fn readyz(State(service): State<ShareService>) -> impl IntoResponse {
    let metadata = match service.metadata.ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(e.to_string()),
    };
    let objects = match service.objects.probe().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(e.to_string()),
    };

    let overall_ok = metadata.ok && objects.ok;
    if !overall_ok {
        warn!(
            metadata = ?metadata.error,
            objects = ?objects.error,
            "readiness check failed"
        );
    }

    let mut checks = HashMap::new();
    checks.insert("metadata", metadata);
    checks.insert("objects", objects);

    let body = ReadyResponse {
        status: (if overall_ok { "ok" } else { "error" }).to_string(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
