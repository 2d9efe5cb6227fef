use crate::events::DEFAULT_HISTORY_LIMIT;
use crate::service::Recording;
use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::server::ServerState;

/// Multipart field carrying the camera frame
pub const UPLOAD_FIELD: &str = "imageFile";

pub async fn index_handler(State(state): State<ServerState>) -> impl IntoResponse {
    format!(
        "Presence detection server ({}). POST frames to /uploads.",
        state.service.detector_label()
    )
}

/// Accept one frame and answer with the verdict
pub async fn upload_handler(State(state): State<ServerState>, mut multipart: Multipart) -> Response {
    let mut upload: Option<(String, Bytes)> = None;

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(UPLOAD_FIELD) => {
                let filename = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(data) => upload = Some((filename, data)),
                    Err(e) => {
                        warn!("Upload body rejected: {}", e);
                        return (e.status(), e.body_text()).into_response();
                    }
                }
                break;
            }
            Ok(Some(field)) => debug!("Ignoring multipart field {:?}", field.name()),
            Ok(None) => break,
            Err(e) => {
                warn!("Malformed multipart upload: {}", e);
                return (e.status(), e.body_text()).into_response();
            }
        }
    }

    let Some((filename, data)) = upload else {
        return (StatusCode::BAD_REQUEST, "No file part").into_response();
    };
    if filename.is_empty() || data.is_empty() {
        return (StatusCode::BAD_REQUEST, "No selected file").into_response();
    }

    debug!("Received {} ({} bytes)", filename, data.len());

    match state.service.process(data).await {
        Ok(outcome) => {
            let message = outcome.verdict.message();
            match outcome.recording {
                Recording::Recorded { id, try_id } => {
                    info!(
                        "{} -> {} (event {}, {} try {})",
                        filename, message, id, outcome.verdict.method, try_id
                    );
                    (StatusCode::OK, message).into_response()
                }
                Recording::NotRecorded { reason } => {
                    error!("{} -> {} but not recorded: {}", filename, message, reason);
                    let presence = if outcome.verdict.presence { "1" } else { "0" };
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        [("X-Presence", presence)],
                        format!("{} (not recorded)", message),
                    )
                        .into_response()
                }
            }
        }
        Err(e) if e.is_input() => {
            info!("Rejected {}: {}", filename, e);
            (StatusCode::BAD_REQUEST, "Invalid image").into_response()
        }
        Err(e) => {
            error!("Processing {} failed: {}", filename, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Processing failed").into_response()
        }
    }
}

/// Latest verdict as `1` or `0`
pub async fn status_handler(State(state): State<ServerState>) -> impl IntoResponse {
    if state.service.status().current() {
        "1"
    } else {
        "0"
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub method: Option<String>,
    pub limit: Option<usize>,
}

/// Newest events first as `[filename, presence, fallback_used, method, timestamp, try_id]`
pub async fn history_handler(
    State(state): State<ServerState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let events = std::sync::Arc::clone(state.service.events());
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);

    let result = tokio::task::spawn_blocking(move || events.history(query.method.as_deref(), limit)).await;

    match result {
        Ok(Ok(records)) => {
            let rows: Vec<_> = records.iter().map(|r| r.to_row()).collect();
            Json(serde_json::json!({ "records": rows })).into_response()
        }
        Ok(Err(e)) => {
            error!("History query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
        Err(e) => {
            error!("History task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Handler for health check endpoint
pub async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let service = &state.service;
    let events = std::sync::Arc::clone(service.events());
    let recorded = tokio::task::spawn_blocking(move || events.count())
        .await
        .ok()
        .and_then(|r| r.ok());

    let health_info = serde_json::json!({
        "status": if recorded.is_some() { "healthy" } else { "degraded" },
        "method": service.detector_label(),
        "fallback": {
            "enabled": service.baselines().is_some(),
            "baseline_established": service.baselines().map(|b| b.get().is_some()),
        },
        "events_recorded": recorded,
        "presence": service.status().current(),
    });

    (StatusCode::OK, Json(health_info))
}
