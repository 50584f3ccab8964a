use axum::{
    Json,
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use base64::Engine;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::{error, warn};

use super::super::AppState;
use crate::core::types::CaptureEvent;

#[derive(serde::Deserialize)]
pub struct IngestCaptureRequest {
    artifact_b64: String,
    #[serde(default)]
    trigger_id: Option<String>,
}

/// Capture ingestion. Accepts the artifact, links the fulfilling trigger,
/// spawns evaluation in the background and answers immediately with a
/// tracking id — this boundary never waits on classification.
pub async fn ingest_capture_endpoint(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<IngestCaptureRequest>,
) -> Json<serde_json::Value> {
    let device = match state.store.get_device(&device_id).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            return Json(serde_json::json!({ "success": false, "error": "Device not found" }));
        }
        Err(e) => {
            return Json(serde_json::json!({ "success": false, "error": e.to_string() }));
        }
    };

    if payload.artifact_b64.is_empty()
        || base64::engine::general_purpose::STANDARD
            .decode(&payload.artifact_b64)
            .is_err()
    {
        return Json(serde_json::json!({
            "success": false,
            "error": "artifact_b64 must be non-empty base64 data"
        }));
    }

    let capture = match state
        .store
        .create_capture(&device_id, payload.trigger_id.as_deref(), &payload.artifact_b64)
        .await
    {
        Ok(capture) => capture,
        Err(e) => {
            return Json(serde_json::json!({ "success": false, "error": e.to_string() }));
        }
    };

    let executed_trigger = match state
        .scheduler
        .link_capture(&device_id, payload.trigger_id.as_deref(), &capture.id)
        .await
    {
        Ok(linked) => linked,
        Err(e) => {
            warn!("Trigger linking failed for capture [{}]: {}", capture.id, e);
            None
        }
    };

    state.event_hub.publish(
        &device.org_id,
        CaptureEvent::new("capture_received", &device.org_id, &device_id, &capture.id),
    );

    let evaluator = state.evaluator.clone();
    let capture_id = capture.id.clone();
    tokio::spawn(async move {
        if let Err(e) = evaluator.evaluate(&capture_id).await {
            error!("Background evaluation of capture [{}] failed: {}", capture_id, e);
        }
    });

    Json(serde_json::json!({
        "success": true,
        "capture_id": capture.id,
        "evaluation_status": capture.evaluation_status,
        "executed_trigger_id": executed_trigger,
    }))
}

pub async fn get_capture_endpoint(
    Path(capture_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.store.get_capture(&capture_id).await {
        Ok(Some(capture)) => Json(serde_json::json!({ "success": true, "capture": capture })),
        Ok(None) => Json(serde_json::json!({ "success": false, "error": "Capture not found" })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

#[derive(serde::Deserialize)]
pub struct CaptureListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_captures_endpoint(
    Path(device_id): Path<String>,
    Query(query): Query<CaptureListQuery>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state
        .store
        .list_captures_for_device(&device_id, query.limit.min(500))
        .await
    {
        Ok(captures) => Json(serde_json::json!({ "success": true, "captures": captures })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

#[derive(serde::Deserialize)]
pub struct EventStreamQuery {
    #[serde(default)]
    device_id: Option<String>,
}

/// Dashboard capture-event stream for one org; `?device_id=` narrows the
/// feed to a single device. Every subscriber gets a copy of every event.
pub async fn events_stream_endpoint(
    Path(org_id): Path<String>,
    Query(query): Query<EventStreamQuery>,
    State(state): State<AppState>,
) -> Response {
    let receiver = state.event_hub.subscribe(&org_id);
    let device_filter = query.device_id;

    let stream = BroadcastStream::new(receiver).filter_map(move |msg| match msg {
        Ok(event) => {
            if !passes_device_filter(device_filter.as_deref(), &event.device_id) {
                return None;
            }
            let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Some(Ok::<Event, Infallible>(
                Event::default().event(event.event.clone()).data(payload),
            ))
        }
        // Dashboards tolerate gaps; just say that one happened.
        Err(BroadcastStreamRecvError::Lagged(n)) => Some(Ok(
            Event::default().event("lagged").data(n.to_string()),
        )),
    });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.event_keepalive)
                .text("keepalive"),
        )
        .into_response()
}

/// An unfiltered dashboard subscription is the org-wide wildcard; a
/// `?device_id=` filter narrows it to events for that one device.
fn passes_device_filter(filter: Option<&str>, device_id: &str) -> bool {
    filter.is_none_or(|wanted| wanted == device_id)
}
