use axum::{
    Json,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use super::super::AppState;
use crate::core::hub::CommandSubscription;

pub async fn create_device_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<CreateDeviceRequest>,
) -> Json<serde_json::Value> {
    let org_id = payload.org_id.trim();
    let name = payload.name.trim();
    if org_id.is_empty() || name.is_empty() {
        return Json(serde_json::json!({
            "success": false,
            "error": "org_id and name are required"
        }));
    }

    match state
        .store
        .create_device(org_id, name, payload.guidance.trim())
        .await
    {
        Ok(device) => Json(serde_json::json!({ "success": true, "device": device })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

#[derive(serde::Deserialize)]
pub struct CreateDeviceRequest {
    org_id: String,
    name: String,
    #[serde(default)]
    guidance: String,
}

pub async fn list_devices_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.store.list_devices().await {
        Ok(devices) => Json(serde_json::json!({ "success": true, "devices": devices })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

/// Presence snapshot: which devices hold an open command stream right now,
/// plus the running count of commands lost to slow consumers.
pub async fn connected_devices_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut connected = state.command_hub.list_active_keys();
    connected.sort();
    Json(serde_json::json!({
        "success": true,
        "devices": connected,
        "commands_dropped": state.command_hub.dropped_total(),
    }))
}

pub async fn get_trigger_config_endpoint(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.store.get_device(&device_id).await {
        Ok(Some(device)) => Json(serde_json::json!({
            "success": true,
            "enabled": device.trigger_enabled,
            "interval_seconds": device.trigger_interval_seconds,
        })),
        Ok(None) => Json(serde_json::json!({ "success": false, "error": "Device not found" })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

#[derive(serde::Deserialize)]
pub struct TriggerConfigRequest {
    enabled: bool,
    interval_seconds: i64,
}

pub async fn set_trigger_config_endpoint(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<TriggerConfigRequest>,
) -> Json<serde_json::Value> {
    if payload.interval_seconds < 1 {
        return Json(serde_json::json!({
            "success": false,
            "error": "interval_seconds must be a positive integer"
        }));
    }

    match state
        .store
        .set_trigger_config(&device_id, payload.enabled, payload.interval_seconds)
        .await
    {
        Ok(true) => Json(serde_json::json!({ "success": true, "message": "Trigger config updated" })),
        Ok(false) => Json(serde_json::json!({ "success": false, "error": "Device not found" })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

/// The device's long-lived command stream. Subscribing supersedes any
/// previous stream for this device; dropping the connection unsubscribes.
/// A keepalive comment rides the stream every `command_keepalive` of
/// inactivity so intermediaries keep the connection open.
pub async fn command_stream_endpoint(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.store.get_device(&device_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Json(serde_json::json!({ "success": false, "error": "Device not found" }))
                .into_response();
        }
        Err(e) => {
            return Json(serde_json::json!({ "success": false, "error": e.to_string() }))
                .into_response();
        }
    }

    let CommandSubscription { guard, receiver } = state.command_hub.subscribe(&device_id);
    let hub = state.command_hub.clone();

    // The guard lives inside the stream: when the client disconnects (or a
    // newer subscription ends this one), dropping the stream unsubscribes.
    let stream = BroadcastStream::new(receiver).map(move |msg| {
        let _held = &guard;
        match msg {
            Ok(command) => {
                let payload =
                    serde_json::to_string(&command).unwrap_or_else(|_| "{}".to_string());
                Ok::<Event, Infallible>(Event::default().event("command").data(payload))
            }
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                // Ring buffer overwrote the oldest commands for this slow
                // consumer; tell it how many it missed.
                hub.note_dropped(n);
                Ok(Event::default().event("resync").data(n.to_string()))
            }
        }
    });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.command_keepalive)
                .text("keepalive"),
        )
        .into_response()
}
