use axum::{
    Json,
    extract::{Path, Query, State},
};

use super::super::AppState;

/// Manual captures bypass the schedule but share the trigger lifecycle: the
/// response status tells the caller whether the device was reachable
/// (`sent`) or the trigger is waiting for it to connect (`pending`).
pub async fn manual_trigger_endpoint(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.store.get_device(&device_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Json(serde_json::json!({ "success": false, "error": "Device not found" }));
        }
        Err(e) => {
            return Json(serde_json::json!({ "success": false, "error": e.to_string() }));
        }
    }

    match state.scheduler.trigger_manual(&device_id).await {
        Ok((trigger_id, status)) => Json(serde_json::json!({
            "success": true,
            "trigger_id": trigger_id,
            "status": status,
        })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

#[derive(serde::Deserialize)]
pub struct TriggerListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_triggers_endpoint(
    Path(device_id): Path<String>,
    Query(query): Query<TriggerListQuery>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state
        .store
        .list_triggers_for_device(&device_id, query.limit.min(500))
        .await
    {
        Ok(triggers) => Json(serde_json::json!({ "success": true, "triggers": triggers })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

/// Operator escape hatch for triggers whose device will never connect or
/// whose capture will never arrive. Terminal states are untouched.
pub async fn fail_trigger_endpoint(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.store.mark_trigger_failed(&trigger_id).await {
        Ok(true) => Json(serde_json::json!({ "success": true, "message": "Trigger marked failed" })),
        Ok(false) => Json(serde_json::json!({
            "success": false,
            "error": "Trigger not found or already terminal"
        })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}
