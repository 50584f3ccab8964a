use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{captures, devices, triggers};

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/devices",
            get(devices::list_devices_endpoint).post(devices::create_device_endpoint),
        )
        .route(
            "/api/devices/connected",
            get(devices::connected_devices_endpoint),
        )
        .route(
            "/api/devices/{device_id}/commands/stream",
            get(devices::command_stream_endpoint),
        )
        .route(
            "/api/devices/{device_id}/trigger",
            post(triggers::manual_trigger_endpoint),
        )
        .route(
            "/api/devices/{device_id}/trigger-config",
            get(devices::get_trigger_config_endpoint).post(devices::set_trigger_config_endpoint),
        )
        .route(
            "/api/devices/{device_id}/triggers",
            get(triggers::list_triggers_endpoint),
        )
        .route(
            "/api/devices/{device_id}/captures",
            get(captures::list_captures_endpoint).post(captures::ingest_capture_endpoint),
        )
        .route(
            "/api/captures/{capture_id}",
            get(captures::get_capture_endpoint),
        )
        .route(
            "/api/triggers/{trigger_id}/fail",
            post(triggers::fail_trigger_endpoint),
        )
        .route(
            "/api/orgs/{org_id}/events/stream",
            get(captures::events_stream_endpoint),
        )
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_cors())
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agents::ClassificationAgent;
    use crate::core::consensus::AgentVerdict;
    use crate::core::evaluator::ConsensusEvaluator;
    use crate::core::hub::{CommandHub, EventHub};
    use crate::core::notify::LogNotifier;
    use crate::core::scheduler::TriggerScheduler;
    use crate::core::store::Store;
    use crate::core::types::CaptureState;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    struct MockAgent {
        name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl ClassificationAgent for MockAgent {
        fn name(&self) -> &str {
            self.name
        }
        async fn classify(&self, _artifact: &str, _guidance: &str) -> Result<AgentVerdict> {
            tokio::time::sleep(self.delay).await;
            Ok(AgentVerdict {
                state: CaptureState::Normal,
                confidence: 0.9,
                reason: "mock".to_string(),
            })
        }
    }

    fn test_state(agent_delay: Duration) -> AppState {
        let store = Store::open_ephemeral().unwrap();
        let command_hub = CommandHub::new();
        let event_hub = EventHub::new();
        let evaluator = Arc::new(ConsensusEvaluator::new(
            store.clone(),
            event_hub.clone(),
            Arc::new(MockAgent {
                name: "mock_a",
                delay: agent_delay,
            }),
            Arc::new(MockAgent {
                name: "mock_b",
                delay: agent_delay,
            }),
            Arc::new(LogNotifier),
            agent_delay + Duration::from_secs(60),
            chrono::Duration::seconds(60),
        ));
        let scheduler = Arc::new(TriggerScheduler::new(
            store.clone(),
            command_hub.clone(),
            Duration::from_secs(1),
            CancellationToken::new(),
        ));
        let (log_tx, _) = tokio::sync::broadcast::channel(16);

        AppState {
            store,
            command_hub,
            event_hub,
            scheduler,
            evaluator,
            log_tx,
            command_keepalive: Duration::from_secs(30),
            event_keepalive: Duration::from_secs(15),
        }
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = build_api_router(test_state(Duration::ZERO));
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/devices")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn device_registration_and_trigger_config_flow() {
        let state = test_state(Duration::ZERO);

        let app = build_api_router(state.clone());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/api/devices",
            Some(serde_json::json!({
                "org_id": "org-1",
                "name": "dock-cam",
                "guidance": "an empty loading dock"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        let device_id = json["device"]["id"].as_str().unwrap().to_string();

        let app = build_api_router(state.clone());
        let (_, json) = json_request(
            app,
            Method::POST,
            &format!("/api/devices/{device_id}/trigger-config"),
            Some(serde_json::json!({ "enabled": true, "interval_seconds": 10 })),
        )
        .await;
        assert_eq!(json["success"], true);

        let app = build_api_router(state);
        let (_, json) = json_request(
            app,
            Method::GET,
            &format!("/api/devices/{device_id}/trigger-config"),
            None,
        )
        .await;
        assert_eq!(json["enabled"], true);
        assert_eq!(json["interval_seconds"], 10);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let state = test_state(Duration::ZERO);
        let device = state.store.create_device("org-1", "cam", "").await.unwrap();

        let app = build_api_router(state);
        let (_, json) = json_request(
            app,
            Method::POST,
            &format!("/api/devices/{}/trigger-config", device.id),
            Some(serde_json::json!({ "enabled": true, "interval_seconds": 0 })),
        )
        .await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn manual_trigger_for_disconnected_device_is_pending() {
        let state = test_state(Duration::ZERO);
        let device = state.store.create_device("org-1", "cam", "").await.unwrap();

        let app = build_api_router(state.clone());
        let (status, json) = json_request(
            app,
            Method::POST,
            &format!("/api/devices/{}/trigger", device.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["status"], "pending");

        let app = build_api_router(state);
        let (_, json) = json_request(
            app,
            Method::GET,
            &format!("/api/devices/{}/triggers", device.id),
            None,
        )
        .await;
        assert_eq!(json["triggers"].as_array().unwrap().len(), 1);
        assert_eq!(json["triggers"][0]["trigger_type"], "manual");
    }

    #[tokio::test]
    async fn manual_trigger_unknown_device_fails() {
        let app = build_api_router(test_state(Duration::ZERO));
        let (_, json) =
            json_request(app, Method::POST, "/api/devices/ghost/trigger", None).await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn connected_devices_snapshot_reflects_hub() {
        let state = test_state(Duration::ZERO);
        let _sub = state.command_hub.subscribe("dev-42");

        let app = build_api_router(state);
        let (_, json) = json_request(app, Method::GET, "/api/devices/connected", None).await;
        assert_eq!(json["devices"], serde_json::json!(["dev-42"]));
    }

    #[tokio::test]
    async fn ingestion_answers_before_classification_finishes() {
        // Agents sleep 5 seconds; the ingestion response must not wait.
        let state = test_state(Duration::from_secs(5));
        let device = state.store.create_device("org-1", "cam", "").await.unwrap();
        let artifact = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            b"jpeg bytes",
        );

        let app = build_api_router(state.clone());
        let started = std::time::Instant::now();
        let (status, json) = json_request(
            app,
            Method::POST,
            &format!("/api/devices/{}/captures", device.id),
            Some(serde_json::json!({ "artifact_b64": artifact })),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["evaluation_status"], "pending");

        let capture_id = json["capture_id"].as_str().unwrap();
        let app = build_api_router(state);
        let (_, json) =
            json_request(app, Method::GET, &format!("/api/captures/{capture_id}"), None).await;
        assert_eq!(json["success"], true);
        // Still in flight (pending or processing), certainly not completed.
        assert_ne!(json["capture"]["evaluation_status"], "completed");
    }

    #[tokio::test]
    async fn ingestion_rejects_garbage_artifacts() {
        let state = test_state(Duration::ZERO);
        let device = state.store.create_device("org-1", "cam", "").await.unwrap();

        let app = build_api_router(state);
        let (_, json) = json_request(
            app,
            Method::POST,
            &format!("/api/devices/{}/captures", device.id),
            Some(serde_json::json!({ "artifact_b64": "not!!base64!!" })),
        )
        .await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn unknown_capture_is_not_found() {
        let app = build_api_router(test_state(Duration::ZERO));
        let (_, json) = json_request(app, Method::GET, "/api/captures/ghost", None).await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn api_route_contract_has_all_expected_paths() {
        let paths = [
            "/api/devices",
            "/api/devices/connected",
            "/api/devices/dev-1/commands/stream",
            "/api/devices/dev-1/trigger",
            "/api/devices/dev-1/trigger-config",
            "/api/devices/dev-1/triggers",
            "/api/devices/dev-1/captures",
            "/api/captures/cap-1",
            "/api/triggers/trig-1/fail",
            "/api/orgs/org-1/events/stream",
            "/api/logs",
        ];

        assert_eq!(paths.len(), 11, "Expected exactly 11 API routes");
        let unique: HashSet<&str> = paths.iter().copied().collect();
        assert_eq!(unique.len(), 11, "Duplicate routes found in route contract");

        let app = build_api_router(test_state(Duration::ZERO));
        for path in paths {
            let req = Request::builder()
                .method(Method::PUT)
                .uri(path)
                .body(Body::empty())
                .expect("request should build");
            let resp = app
                .clone()
                .oneshot(req)
                .await
                .expect("router oneshot should succeed");
            assert_ne!(
                resp.status(),
                StatusCode::NOT_FOUND,
                "Route missing from router: {}",
                path
            );
        }
    }
}
