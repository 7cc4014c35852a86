//! HTTP API and live progress feed.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::orchestrator::GenerationOrchestrator;
use api::AppState;

/// Configuration for `kiln serve`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Bind on all interfaces and allow any origin
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            dev_mode: false,
        }
    }
}

/// Build the full application router with the API and the WebSocket feed.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ui_tx = state.ui_tx.clone();

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade| ws::ws_handler_with_sender(ws_upgrade, ui_tx)),
        )
        .with_state(state)
}

/// Serve until Ctrl+C, then release the active sandbox.
pub async fn start_server(
    config: ServerConfig,
    orchestrator: Arc<GenerationOrchestrator>,
) -> Result<()> {
    let state = Arc::new(AppState {
        ui_tx: orchestrator.ui_sender().clone(),
        orchestrator: orchestrator.clone(),
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "server listening");
    println!("kiln running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    orchestrator.wait_for_saves().await;
    orchestrator.manager().shutdown().await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{ApplicationEngine, EngineSettings};
    use crate::context::ConversationContext;
    use crate::generate::client::event_stream_body;
    use crate::generate::{GenerationSettings, ReplayGenerationClient};
    use crate::sandbox::{ManagerSettings, MemorySandboxProvider, SandboxManager};
    use crate::ui::ui_channel;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(client: Arc<ReplayGenerationClient>) -> Arc<AppState> {
        let manager = Arc::new(SandboxManager::new(
            Arc::new(MemorySandboxProvider::new()),
            ManagerSettings {
                settle_delay: Duration::ZERO,
                ..ManagerSettings::default()
            },
        ));
        let ui_tx = ui_channel();
        let engine = ApplicationEngine::new(manager, EngineSettings::default(), ui_tx.clone());
        let orchestrator = Arc::new(GenerationOrchestrator::new(
            client,
            engine,
            GenerationSettings::default(),
            ConversationContext::default(),
            ui_tx.clone(),
        ));
        Arc::new(AppState {
            orchestrator,
            ui_tx,
        })
    }

    fn test_router() -> Router {
        build_router(test_state(Arc::new(ReplayGenerationClient::new())))
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let resp = test_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_no_sandbox_is_404() {
        let app = test_router();
        for uri in ["/api/sandbox", "/api/sandbox/files"] {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_create_get_delete_sandbox() {
        let app = test_router();
        let resp = app
            .clone()
            .oneshot(post_json("/api/sandbox", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = json_body(resp).await;
        assert_eq!(created["state"], "running");

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/api/sandbox").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["id"], created["id"]);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/sandbox")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(Request::builder().uri("/api/sandbox").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_turn_then_list_files() {
        let client = Arc::new(ReplayGenerationClient::new());
        client.push_body(event_stream_body(&[
            serde_json::json!({"type": "stream", "text": "<file path=\"src/App.jsx\">hello</file>"}),
            serde_json::json!({"type": "complete", "explanation": "done"}),
        ]));
        let app = build_router(test_state(client));

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/turns",
                serde_json::json!({"prompt": "hello app", "wait": true}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = json_body(resp).await;
        assert_eq!(outcome["status"], "succeeded");
        assert_eq!(outcome["applied_paths"][0], "src/App.jsx");

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/sandbox/files")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listing = json_body(resp).await;
        assert_eq!(listing["files"]["src/App.jsx"], "hello");

        let resp = app
            .oneshot(Request::builder().uri("/api/context").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let context = json_body(resp).await;
        assert_eq!(context["entries"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reapply_last_turn() {
        let client = Arc::new(ReplayGenerationClient::new());
        client.push_body(event_stream_body(&[serde_json::json!({
            "type": "stream",
            "text": "<file path=\"a.js\">1</file>"
        })]));
        let app = build_router(test_state(client));

        let resp = app
            .clone()
            .oneshot(post_json("/api/turns/reapply", serde_json::json!({"wait": true})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/turns",
                serde_json::json!({"prompt": "go", "wait": true}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(post_json("/api/turns/reapply", serde_json::json!({"wait": true})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = json_body(resp).await;
        assert_eq!(outcome["summary"], "Reapplied 1 file(s)");
        assert_eq!(outcome["applied_paths"][0], "a.js");
    }

    #[tokio::test]
    async fn test_empty_prompt_is_400() {
        let resp = test_router()
            .oneshot(post_json("/api/turns", serde_json::json!({"prompt": "  "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_generation_failure_is_502() {
        let client = Arc::new(ReplayGenerationClient::new());
        client.push_status(500, "down");
        let resp = build_router(test_state(client))
            .oneshot(post_json(
                "/api/turns",
                serde_json::json!({"prompt": "go", "wait": true}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(json_body(resp).await["error"].as_str().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_queued_turn_is_202() {
        let client = Arc::new(ReplayGenerationClient::new());
        client.push_body(event_stream_body(&[serde_json::json!({"type": "complete"})]));
        let resp = build_router(test_state(client))
            .oneshot(post_json("/api/turns", serde_json::json!({"prompt": "go"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
}
