//! Axum HTTP server for the session API.

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use gateway_engine::TurnExecutor;

use crate::config::GatewayConfig;
use crate::handlers;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<TurnExecutor>,
    pub config: Arc<GatewayConfig>,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(executor: Arc<TurnExecutor>, config: GatewayConfig) -> Self {
        Self {
            executor,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route("/sessions/{id}", get(handlers::get_session))
        .route(
            "/sessions/{id}/messages",
            get(handlers::get_messages).post(handlers::send_message),
        )
        .route("/sessions/{id}/approve", post(handlers::approve))
        .route("/sessions/{id}/deny", post(handlers::deny))
        .route("/sessions/{id}/abort", post(handlers::abort))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. The server stops accepting connections once
/// `shutdown` is cancelled and finishes when open responses complete.
pub async fn start(state: AppState, shutdown: CancellationToken) -> Result<ServerHandle, std::io::Error> {
    let addr = state.config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    let router = build_router(state);

    tracing::info!(addr = %local_addr, "gateway server started");

    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server error");
        }
        tracing::info!("gateway server stopped");
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the server task to finish.
    pub async fn join(self) {
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use gateway_backend::{MockBackend, MockResponse, MockStep};
    use gateway_core::backend::RawMessage;
    use gateway_core::events::StreamEvent;
    use gateway_core::ids::SessionId;
    use gateway_core::sse::decode_events;
    use gateway_engine::SessionRegistry;
    use gateway_store::TranscriptStore;
    use tower::ServiceExt;

    struct Fixture {
        state: AppState,
        dir: tempfile::TempDir,
    }

    fn fixture(responses: Vec<MockResponse>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            workspace: dir.path().to_path_buf(),
            transcripts_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let executor = TurnExecutor::new(
            Arc::new(MockBackend::new(responses)),
            Arc::new(SessionRegistry::default()),
            Arc::new(TranscriptStore::new(dir.path(), config.meta_window_bytes)),
            dir.path().to_path_buf(),
        );
        Fixture {
            state: AppState::new(Arc::new(executor), config),
            dir,
        }
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, body.to_vec())
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    const TRANSCRIPT: &str = concat!(
        r#"{"type":"system","subtype":"init","permissionMode":"default","timestamp":"2026-01-02T03:04:05Z"}"#,
        "\n",
        r#"{"type":"user","uuid":"u1","timestamp":"2026-01-02T03:04:06Z","message":{"role":"user","content":"Hi"}}"#,
        "\n",
        r#"{"type":"assistant","uuid":"a1","message":{"role":"assistant","content":[{"type":"text","text":"Hello"},{"type":"tool_use","id":"t1","name":"Read","input":{}}]}}"#,
        "\n",
    );

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let f = fixture(vec![]);
        let (status, body) = call(&f.state, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["activeSessions"], 0);
    }

    #[tokio::test]
    async fn create_session_registers_it() {
        let f = fixture(vec![]);
        let (status, body) = call(
            &f.state,
            "POST",
            "/sessions",
            r#"{"permissionMode":"dangerously-skip"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["title"], "New Session");
        assert_eq!(body["permissionMode"], "dangerously-skip");
        assert!(body["createdAt"].is_string());

        let id = SessionId::from_raw(body["id"].as_str().unwrap());
        assert!(f.state.executor.registry().has_session(&id));
    }

    #[tokio::test]
    async fn create_session_without_body_uses_default_mode() {
        let f = fixture(vec![]);
        let (status, body) = call(&f.state, "POST", "/sessions", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["permissionMode"], "default");
    }

    #[tokio::test]
    async fn list_get_and_history_read_transcripts() {
        let f = fixture(vec![]);
        std::fs::write(f.dir.path().join("abc.jsonl"), TRANSCRIPT).unwrap();

        let (status, body) = call(&f.state, "GET", "/sessions?limit=5", "").await;
        assert_eq!(status, StatusCode::OK);
        let list = json(&body);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["id"], "abc");
        assert_eq!(list[0]["title"], "Hi");

        let (status, body) = call(&f.state, "GET", "/sessions/abc", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["id"], "abc");

        let (status, body) = call(&f.state, "GET", "/sessions/abc/messages", "").await;
        assert_eq!(status, StatusCode::OK);
        let messages = &json(&body)["messages"];
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Hi");
        assert_eq!(messages[1]["content"], "Hello");
        assert_eq!(messages[1]["toolCalls"][0]["toolCallId"], "t1");
        assert_eq!(messages[1]["toolCalls"][0]["status"], "complete");
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let f = fixture(vec![]);
        let (status, body) = call(&f.state, "GET", "/sessions/missing", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["error"], "Session not found");

        let (status, body) = call(&f.state, "GET", "/sessions/missing/messages", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["messages"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn send_message_requires_content() {
        let f = fixture(vec![]);
        for body in ["", "{}", r#"{"content":""}"#] {
            let (status, resp) = call(&f.state, "POST", "/sessions/s1/messages", body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
            assert_eq!(json(&resp)["error"], "content is required");
        }

        let (status, resp) = call(&f.state, "POST", "/sessions/s1/messages", "{nope").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json(&resp)["error"].as_str().unwrap().starts_with("invalid JSON body"));
    }

    #[tokio::test]
    async fn send_message_streams_sse() {
        let f = fixture(vec![MockResponse::text_turn("backend-1", "Hello")]);
        let req = Request::builder()
            .method("POST")
            .uri("/sessions/s1/messages")
            .body(Body::from(r#"{"content":"Hi"}"#))
            .unwrap();
        let resp = build_router(f.state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");

        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        assert_eq!(
            decode_events(&body),
            vec![
                StreamEvent::text("Hello"),
                StreamEvent::done(SessionId::from_raw("backend-1")),
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_turn_is_409() {
        let f = fixture(vec![MockResponse::Stream(vec![
            MockStep::Pause(std::time::Duration::from_secs(3600)),
            MockStep::Message(RawMessage::result()),
        ])]);
        let first = f
            .state
            .executor
            .send_message(gateway_engine::TurnRequest::new(SessionId::from_raw("s1"), "one"))
            .await
            .unwrap();

        let (status, body) = call(&f.state, "POST", "/sessions/s1/messages", r#"{"content":"two"}"#).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json(&body)["error"].is_string());
        drop(first);
    }

    #[tokio::test]
    async fn approve_and_deny_without_pending_are_404() {
        let f = fixture(vec![]);
        for route in ["approve", "deny"] {
            let (status, body) = call(
                &f.state,
                "POST",
                &format!("/sessions/s1/{route}"),
                r#"{"toolCallId":"t1"}"#,
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(json(&body)["error"], "No pending approval");
        }
    }

    #[tokio::test]
    async fn abort_without_turn_reports_false() {
        let f = fixture(vec![]);
        let (status, body) = call(&f.state, "POST", "/sessions/s1/abort", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["ok"], false);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let f = fixture(vec![]);
        let (status, _) = call(&f.state, "GET", "/nonexistent", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_binds_and_shuts_down() {
        let f = fixture(vec![]);
        let mut config = (*f.state.config).clone();
        config.port = 0;
        let state = AppState::new(f.state.executor.clone(), config);
        let shutdown = CancellationToken::new();

        let handle = start(state, shutdown.clone()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle.join())
            .await
            .unwrap();
    }
}
