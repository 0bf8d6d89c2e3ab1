use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod session;
pub mod stdio;

use session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .route(
            "/mcp",
            post(http::handlers::post_mcp)
                .get(http::handlers::get_mcp)
                .delete(http::handlers::delete_mcp),
        )
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{header, Request, Response, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::domain::{self, catalog::InMemoryCatalog};
    use crate::http::headers::SESSION_HEADER;
    use crate::mcp::dispatcher::{DispatchOptions, Dispatcher};
    use crate::mcp::message::{Message, RequestId};
    use crate::mcp::registry::Registry;
    use crate::session::Delivery;
    use crate::session::SessionOptions;

    use super::*;

    fn app_with_sessions() -> (Router, Arc<SessionManager>) {
        let registry = Registry::new();
        domain::register(&registry, Arc::new(InMemoryCatalog::new())).expect("register");
        registry.close();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            DispatchOptions::default(),
        ));
        let sessions = SessionManager::new(dispatcher, SessionOptions::default());
        (build_app(AppState::new(Arc::clone(&sessions))), sessions)
    }

    fn app() -> Router {
        app_with_sessions().0
    }

    fn post(session_id: Option<&str>, body: impl Into<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/mcp")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json");
        if let Some(session_id) = session_id {
            builder = builder.header(SESSION_HEADER, session_id);
        }
        builder.body(Body::from(body.into())).expect("request build")
    }

    fn session_request(method: &str, session_id: &str) -> Request<Body> {
        Request::builder()
            .uri("/mcp")
            .method(method)
            .header(SESSION_HEADER, session_id)
            .body(Body::empty())
            .expect("request build")
    }

    fn event_stream_request(session_id: &str, last_event_id: Option<u64>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/mcp")
            .method("GET")
            .header(header::ACCEPT, "text/event-stream")
            .header(SESSION_HEADER, session_id);
        if let Some(last_event_id) = last_event_id {
            builder = builder.header("Last-Event-ID", last_event_id.to_string());
        }
        builder.body(Body::empty()).expect("request build")
    }

    /// Reads one SSE event and returns its id and JSON payload.
    async fn next_event(body: &mut Body) -> (Option<u64>, Value) {
        let frame = tokio::time::timeout(Duration::from_secs(1), body.frame())
            .await
            .expect("event before timeout")
            .expect("stream still open")
            .expect("body frame");
        let bytes = frame.into_data().expect("data frame");
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        let id = text
            .lines()
            .find_map(|line| line.strip_prefix("id:"))
            .map(|id| id.trim().parse().expect("numeric event id"));
        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data:"))
            .expect("data line");
        (id, serde_json::from_str(data.trim()).expect("json event"))
    }

    fn log_line(seq: u64) -> Message {
        Message::notification("notifications/message", Some(json!({"seq": seq})))
    }

    async fn json_body(response: Response<Body>) -> Value {
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&body).expect("valid json response")
    }

    fn initialize_body() -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "0.0.1"}
            }
        })
        .to_string()
    }

    async fn initialized_session(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(post(None, initialize_body()))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .expect("session header")
            .to_string();

        let response = app
            .clone()
            .oneshot(post(
                Some(&session_id),
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            ))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        session_id
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        assert_eq!(body, "{\"status\":\"ok\"}");
    }

    #[tokio::test]
    async fn discovery_names_endpoint_and_session_header() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/.well-known/mcp")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = json_body(response).await;
        assert_eq!(body_json["mcp_endpoint"], "/mcp");
        assert_eq!(body_json["session_header"], "Mcp-Session-Id");
        assert_eq!(body_json["name"], env!("CARGO_PKG_NAME"));
    }

    #[tokio::test]
    async fn root_get_is_not_found() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn initialize_opens_a_session() {
        let response = app()
            .oneshot(post(None, initialize_body()))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(SESSION_HEADER));
        let body_json = json_body(response).await;
        assert_eq!(body_json["id"], 1);
        assert_eq!(body_json["result"]["protocolVersion"], "2025-03-26");
        assert!(body_json["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_returns_movie_tools() {
        let app = app();
        let session_id = initialized_session(&app).await;

        let response = app
            .oneshot(post(
                Some(&session_id),
                r#"{"jsonrpc":"2.0","id":2,"method":"listTools"}"#,
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = json_body(response).await;
        let tools = body_json["result"]["tools"].as_array().expect("tools array");
        assert_eq!(tools.len(), 8);
        assert!(tools.iter().any(|tool| tool["name"] == "search_movies"));
    }

    #[tokio::test]
    async fn add_then_get_movie_over_http() {
        let app = app();
        let session_id = initialized_session(&app).await;

        let add = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {
                "name": "add_movie",
                "arguments": {"title": "  Alien ", "year": 1979, "genres": ["Horror", "sci-fi"]}
            }
        });
        let response = app
            .clone()
            .oneshot(post(Some(&session_id), add.to_string()))
            .await
            .expect("request execution");
        let body_json = json_body(response).await;
        let movie = &body_json["result"]["structuredContent"];
        assert_eq!(movie["title"], "Alien");
        let movie_id = movie["id"].as_str().expect("movie id").to_string();

        let get = json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "callTool",
            "params": {"name": "get_movie", "args": {"movie_id": movie_id}}
        });
        let response = app
            .oneshot(post(Some(&session_id), get.to_string()))
            .await
            .expect("request execution");
        let body_json = json_body(response).await;
        assert_eq!(body_json["result"]["structuredContent"]["year"], 1979);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let response = app()
            .oneshot(post(
                Some("no-such-session"),
                r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body_json = json_body(response).await;
        assert_eq!(body_json["error"]["code"], -32001);
        assert_eq!(body_json["error"]["data"]["reinitialize"], true);
        assert!(body_json["id"].is_null());
    }

    #[tokio::test]
    async fn malformed_body_returns_parse_error() {
        let response = app()
            .oneshot(post(None, "{not json"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = json_body(response).await;
        assert_eq!(body_json["error"]["code"], -32700);
        assert!(body_json["id"].is_null());
    }

    #[tokio::test]
    async fn unknown_method_returns_method_not_found() {
        let app = app();
        let session_id = initialized_session(&app).await;

        let response = app
            .oneshot(post(
                Some(&session_id),
                r#"{"jsonrpc":"2.0","id":7,"method":"frobnicate"}"#,
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = json_body(response).await;
        assert_eq!(body_json["id"], 7);
        assert_eq!(body_json["error"]["code"], -32601);
        assert_eq!(body_json["error"]["data"]["kind"], "MethodNotFound");
    }

    #[tokio::test]
    async fn batch_returns_an_array() {
        let app = app();
        let session_id = initialized_session(&app).await;

        let response = app
            .oneshot(post(
                Some(&session_id),
                r#"[{"jsonrpc":"2.0","id":"a","method":"ping"},{"jsonrpc":"2.0","id":"b","method":"resources/list"}]"#,
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = json_body(response).await;
        let replies = body_json.as_array().expect("batch reply");
        assert_eq!(replies.len(), 2);
        let ids = replies
            .iter()
            .map(|reply| reply["id"].clone())
            .collect::<Vec<_>>();
        assert!(ids.contains(&json!("a")));
        assert!(ids.contains(&json!("b")));
    }

    #[tokio::test]
    async fn event_stream_carries_response() {
        let app = app();
        let session_id = initialized_session(&app).await;

        let request = Request::builder()
            .uri("/mcp")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json, text/event-stream")
            .header(SESSION_HEADER, &session_id)
            .body(Body::from(r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#))
            .expect("request build");
        let response = app.oneshot(request).await.expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .expect("content type");
        assert!(content_type.starts_with("text/event-stream"));

        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(text.contains("event: message"));
        assert!(text.contains(r#""id":9"#));
    }

    #[tokio::test]
    async fn delete_closes_the_session() {
        let app = app();
        let session_id = initialized_session(&app).await;

        let response = app
            .clone()
            .oneshot(session_request("DELETE", &session_id))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(session_request("DELETE", &session_id))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(post(
                Some(&session_id),
                r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            ))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_without_session_is_rejected() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/mcp")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn repeated_id_in_a_batch_is_rejected_inline() {
        let app = app();
        let session_id = initialized_session(&app).await;

        let response = app
            .oneshot(post(
                Some(&session_id),
                r#"[{"jsonrpc":"2.0","id":3,"method":"ping"},{"jsonrpc":"2.0","id":3,"method":"tools/list"}]"#,
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = json_body(response).await;
        let replies = body_json.as_array().expect("batch reply");
        assert_eq!(replies.len(), 2);
        let rejected = replies
            .iter()
            .find(|reply| reply.get("error").is_some())
            .expect("rejected entry");
        assert_eq!(rejected["id"], 3);
        assert_eq!(rejected["error"]["code"], -32600);
        assert_eq!(rejected["error"]["data"]["kind"], "InvalidRequest");
        let answered = replies
            .iter()
            .find(|reply| reply.get("result").is_some())
            .expect("answered entry");
        assert_eq!(answered["result"], json!({}));
    }

    #[tokio::test]
    async fn id_reused_across_posts_keeps_the_first_response() {
        let (app, sessions) = app_with_sessions();
        let session_id = initialized_session(&app).await;

        // An earlier POST for id 5 is still waiting on its response.
        let (mut earlier, claimed) = sessions
            .open_request_stream(&session_id, [RequestId::Number(5)])
            .expect("attach");
        assert_eq!(claimed, vec![true]);

        let response = app
            .oneshot(post(
                Some(&session_id),
                r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#,
            ))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);
        let body_json = json_body(response).await;
        assert_eq!(body_json["id"], 5);
        assert_eq!(body_json["error"]["data"]["kind"], "InvalidRequest");

        let answer = Message::response(RequestId::Number(5), json!({"late": true}));
        sessions
            .enqueue(&session_id, answer.clone(), Some(RequestId::Number(5)))
            .expect("enqueue");
        assert_eq!(earlier.next().await, Delivery::Message(answer));
        assert_eq!(earlier.next().await, Delivery::Settled);
    }

    #[tokio::test]
    async fn event_stream_resumes_after_last_event_id() {
        let (app, sessions) = app_with_sessions();
        let session_id = initialized_session(&app).await;
        sessions.enqueue(&session_id, log_line(1), None).expect("enqueue");
        sessions.enqueue(&session_id, log_line(2), None).expect("enqueue");

        let response = app
            .clone()
            .oneshot(event_stream_request(&session_id, None))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();
        let (first_id, first) = next_event(&mut body).await;
        assert_eq!(first["params"]["seq"], 1);
        let (second_id, second) = next_event(&mut body).await;
        assert_eq!(second["params"]["seq"], 2);
        // The second event never reached the client.
        drop(body);

        let first_id = first_id.expect("first event id");
        assert!(second_id > Some(first_id));
        sessions.enqueue(&session_id, log_line(3), None).expect("enqueue");

        let response = app
            .oneshot(event_stream_request(&session_id, Some(first_id)))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();
        let (replayed_id, replayed) = next_event(&mut body).await;
        assert_eq!(replayed_id, second_id);
        assert_eq!(replayed["params"]["seq"], 2);
        let (_, fresh) = next_event(&mut body).await;
        assert_eq!(fresh["params"]["seq"], 3);
    }

    #[tokio::test]
    async fn post_without_session_and_initialize_leaves_no_session() {
        let (app, sessions) = app_with_sessions();

        let response = app
            .clone()
            .oneshot(post(None, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(SESSION_HEADER));
        assert_eq!(json_body(response).await["result"], json!({}));

        let response = app
            .oneshot(post(
                None,
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            ))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(!response.headers().contains_key(SESSION_HEADER));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn initialize_after_shutdown_is_unavailable() {
        let (app, sessions) = app_with_sessions();
        sessions.shutdown(Duration::ZERO).await;

        let response = app
            .oneshot(post(None, initialize_body()))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(sessions.is_empty());
    }
}
