//! Upstream over HTTP+SSE
//!
//! `GET /sse` opens a session and streams an `endpoint` event followed by
//! `message` events; the client POSTs its messages to
//! `/messages?sessionId=<uuid>`. Each stream owns its session, which is
//! closed when the stream is dropped.

use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::state::{BridgeState, SessionRegistry};
use crate::error::ProxyError;
use crate::mcp::streaming::UpstreamEvent;
use crate::mcp::types::JsonRpcMessage;
use crate::session::Session;

/// Header carrying an API key as an alternative to `Authorization`
const API_KEY_HEADER: &str = "x-api-key";

/// Create the SSE bridge router
pub fn create_router(state: BridgeState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sse", get(open_stream))
        .route("/messages", post(post_message))
        .route("/health", get(health))
        .route("/health/live", get(liveness))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Errors returned to HTTP callers of the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("No API key provided")]
    MissingCredential,
    #[error("Unknown session")]
    UnknownSession,
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Session(#[from] ProxyError),
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            BridgeError::MissingCredential => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            BridgeError::UnknownSession => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            BridgeError::InvalidMessage(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            BridgeError::Session(err) => match err {
                ProxyError::InvalidCredential => (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS", err.to_string()),
                ProxyError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", err.to_string()),
                ProxyError::ResolverUnavailable(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Backend directory is unavailable".to_string(),
                ),
                ProxyError::NoUsableBackends => (StatusCode::BAD_GATEWAY, "NO_USABLE_BACKENDS", err.to_string()),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Internal error".to_string()),
            },
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageParams {
    #[serde(rename = "sessionId", alias = "session_id")]
    pub session_id: String,
}

/// Pick the session credential from the request, falling back to the default
fn extract_credential(headers: &HeaderMap, query_key: Option<&str>, default: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    bearer
        .or(api_key)
        .or(query_key)
        .or(default)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

/// Removes and closes the session when the stream is dropped
struct SessionGuard {
    session_id: Uuid,
    sessions: SessionRegistry,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = self.session_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Some(session) = sessions.remove(&session_id).await {
                    session.close().await;
                }
            });
        }
    }
}

/// `GET /sse`: open a session and stream its messages
async fn open_stream(
    State(state): State<BridgeState>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, BridgeError> {
    let credential = extract_credential(
        &headers,
        params.api_key.as_deref(),
        state.default_credential.as_deref(),
    )
    .ok_or(BridgeError::MissingCredential)?;

    let (tx, rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
    let session = Session::open(
        &credential,
        state.resolver.as_ref(),
        state.connector.clone(),
        state.timeouts,
        tx,
    )
    .await?;

    let session = state.sessions.insert(session).await;
    let guard = SessionGuard {
        session_id: session.id(),
        sessions: state.sessions.clone(),
    };

    let endpoint = UpstreamEvent::Endpoint {
        url: format!("/messages?sessionId={}", session.id()),
    };

    let events = stream::once(async move { endpoint })
        .chain(UnboundedReceiverStream::new(rx).map(UpstreamEvent::Message))
        .map(move |event| {
            let _guard = &guard;
            Ok(event.into_sse())
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// `POST /messages`: hand one client message to its session
async fn post_message(
    State(state): State<BridgeState>,
    Query(params): Query<MessageParams>,
    body: String,
) -> Result<StatusCode, BridgeError> {
    let session_id = Uuid::parse_str(&params.session_id).map_err(|_| BridgeError::UnknownSession)?;
    let session = state
        .sessions
        .get(&session_id)
        .await
        .ok_or(BridgeError::UnknownSession)?;

    let message: JsonRpcMessage =
        serde_json::from_str(&body).map_err(|e| BridgeError::InvalidMessage(e.to_string()))?;
    session.dispatch(message);

    Ok(StatusCode::ACCEPTED)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
}

/// Health check endpoint
async fn health(State(state): State<BridgeState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.sessions.len().await,
    })
}

/// Liveness probe (just returns 200 if the server is running)
async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mcp::client::Timeouts;
    use crate::mcp::testing::{FakeBackend, FakeConnector};
    use async_trait::async_trait;
    use axum::body::{Body, BodyDataStream};
    use axum::http::{header::HeaderValue, Request};
    use mcpfuse_shared::{BackendDescriptor, DescriptorResolver, ResolveError};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Accepts "good" (one backend) and "empty" (backend that is down)
    struct KeyResolver;

    #[async_trait]
    impl DescriptorResolver for KeyResolver {
        async fn resolve(&self, credential: &str) -> Result<Vec<BackendDescriptor>, ResolveError> {
            match credential {
                "good" => Ok(vec![BackendDescriptor::stdio("fs", "fake", vec![])]),
                "empty" => Ok(vec![BackendDescriptor::stdio("down", "fake", vec![])]),
                "nope" => Err(ResolveError::Forbidden),
                _ => Err(ResolveError::InvalidCredential),
            }
        }
    }

    fn state() -> BridgeState {
        let connector = FakeConnector::new();
        connector.add(FakeBackend::new("fs").with_tools(&["read"]));
        BridgeState::new(
            Arc::new(KeyResolver),
            Arc::new(connector),
            Timeouts {
                handshake: Duration::from_millis(500),
                request: Duration::from_secs(1),
            },
            None,
        )
    }

    /// Read body chunks until `needle` shows up
    async fn read_until(body: &mut BodyDataStream, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        seen
    }

    #[test]
    fn test_extract_credential_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_credential(&headers, None, Some("default")).as_deref(), Some("default"));
        assert_eq!(extract_credential(&headers, Some("q"), Some("default")).as_deref(), Some("q"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("header"));
        assert_eq!(extract_credential(&headers, Some("q"), None).as_deref(), Some("header"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer bearer"));
        assert_eq!(extract_credential(&headers, Some("q"), None).as_deref(), Some("bearer"));

        assert_eq!(extract_credential(&HeaderMap::new(), Some(""), None), None);
    }

    #[tokio::test]
    async fn test_session_open_errors_map_to_status() {
        let app = create_router(state());
        let cases = [
            (None, StatusCode::UNAUTHORIZED),
            (Some("bad"), StatusCode::UNAUTHORIZED),
            (Some("nope"), StatusCode::FORBIDDEN),
            (Some("empty"), StatusCode::BAD_GATEWAY),
        ];

        for (key, expected) in cases {
            let uri = match key {
                Some(key) => format!("/sse?api_key={}", key),
                None => "/sse".to_string(),
            };
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), expected, "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn test_stream_and_post_round_trip() {
        let state = state();
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::get("/sse")
                    .header(AUTHORIZATION, "Bearer good")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        let first = read_until(&mut body, "sessionId=").await;
        assert!(first.contains("event: endpoint"));
        let session_id = first
            .split("sessionId=")
            .nth(1)
            .unwrap()
            .lines()
            .next()
            .unwrap()
            .trim()
            .to_string();
        assert_eq!(state.sessions.len().await, 1);

        let post = app
            .clone()
            .oneshot(
                Request::post(format!("/messages?sessionId={}", session_id))
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(post.status(), StatusCode::ACCEPTED);

        let message = read_until(&mut body, "fs::read").await;
        assert!(message.contains("event: message"));
        assert!(message.contains("\"id\":7"));

        // Dropping the stream ends the session
        drop(body);
        for _ in 0..50 {
            if state.sessions.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(state.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_post_to_unknown_session() {
        let app = create_router(state());
        let response = app
            .oneshot(
                Request::post(format!("/messages?sessionId={}", Uuid::new_v4()))
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(state());
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["sessions"], 0);

        let live = app
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(live.status(), StatusCode::OK);
    }
}
