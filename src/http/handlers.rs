//! Axum HTTP handlers for the web server
//!
//! Provides the streamable MCP endpoint (`POST`/`GET`/`DELETE /mcp`) and the
//! general metadata endpoints.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::ACCEPT, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use axum_extra::{headers::HeaderMapExt, TypedHeader};
use futures::Stream;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{AppError, ProtocolError};
use crate::http::headers::{McpSessionId, LAST_EVENT_ID, SESSION_HEADER};
use crate::mcp::codec::{decode_body, DecodeError};
use crate::mcp::dispatcher::INITIALIZE;
use crate::mcp::message::{Message, RequestId};
use crate::session::{Delivery, StreamLease};
use crate::AppState;

const EVENT_STREAM: &str = "text/event-stream";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub mcp_endpoint: &'static str,
    pub session_header: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        mcp_endpoint: "/mcp",
        session_header: SESSION_HEADER,
    })
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(EVENT_STREAM))
}

fn is_batch(body: &[u8]) -> bool {
    body.iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|byte| *byte == b'[')
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn entry_id(entry: &Result<Message, DecodeError>) -> Option<RequestId> {
    match entry {
        Ok(Message::Request(request)) => Some(request.id.clone()),
        Ok(_) => None,
        Err(error) => error.id.clone(),
    }
}

/// Answer for an entry whose id is already owed a response on this session.
fn refuse(entry: Result<Message, DecodeError>) -> Message {
    match entry {
        Ok(message) => {
            let id = message.id().cloned();
            warn!(request_id = ?id, "request id reused while still open");
            ProtocolError::Rejected("request id is already in flight".into()).into_message(id)
        }
        Err(error) => error.reason.into_message(error.id),
    }
}

fn with_session(mut response: Response, session_id: &str) -> Response {
    response
        .headers_mut()
        .typed_insert(McpSessionId(session_id.to_string()));
    response
}

fn sse_event(message: &Message, id: Option<u64>) -> Result<Event, axum::Error> {
    let event = Event::default().event("message");
    let event = match id {
        Some(id) => event.id(id.to_string()),
        None => event,
    };
    event.json_data(message)
}

/// Streams `prelude` first, then whatever the lease delivers.
fn event_stream(
    mut lease: StreamLease,
    prelude: Vec<Message>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        for message in prelude {
            match sse_event(&message, None) {
                Ok(event) => yield Ok(event),
                Err(err) => warn!(session_id = %lease.session_id(), error = %err, "failed to encode sse event"),
            }
        }
        loop {
            match lease.next().await {
                Delivery::Message(message) => match sse_event(&message, lease.last_event_id()) {
                    Ok(event) => yield Ok(event),
                    Err(err) => warn!(session_id = %lease.session_id(), error = %err, "failed to encode sse event"),
                },
                Delivery::Settled | Delivery::Gone => break,
            }
        }
        debug!(session_id = %lease.session_id(), "event stream closed");
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `POST /mcp`: one JSON-RPC message or a batch.
pub async fn post_mcp(
    State(state): State<AppState>,
    session: Option<TypedHeader<McpSessionId>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let entries = match decode_body(&body) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(error = %error, "undecodable request body");
            let reply = error.reason.into_message(error.id);
            return Ok((StatusCode::OK, Json(reply)).into_response());
        }
    };

    // Without a session header only an initialize keeps the new session;
    // anything else is answered once on a single-use session.
    let opens_session = entries.iter().any(|entry| {
        matches!(entry, Ok(Message::Request(request)) if request.method == INITIALIZE)
    });
    let (session_id, peer, single_use): (Arc<str>, _, bool) = match session {
        Some(TypedHeader(McpSessionId(session_id))) => {
            let peer = state.sessions.peer(&session_id)?;
            (Arc::from(session_id), peer, false)
        }
        None => {
            let (session_id, peer) = state.sessions.create_session()?;
            (session_id, peer, !opens_session)
        }
    };

    let request_ids = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| entry_id(entry).map(|id| (index, id)))
        .collect::<Vec<(usize, RequestId)>>();

    let dispatcher = state.sessions.dispatcher();
    if request_ids.is_empty() {
        for entry in entries {
            match entry {
                Ok(message) => dispatcher.handle(&peer, message).await,
                Err(error) => dispatcher.handle_malformed(&peer, error).await,
            }
        }
        return Ok(conclude(&state, StatusCode::ACCEPTED.into_response(), &session_id, single_use));
    }

    let (mut lease, claimed) = state
        .sessions
        .open_request_stream(&session_id, request_ids.iter().map(|(_, id)| id.clone()))?;
    let refused = request_ids
        .iter()
        .zip(claimed)
        .filter(|(_, claimed)| !claimed)
        .map(|((index, _), _)| *index)
        .collect::<HashSet<usize>>();

    let mut replies = Vec::new();
    for (index, entry) in entries.into_iter().enumerate() {
        if refused.contains(&index) {
            replies.push(refuse(entry));
            continue;
        }
        match entry {
            Ok(message) => dispatcher.handle(&peer, message).await,
            Err(error) => dispatcher.handle_malformed(&peer, error).await,
        }
    }

    if wants_event_stream(&headers) && !single_use {
        return Ok(with_session(
            event_stream(lease, replies).into_response(),
            &session_id,
        ));
    }

    loop {
        match lease.next().await {
            Delivery::Message(message) if message.is_terminal() => replies.push(message),
            Delivery::Message(_) => {}
            Delivery::Settled | Delivery::Gone => break,
        }
    }
    drop(lease);

    let response = match replies.len() {
        0 => StatusCode::ACCEPTED.into_response(),
        1 if !is_batch(&body) => (StatusCode::OK, Json(replies.remove(0))).into_response(),
        _ => (StatusCode::OK, Json(replies)).into_response(),
    };
    Ok(conclude(&state, response, &session_id, single_use))
}

fn conclude(state: &AppState, response: Response, session_id: &str, single_use: bool) -> Response {
    if single_use {
        state.sessions.close(session_id);
        debug!(session_id, "single-use session discarded");
        return response;
    }
    with_session(response, session_id)
}

/// `GET /mcp`: standalone stream for messages no POST stream carries.
/// `Last-Event-ID` resumes after the last event the client saw.
pub async fn get_mcp(
    State(state): State<AppState>,
    session: Option<TypedHeader<McpSessionId>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let Some(TypedHeader(McpSessionId(session_id))) = session else {
        return Err(AppError::bad_request(
            "missing_session",
            "Mcp-Session-Id header is required",
        ));
    };

    let lease = state
        .sessions
        .open_standalone_stream(&session_id, last_event_id(&headers))?;
    Ok(with_session(
        event_stream(lease, Vec::new()).into_response(),
        &session_id,
    ))
}

/// `DELETE /mcp`: explicit session termination.
pub async fn delete_mcp(
    State(state): State<AppState>,
    session: Option<TypedHeader<McpSessionId>>,
) -> Result<StatusCode, AppError> {
    let Some(TypedHeader(McpSessionId(session_id))) = session else {
        return Err(AppError::bad_request(
            "missing_session",
            "Mcp-Session-Id header is required",
        ));
    };

    if state.sessions.close(&session_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::SessionNotFound(session_id))
    }
}
