use std::borrow::Cow;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::mcp::message::{Message, RequestId, RpcError};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const TRANSPORT_ERROR: i32 = -32000;
pub const SESSION_NOT_FOUND: i32 = -32001;
pub const NOT_INITIALIZED: i32 = -32002;
pub const HANDLER_ERROR: i32 = -32003;

/// Message-level failures. Each one becomes an id-correlated JSON-RPC error
/// and never stops the serving loop.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),
    /// Well-formed but refused in the current state, e.g. a reused id.
    #[error("invalid request: {0}")]
    Rejected(Cow<'static, str>),
    #[error("method not found: {method}")]
    MethodNotFound { method: String, data: Option<Value> },
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("server not initialized")]
    NotInitialized,
    #[error("{method} failed: {message}")]
    Handler {
        method: String,
        tool: Option<String>,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            method: method.into(),
            data: None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::InvalidRequest(_) | Self::Rejected(_) => INVALID_REQUEST,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::NotInitialized => NOT_INITIALIZED,
            Self::Handler { .. } => HANDLER_ERROR,
            Self::Transport(TransportError::SessionNotFound(_)) => SESSION_NOT_FOUND,
            Self::Transport(_) => TRANSPORT_ERROR,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Name of the error class, carried as `error.data.kind` on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) | Self::InvalidRequest(_) => "DecodeError",
            Self::Rejected(_) => "InvalidRequest",
            Self::MethodNotFound { .. } => "MethodNotFound",
            Self::InvalidParams(_) => "InvalidParams",
            Self::NotInitialized => "NotInitialized",
            Self::Handler { .. } => "HandlerError",
            Self::Transport(TransportError::SessionNotFound(_)) => "SessionNotFound",
            Self::Transport(_) => "TransportError",
            Self::Internal(_) => "InternalError",
        }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        let mut data = serde_json::Map::new();
        data.insert("kind".to_string(), json!(self.kind()));
        match self {
            Self::MethodNotFound {
                method,
                data: Some(Value::Object(extra)),
            } => {
                data.insert("method".to_string(), json!(method));
                data.extend(extra.clone());
            }
            Self::MethodNotFound { method, .. } => {
                data.insert("method".to_string(), json!(method));
            }
            Self::Handler { method, tool, .. } => {
                data.insert("method".to_string(), json!(method));
                if let Some(tool) = tool {
                    data.insert("tool".to_string(), json!(tool));
                }
            }
            Self::Transport(TransportError::SessionNotFound(_)) => {
                data.insert("reinitialize".to_string(), json!(true));
            }
            _ => {}
        }

        RpcError {
            code: self.code(),
            message: self.to_string(),
            data: Some(Value::Object(data)),
        }
    }

    pub fn into_message(self, id: Option<RequestId>) -> Message {
        Message::error(id, self.to_rpc_error())
    }
}

/// Errors raised by tool and resource plugins.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Wraps the plugin error with the method and tool that raised it.
    pub fn into_protocol(self, method: &str, tool: Option<&str>) -> ProtocolError {
        match self {
            Self::InvalidArguments(message) => ProtocolError::InvalidParams(message),
            Self::Failed(message) => ProtocolError::Handler {
                method: method.to_string(),
                tool: tool.map(str::to_string),
                message,
            },
        }
    }
}

/// Startup configuration errors of the tool/resource registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate registration for {0}")]
    DuplicateName(String),
    #[error("registry is closed, cannot register {0}")]
    RegistryClosed(String),
}

/// Connection or session level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session {0} failed: outbound buffer overflow")]
    SessionFailed(String),
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// HTTP-level errors of the streamable endpoint.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("bad request: {message}")]
    BadRequest {
        code: &'static str,
        message: &'static str,
    },
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("internal error")]
    Internal { code: &'static str, message: String },
}

impl AppError {
    pub fn bad_request(code: &'static str, message: &'static str) -> Self {
        Self::BadRequest { code, message }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::SessionNotFound(id) | TransportError::SessionFailed(id) => {
                Self::SessionNotFound(id)
            }
            TransportError::Closed => Self::ShuttingDown,
            other => Self::internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::SessionNotFound(id) => {
                let error =
                    ProtocolError::Transport(TransportError::SessionNotFound(id)).into_message(None);
                (StatusCode::NOT_FOUND, Json(error)).into_response()
            }
            Self::BadRequest { code, message } => {
                let error = Message::error(
                    None,
                    RpcError {
                        code: INVALID_REQUEST,
                        message: message.to_string(),
                        data: Some(json!({ "kind": "DecodeError", "code": code })),
                    },
                );
                (StatusCode::BAD_REQUEST, Json(error)).into_response()
            }
            Self::ShuttingDown => {
                let error = ProtocolError::Transport(TransportError::Closed).into_message(None);
                (StatusCode::SERVICE_UNAVAILABLE, Json(error)).into_response()
            }
            Self::Internal { code, message } => {
                tracing::error!(error = %message, "request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "code": code,
                        "message": "internal server error",
                        "details": {}
                    })),
                )
                    .into_response()
            }
        }
    }
}
