//! JSON-RPC message model
//!
//! A [`Message`] is one of request, notification, response or error. The wire
//! shape always carries `"jsonrpc": "2.0"`; on input the member is optional.

use std::fmt;
use std::time::Duration;

use serde::{ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::mcp::codec::DecodeError;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(id) => Some(Self::String(id.clone())),
            Value::Number(number) => number.as_i64().map(Self::Number),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::String(id) => write!(f, "{id:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    fn meta(&self) -> Option<&Map<String, Value>> {
        self.params
            .as_ref()
            .and_then(|params| params.get("_meta"))
            .and_then(Value::as_object)
    }

    /// Token the client supplied to receive `notifications/progress`.
    pub fn progress_token(&self) -> Option<Value> {
        self.meta()
            .and_then(|meta| meta.get("progressToken"))
            .filter(|token| token.is_string() || token.is_number())
            .cloned()
    }

    /// Per-request deadline from `_meta.timeoutMs`.
    pub fn timeout(&self) -> Option<Duration> {
        self.meta()
            .and_then(|meta| meta.get("timeoutMs"))
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub id: Option<RequestId>,
    pub error: RpcError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
    Error(ErrorResponse),
}

impl Message {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Self::Response(Response { id, result })
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self::Error(ErrorResponse { id, error })
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(request) => Some(&request.id),
            Self::Response(response) => Some(&response.id),
            Self::Error(error) => error.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// Responses and errors end a request; nothing else does.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Response(_) | Self::Error(_))
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification(_))
    }

    /// Structural decode of one JSON value. On failure the request id is
    /// returned alongside the error when it could be recovered.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut object) = value else {
            return Err(DecodeError::new(
                None,
                ProtocolError::InvalidRequest("message must be a JSON object".into()),
            ));
        };

        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => match RequestId::from_value(&raw) {
                Some(id) => Some(id),
                None => {
                    return Err(DecodeError::new(
                        None,
                        ProtocolError::InvalidRequest("id must be an integer or a string".into()),
                    ))
                }
            },
        };
        let recovered = id.clone();
        let invalid = |reason: &'static str| {
            DecodeError::new(recovered.clone(), ProtocolError::InvalidRequest(reason.into()))
        };

        match object.remove("jsonrpc") {
            None => {}
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            Some(_) => return Err(invalid("jsonrpc must be \"2.0\"")),
        }

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(invalid("method must be a string"));
            };
            if method.trim().is_empty() {
                return Err(invalid("method must not be empty"));
            }
            let params = match object.remove("params") {
                None | Some(Value::Null) => None,
                Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
                Some(_) => return Err(invalid("params must be an object or an array")),
            };

            return Ok(match id {
                Some(id) => Self::Request(Request { id, method, params }),
                None => Self::Notification(Notification { method, params }),
            });
        }

        match (object.remove("result"), object.remove("error")) {
            (Some(result), None) => match id {
                Some(id) => Ok(Self::Response(Response { id, result })),
                None => Err(invalid("response is missing its id")),
            },
            (None, Some(error)) => match serde_json::from_value::<RpcError>(error) {
                Ok(error) => Ok(Self::Error(ErrorResponse { id, error })),
                Err(_) => Err(invalid("error member is malformed")),
            },
            (Some(_), Some(_)) => Err(invalid("result and error are mutually exclusive")),
            (None, None) => Err(invalid("message has neither method, result nor error")),
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Self::Request(request) => {
                map.serialize_entry("id", &request.id)?;
                map.serialize_entry("method", &request.method)?;
                if let Some(params) = &request.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Self::Notification(notification) => {
                map.serialize_entry("method", &notification.method)?;
                if let Some(params) = &notification.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Self::Response(response) => {
                map.serialize_entry("id", &response.id)?;
                map.serialize_entry("result", &response.result)?;
            }
            Self::Error(error) => {
                map.serialize_entry("id", &error.id)?;
                map.serialize_entry("error", &error.error)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}
