use axum::http::{HeaderName, HeaderValue};
use axum_extra::headers::{self, Header};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const LAST_EVENT_ID: &str = "last-event-id";

static MCP_SESSION_ID: HeaderName = HeaderName::from_static("mcp-session-id");

/// Session token carried on every request after `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpSessionId(pub String);

impl Header for McpSessionId {
    fn name() -> &'static HeaderName {
        &MCP_SESSION_ID
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let id = value
            .to_str()
            .map_err(|_| headers::Error::invalid())?
            .trim();
        if id.is_empty() {
            return Err(headers::Error::invalid());
        }
        Ok(Self(id.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}
