//! Execution context handed to tool and resource handlers.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mcp::message::{Message, RequestId};
use crate::mcp::peer::Outbound;

pub const PROGRESS_NOTIFICATION: &str = "notifications/progress";

pub struct ToolContext {
    pub cancel: CancellationToken,
    pub progress: ProgressEmitter,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken, progress: ProgressEmitter) -> Self {
        Self { cancel, progress }
    }

    /// Context with no client attached; progress goes nowhere.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), ProgressEmitter::disabled())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct ProgressTarget {
    token: Value,
    request_id: RequestId,
    sink: Arc<dyn Outbound>,
    cancel: CancellationToken,
}

/// Sends `notifications/progress` for the request that owns it. Emission is
/// a no-op without a client progress token or once the request is cancelled.
#[derive(Clone, Default)]
pub struct ProgressEmitter {
    target: Option<Arc<ProgressTarget>>,
}

impl ProgressEmitter {
    pub fn new(
        token: Value,
        request_id: RequestId,
        sink: Arc<dyn Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target: Some(Arc::new(ProgressTarget {
                token,
                request_id,
                sink,
                cancel,
            })),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    pub async fn report(&self, progress: f64, total: Option<f64>, message: Option<String>) {
        let Some(target) = &self.target else {
            return;
        };
        if target.cancel.is_cancelled() {
            return;
        }

        let mut params = json!({
            "progressToken": target.token,
            "progress": progress,
        });
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        if let Some(message) = message {
            params["message"] = json!(message);
        }

        let notification = Message::notification(PROGRESS_NOTIFICATION, Some(params));
        if let Err(err) = target
            .sink
            .send(notification, Some(target.request_id.clone()))
            .await
        {
            debug!(request_id = %target.request_id, error = %err, "progress notification dropped");
        }
    }
}
