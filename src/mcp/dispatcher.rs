//! The transport-agnostic MCP engine
//!
//! Requests move through `Received -> Validated -> Dispatched -> {Completed |
//! Failed | Cancelled}`. Built-in methods answer inline. Tool calls and
//! resource reads run on their own task and hold an [`InFlightRequest`] entry
//! until they settle; a cancelled entry never produces a response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_mcp_sdk::schema::{ListResourcesResult, ListToolsResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ProtocolError, TransportError};
use crate::mcp::audit::redact_params;
use crate::mcp::codec::DecodeError;
use crate::mcp::context::{ProgressEmitter, ToolContext};
use crate::mcp::message::{Message, Notification, Request, RequestId};
use crate::mcp::peer::{Outbound, Peer, Phase};
use crate::mcp::registry::{Registry, ResourceEntry, ToolEntry};
use crate::mcp::schema::validate_arguments;

pub const INITIALIZE: &str = "initialize";
pub const PING: &str = "ping";
pub const TOOLS_LIST: &str = "tools/list";
pub const TOOLS_CALL: &str = "tools/call";
pub const RESOURCES_LIST: &str = "resources/list";
pub const RESOURCES_READ: &str = "resources/read";
pub const NOTIFY_INITIALIZED: &str = "notifications/initialized";
pub const NOTIFY_CANCELLED: &str = "notifications/cancelled";

pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];
pub const LATEST_PROTOCOL_VERSION: &str = SUPPORTED_PROTOCOL_VERSIONS[0];

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub server_name: String,
    pub server_version: String,
    pub instructions: Option<String>,
    /// Deadline for requests that do not carry `_meta.timeoutMs`.
    pub request_timeout: Option<Duration>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            server_name: env!("CARGO_PKG_NAME").to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
            request_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InFlightKey {
    scope: Arc<str>,
    id: RequestId,
}

pub struct InFlightRequest {
    pub id: RequestId,
    pub method: String,
    pub started_at: Instant,
    cancel: CancellationToken,
    seq: u64,
    /// Set once the handler returned and its response is being written.
    completing: bool,
    sink: Arc<dyn Outbound>,
}

enum Invocation {
    Tool(Arc<ToolEntry>, Value),
    Resource(Arc<ResourceEntry>),
}

impl Invocation {
    fn target(&self) -> &str {
        match self {
            Self::Tool(entry, _) => &entry.name,
            Self::Resource(entry) => &entry.uri,
        }
    }

    fn streaming(&self) -> bool {
        match self {
            Self::Tool(entry, _) => entry.handler.streaming(),
            Self::Resource(_) => false,
        }
    }

    async fn run(self, ctx: ToolContext) -> Result<Value, ProtocolError> {
        match self {
            Self::Tool(entry, arguments) => {
                let result = entry
                    .handler
                    .invoke(arguments, ctx)
                    .await
                    .map_err(|err| err.into_protocol(TOOLS_CALL, Some(&entry.name)))?;
                to_result_value(&result)
            }
            Self::Resource(entry) => {
                let result = entry
                    .handler
                    .read(ctx)
                    .await
                    .map_err(|err| err.into_protocol(RESOURCES_READ, None))?;
                to_result_value(&result)
            }
        }
    }
}

/// Bookkeeping a dispatched task carries until it settles.
struct Pending {
    key: InFlightKey,
    seq: u64,
    method: String,
    params: Option<Value>,
    started_at: Instant,
}

#[derive(Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default, alias = "args")]
    arguments: Option<Value>,
}

#[derive(Deserialize)]
struct ReadResourceParams {
    uri: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledParams {
    request_id: RequestId,
    #[serde(default)]
    reason: Option<String>,
}

fn canonical_method(method: &str) -> &str {
    match method {
        "listTools" => TOOLS_LIST,
        "callTool" => TOOLS_CALL,
        "listResources" => RESOURCES_LIST,
        "readResource" => RESOURCES_READ,
        "initialized" => NOTIFY_INITIALIZED,
        other => other,
    }
}

fn to_result_value<T: Serialize>(result: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(result)
        .map_err(|err| ProtocolError::Internal(format!("result serialization failed: {err}")))
}

pub fn negotiate_protocol_version(offered: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|version| **version == offered)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

fn audit(
    scope: &str,
    request_id: &RequestId,
    method: &str,
    params: Option<&Value>,
    outcome: &Result<Value, ProtocolError>,
    started_at: Instant,
) {
    let params = redact_params(params);
    let duration_ms = started_at.elapsed().as_millis() as u64;
    match outcome {
        Ok(_) => info!(
            session = scope,
            request_id = %request_id,
            method,
            params = %params,
            duration_ms,
            outcome = "success",
            "mcp action audited"
        ),
        Err(err) => info!(
            session = scope,
            request_id = %request_id,
            method,
            params = %params,
            duration_ms,
            outcome = "failure",
            error = %err,
            "mcp action audited"
        ),
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    in_flight: Mutex<HashMap<InFlightKey, InFlightRequest>>,
    settled: Notify,
    next_seq: AtomicU64,
    options: DispatchOptions,
}

impl Dispatcher {
    /// Takes ownership of the serving registry and closes it for registration.
    pub fn new(registry: Arc<Registry>, options: DispatchOptions) -> Self {
        registry.close();
        Self {
            registry,
            in_flight: Mutex::new(HashMap::new()),
            settled: Notify::new(),
            next_seq: AtomicU64::new(0),
            options,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn in_flight_count(&self, scope: Option<&str>) -> usize {
        let in_flight = self.in_flight.lock();
        match scope {
            Some(scope) => in_flight.keys().filter(|key| &*key.scope == scope).count(),
            None => in_flight.len(),
        }
    }

    pub fn is_in_flight(&self, scope: &str, id: &RequestId) -> bool {
        self.in_flight.lock().contains_key(&InFlightKey {
            scope: Arc::from(scope),
            id: id.clone(),
        })
    }

    pub async fn handle(self: &Arc<Self>, peer: &Arc<Peer>, message: Message) {
        match message {
            Message::Request(request) => self.handle_request(peer, request).await,
            Message::Notification(notification) => self.handle_notification(peer, notification),
            Message::Response(response) => debug!(
                session = %peer.scope(),
                request_id = %response.id,
                "ignoring client response, no server requests are pending"
            ),
            Message::Error(error) => warn!(
                session = %peer.scope(),
                code = error.error.code,
                message = %error.error.message,
                "client sent an error message"
            ),
        }
    }

    /// Answers a frame the codec rejected. Frames without a recoverable id
    /// are only logged.
    pub async fn handle_malformed(&self, peer: &Peer, error: DecodeError) {
        warn!(session = %peer.scope(), id = ?error.id, error = %error, "malformed frame");
        let Some(reply) = error.reply() else {
            return;
        };
        let related = reply.id().cloned();
        if let Err(err) = peer.send(reply, related).await {
            warn!(session = %peer.scope(), error = %err, "failed to send decode error");
        }
    }

    async fn handle_request(self: &Arc<Self>, peer: &Arc<Peer>, request: Request) {
        let started_at = Instant::now();
        let method = canonical_method(&request.method).to_string();

        if self.is_in_flight(peer.scope(), &request.id) {
            let error = ProtocolError::Rejected("request id is already in flight".into());
            self.reply(peer, &request, &method, Err(error), started_at).await;
            return;
        }

        let outcome = match method.as_str() {
            _ if peer.phase() == Phase::Closed => {
                Err(ProtocolError::Transport(TransportError::Closed))
            }
            INITIALIZE => self.initialize(peer, &request),
            PING => Ok(json!({})),
            _ if !peer.is_initialized() => Err(ProtocolError::NotInitialized),
            TOOLS_LIST => to_result_value(&ListToolsResult {
                meta: None,
                next_cursor: None,
                tools: self.registry.tools(),
            }),
            RESOURCES_LIST => to_result_value(&ListResourcesResult {
                meta: None,
                next_cursor: None,
                resources: self.registry.resources(),
            }),
            TOOLS_CALL => match self.validate_tool_call(&request) {
                Ok(invocation) => return self.dispatch(peer, request, method.clone(), invocation).await,
                Err(err) => Err(err),
            },
            RESOURCES_READ => match self.validate_resource_read(&request) {
                Ok(invocation) => return self.dispatch(peer, request, method.clone(), invocation).await,
                Err(err) => Err(err),
            },
            _ => Err(ProtocolError::method_not_found(request.method.clone())),
        };

        self.reply(peer, &request, &method, outcome, started_at).await;
    }

    async fn reply(
        &self,
        peer: &Peer,
        request: &Request,
        method: &str,
        outcome: Result<Value, ProtocolError>,
        started_at: Instant,
    ) {
        audit(
            peer.scope(),
            &request.id,
            method,
            request.params.as_ref(),
            &outcome,
            started_at,
        );
        let message = match outcome {
            Ok(result) => Message::response(request.id.clone(), result),
            Err(err) => err.into_message(Some(request.id.clone())),
        };
        if let Err(err) = peer.send(message, Some(request.id.clone())).await {
            warn!(session = %peer.scope(), request_id = %request.id, error = %err, "failed to send response");
        }
    }

    fn handle_notification(&self, peer: &Peer, notification: Notification) {
        match canonical_method(&notification.method) {
            NOTIFY_INITIALIZED => {
                if peer.transition(Phase::Initialized, Phase::Ready) {
                    info!(session = %peer.scope(), "client initialized");
                } else {
                    debug!(session = %peer.scope(), phase = ?peer.phase(), "unexpected initialized notification");
                }
            }
            NOTIFY_CANCELLED => {
                let params = notification
                    .params
                    .and_then(|params| serde_json::from_value::<CancelledParams>(params).ok());
                let Some(params) = params else {
                    warn!(session = %peer.scope(), "malformed cancellation notification");
                    return;
                };
                let reason = params.reason.as_deref().unwrap_or("cancelled by client");
                if !self.cancel(peer.scope(), &params.request_id, reason) {
                    debug!(
                        session = %peer.scope(),
                        request_id = %params.request_id,
                        "cancellation for a request that is not in flight"
                    );
                }
            }
            other => debug!(session = %peer.scope(), method = other, "ignoring notification"),
        }
    }

    fn initialize(&self, peer: &Peer, request: &Request) -> Result<Value, ProtocolError> {
        let params = request.params.as_ref();
        let offered = params
            .and_then(|params| params.get("protocolVersion"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|version| !version.is_empty())
            .ok_or_else(|| {
                ProtocolError::InvalidParams("initialize params.protocolVersion is required".into())
            })?;
        let protocol_version = negotiate_protocol_version(offered);

        if !peer.transition(Phase::Created, Phase::Initialized) {
            return Err(ProtocolError::Rejected(
                "initialize may only be sent once per session".into(),
            ));
        }

        let client = params
            .and_then(|params| params.get("clientInfo"))
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(session = %peer.scope(), client, offered, protocol_version, "client initializing");

        let mut result = json!({
            "protocolVersion": protocol_version,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": false, "listChanged": false }
            },
            "serverInfo": {
                "name": self.options.server_name,
                "version": self.options.server_version
            }
        });
        if let Some(instructions) = &self.options.instructions {
            result["instructions"] = json!(instructions);
        }
        Ok(result)
    }

    fn validate_tool_call(&self, request: &Request) -> Result<Invocation, ProtocolError> {
        let params = request
            .params
            .clone()
            .ok_or_else(|| ProtocolError::InvalidParams("tools/call requires params".into()))?;
        let call: CallToolParams = serde_json::from_value(params)
            .map_err(|err| ProtocolError::InvalidParams(err.to_string()))?;
        let entry = self.registry.resolve_tool(&call.name)?;

        let arguments = match call.arguments {
            None | Some(Value::Null) => json!({}),
            Some(arguments) => arguments,
        };
        validate_arguments(&entry.input_schema, &arguments).map_err(ProtocolError::InvalidParams)?;
        Ok(Invocation::Tool(entry, arguments))
    }

    fn validate_resource_read(&self, request: &Request) -> Result<Invocation, ProtocolError> {
        let params = request
            .params
            .clone()
            .ok_or_else(|| ProtocolError::InvalidParams("resources/read requires params".into()))?;
        let read: ReadResourceParams = serde_json::from_value(params)
            .map_err(|err| ProtocolError::InvalidParams(err.to_string()))?;
        Ok(Invocation::Resource(self.registry.resolve_resource(&read.uri)?))
    }

    async fn dispatch(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        request: Request,
        method: String,
        invocation: Invocation,
    ) {
        let started_at = Instant::now();
        let cancel = CancellationToken::new();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = InFlightKey {
            scope: Arc::clone(peer.scope()),
            id: request.id.clone(),
        };

        let registered = {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&key) {
                false
            } else {
                in_flight.insert(
                    key.clone(),
                    InFlightRequest {
                        id: request.id.clone(),
                        method: method.clone(),
                        started_at,
                        cancel: cancel.clone(),
                        seq,
                        completing: false,
                        sink: peer.sink(),
                    },
                );
                true
            }
        };
        if !registered {
            let error = ProtocolError::Rejected("request id is already in flight".into());
            self.reply(peer, &request, &method, Err(error), started_at).await;
            return;
        }

        let progress = match (invocation.streaming(), request.progress_token()) {
            (true, Some(token)) => {
                ProgressEmitter::new(token, request.id.clone(), peer.sink(), cancel.clone())
            }
            _ => ProgressEmitter::disabled(),
        };
        let ctx = ToolContext::new(cancel, progress);
        let deadline = request.timeout().or(self.options.request_timeout);
        debug!(
            session = %key.scope,
            request_id = %key.id,
            method = %method,
            handler = invocation.target(),
            "request dispatched"
        );

        let pending = Pending {
            key,
            seq,
            method,
            params: request.params,
            started_at,
        };
        let dispatcher = Arc::clone(self);
        let peer = Arc::clone(peer);
        tokio::spawn(async move {
            let work = invocation.run(ctx);
            tokio::pin!(work);
            let outcome = match deadline {
                Some(deadline) => tokio::select! {
                    outcome = &mut work => outcome,
                    _ = tokio::time::sleep(deadline) => {
                        dispatcher.cancel(&pending.key.scope, &pending.key.id, "deadline exceeded");
                        work.await
                    }
                },
                None => work.await,
            };
            dispatcher.complete(&peer, pending, outcome).await;
        });
    }

    async fn complete(&self, peer: &Peer, pending: Pending, outcome: Result<Value, ProtocolError>) {
        let claimed = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get_mut(&pending.key) {
                Some(entry) if entry.seq == pending.seq => {
                    entry.completing = true;
                    true
                }
                _ => false,
            }
        };
        if !claimed {
            debug!(
                session = %pending.key.scope,
                request_id = %pending.key.id,
                "handler finished after cancellation, result discarded"
            );
            return;
        }

        audit(
            &pending.key.scope,
            &pending.key.id,
            &pending.method,
            pending.params.as_ref(),
            &outcome,
            pending.started_at,
        );
        let id = pending.key.id.clone();
        let message = match outcome {
            Ok(result) => Message::response(id.clone(), result),
            Err(err) => err.into_message(Some(id.clone())),
        };
        if let Err(err) = peer.send(message, Some(id)).await {
            warn!(session = %pending.key.scope, request_id = %pending.key.id, error = %err, "failed to send response");
        }

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight
                .get(&pending.key)
                .is_some_and(|entry| entry.seq == pending.seq)
            {
                in_flight.remove(&pending.key);
            }
        }
        self.settled.notify_waiters();
    }

    /// Cancels an in-flight request. Returns false when it already settled or
    /// its response is being written.
    pub fn cancel(&self, scope: &str, id: &RequestId, reason: &str) -> bool {
        let key = InFlightKey {
            scope: Arc::from(scope),
            id: id.clone(),
        };
        let entry = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(entry) if !entry.completing => in_flight.remove(&key),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };

        entry.cancel.cancel();
        entry.sink.abandon(id);
        self.settled.notify_waiters();
        info!(
            session = scope,
            request_id = %id,
            method = %entry.method,
            elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
            reason,
            "request cancelled"
        );
        true
    }

    /// Cancels everything a terminated session still had in flight.
    pub fn cancel_scope(&self, scope: &str) -> usize {
        let cancelled = {
            let mut in_flight = self.in_flight.lock();
            let keys = in_flight
                .keys()
                .filter(|key| &*key.scope == scope)
                .cloned()
                .collect::<Vec<_>>();
            keys.into_iter()
                .filter_map(|key| in_flight.remove(&key))
                .collect::<Vec<_>>()
        };
        for entry in &cancelled {
            entry.cancel.cancel();
        }
        if !cancelled.is_empty() {
            self.settled.notify_waiters();
            info!(session = scope, count = cancelled.len(), "cancelled in-flight requests of closed session");
        }
        cancelled.len()
    }

    /// Waits up to `grace` for in-flight requests to settle, then cancels the
    /// rest. Returns how many were cancelled.
    pub async fn drain(&self, scope: Option<&str>, grace: Duration) -> usize {
        if self.wait_settled(scope, grace).await {
            return 0;
        }

        let keys = {
            let in_flight = self.in_flight.lock();
            in_flight
                .iter()
                .filter(|(key, entry)| {
                    !entry.completing && scope.map_or(true, |scope| &*key.scope == scope)
                })
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>()
        };
        let cancelled = keys
            .iter()
            .filter(|key| self.cancel(&key.scope, &key.id, "shutdown grace period elapsed"))
            .count();

        // Responses already being written get one more grace period.
        self.wait_settled(scope, grace).await;
        cancelled
    }

    async fn wait_settled(&self, scope: Option<&str>, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.settled.notified();
            if self.in_flight_count(scope) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight_count(scope) == 0;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use rust_mcp_sdk::schema::{CallToolResult, Tool};
    use tokio::sync::mpsc;

    use super::*;
    use crate::errors::HandlerError;
    use crate::mcp::registry::tests::{text_result, tool_definition};
    use crate::mcp::registry::ToolHandler;

    pub(crate) struct RecordingSink {
        tx: mpsc::UnboundedSender<Message>,
        pub(crate) abandoned: parking_lot::Mutex<Vec<RequestId>>,
    }

    impl RecordingSink {
        pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    tx,
                    abandoned: parking_lot::Mutex::new(Vec::new()),
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl Outbound for RecordingSink {
        async fn send(&self, message: Message, _related: Option<RequestId>) -> Result<(), TransportError> {
            self.tx.send(message).map_err(|_| TransportError::Closed)
        }

        fn abandon(&self, id: &RequestId) {
            self.abandoned.lock().push(id.clone());
        }
    }

    #[derive(Clone)]
    enum Behavior {
        Echo,
        WaitForCancel,
        Gate(Arc<Notify>),
        Progress,
        Fail,
    }

    struct TestTool {
        name: &'static str,
        behavior: Behavior,
        invoked: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolHandler for TestTool {
        fn definition(&self) -> Tool {
            tool_definition(self.name)
        }

        fn streaming(&self) -> bool {
            matches!(self.behavior, Behavior::Progress)
        }

        async fn invoke(&self, arguments: Value, ctx: ToolContext) -> Result<CallToolResult, HandlerError> {
            self.invoked.fetch_add(1, Ordering::SeqCst);
            let result = match &self.behavior {
                Behavior::Echo => Ok(text_result(arguments["value"].as_str().unwrap_or_default())),
                Behavior::WaitForCancel => {
                    ctx.cancel.cancelled().await;
                    Err(HandlerError::failed("cancelled"))
                }
                Behavior::Gate(gate) => {
                    gate.notified().await;
                    Ok(text_result("late"))
                }
                Behavior::Progress => {
                    ctx.progress.report(0.0, Some(2.0), Some("started".into())).await;
                    ctx.progress.report(1.0, Some(2.0), None).await;
                    Ok(text_result("done"))
                }
                Behavior::Fail => Err(HandlerError::failed("Movie not found: 42")),
            };
            self.finished.fetch_add(1, Ordering::SeqCst);
            result
        }
    }

    pub(crate) struct Harness {
        pub(crate) dispatcher: Arc<Dispatcher>,
        pub(crate) peer: Arc<Peer>,
        pub(crate) sink: Arc<RecordingSink>,
        pub(crate) rx: mpsc::UnboundedReceiver<Message>,
        invoked: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        gate: Arc<Notify>,
    }

    impl Harness {
        pub(crate) async fn new() -> Self {
            let mut harness = Self::uninitialized();
            harness
                .send(Message::request(
                    RequestId::Number(0),
                    INITIALIZE,
                    Some(json!({"protocolVersion": "2025-06-18", "clientInfo": {"name": "test"}})),
                ))
                .await;
            let reply = harness.next().await;
            assert!(matches!(reply, Message::Response(_)), "initialize failed: {reply:?}");
            harness
                .send(Message::notification(NOTIFY_INITIALIZED, None))
                .await;
            harness
        }

        pub(crate) fn uninitialized() -> Self {
            let invoked = Arc::new(AtomicUsize::new(0));
            let finished = Arc::new(AtomicUsize::new(0));
            let gate = Arc::new(Notify::new());
            let registry = Registry::new();
            let tools = [
                ("echo", Behavior::Echo),
                ("wait_for_cancel", Behavior::WaitForCancel),
                ("gated", Behavior::Gate(Arc::clone(&gate))),
                ("progress", Behavior::Progress),
                ("fail", Behavior::Fail),
            ];
            for (name, behavior) in tools {
                registry
                    .register_tool(TestTool {
                        name,
                        behavior,
                        invoked: Arc::clone(&invoked),
                        finished: Arc::clone(&finished),
                    })
                    .expect("register");
            }

            let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), DispatchOptions::default()));
            let (sink, rx) = RecordingSink::new();
            let peer = Arc::new(Peer::new("test", sink.clone() as Arc<dyn Outbound>));
            Self {
                dispatcher,
                peer,
                sink,
                rx,
                invoked,
                finished,
                gate,
            }
        }

        pub(crate) async fn send(&mut self, message: Message) {
            self.dispatcher.handle(&self.peer, message).await;
        }

        pub(crate) async fn next(&mut self) -> Message {
            self.rx.recv().await.expect("message")
        }

        async fn settle(&self) {
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
        }
    }

    fn call(id: i64, tool: &str, params: Value) -> Message {
        let mut call = json!({"name": tool, "arguments": {"value": "x"}});
        if let (Some(call), Some(extra)) = (call.as_object_mut(), params.as_object()) {
            call.extend(extra.clone());
        }
        Message::request(RequestId::Number(id), TOOLS_CALL, Some(call))
    }

    fn error_code(message: &Message) -> i32 {
        match message {
            Message::Error(error) => error.error.code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let mut harness = Harness::new().await;
        harness
            .send(Message::request(RequestId::Number(4), "frobnicate", Some(json!({}))))
            .await;

        let Message::Error(error) = harness.next().await else {
            panic!("expected error");
        };
        assert_eq!(error.id, Some(RequestId::Number(4)));
        assert_eq!(error.error.code, -32601);
        assert_eq!(error.error.data.expect("data")["kind"], "MethodNotFound");
    }

    #[tokio::test]
    async fn tool_calls_require_initialize() {
        let mut harness = Harness::uninitialized();
        harness.send(call(1, "echo", json!({}))).await;
        assert_eq!(error_code(&harness.next().await), -32002);
        assert_eq!(harness.invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ping_is_allowed_before_initialize() {
        let mut harness = Harness::uninitialized();
        harness
            .send(Message::request(RequestId::Number(1), PING, None))
            .await;
        assert_eq!(
            harness.next().await,
            Message::response(RequestId::Number(1), json!({}))
        );
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let mut harness = Harness::new().await;
        harness
            .send(Message::request(
                RequestId::Number(9),
                INITIALIZE,
                Some(json!({"protocolVersion": "2024-11-05"})),
            ))
            .await;
        let reply = harness.next().await;
        assert_eq!(error_code(&reply), -32600);
        let Message::Error(error) = reply else {
            unreachable!();
        };
        assert_eq!(error.error.data.expect("data")["kind"], "InvalidRequest");
    }

    #[tokio::test]
    async fn initialize_negotiates_protocol_version() {
        let mut harness = Harness::uninitialized();
        harness
            .send(Message::request(
                RequestId::Number(1),
                INITIALIZE,
                Some(json!({"protocolVersion": "2024-11-05"})),
            ))
            .await;
        let Message::Response(response) = harness.next().await else {
            panic!("expected response");
        };
        assert_eq!(response.result["protocolVersion"], "2024-11-05");
        assert!(response.result["capabilities"]["tools"].is_object());
        assert_eq!(response.result["serverInfo"]["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(negotiate_protocol_version("1999-01-01"), LATEST_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn list_tools_alias_returns_registered_tools() {
        let mut harness = Harness::new().await;
        harness
            .send(Message::request(RequestId::Number(1), "listTools", Some(json!({}))))
            .await;
        let Message::Response(response) = harness.next().await else {
            panic!("expected response");
        };
        assert_eq!(response.id, RequestId::Number(1));
        assert_eq!(response.result["tools"][0]["name"], "echo");
        assert_eq!(response.result["tools"].as_array().map(Vec::len), Some(5));
    }

    #[tokio::test]
    async fn concurrent_requests_get_exactly_one_terminal_message_each() {
        let mut harness = Harness::new().await;
        for id in 1..=25 {
            harness.send(call(id, "echo", json!({}))).await;
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 1..=25 {
            let message = harness.next().await;
            assert!(message.is_terminal());
            let id = message.id().cloned().expect("id");
            assert!(seen.insert(id), "duplicate response");
        }
        harness.settle().await;
        assert!(harness.rx.try_recv().is_err());
        assert_eq!(harness.dispatcher.in_flight_count(None), 0);
    }

    #[tokio::test]
    async fn cancelled_request_never_gets_a_response() {
        let mut harness = Harness::new().await;
        harness.send(call(7, "gated", json!({}))).await;
        harness.settle().await;
        assert!(harness.dispatcher.is_in_flight("test", &RequestId::Number(7)));

        harness
            .send(Message::notification(
                NOTIFY_CANCELLED,
                Some(json!({"requestId": 7, "reason": "user aborted"})),
            ))
            .await;
        assert!(!harness.dispatcher.is_in_flight("test", &RequestId::Number(7)));
        assert_eq!(*harness.sink.abandoned.lock(), vec![RequestId::Number(7)]);

        // The handler ignores the signal and completes; its result is dropped.
        harness.gate.notify_one();
        harness.settle().await;
        assert_eq!(harness.finished.load(Ordering::SeqCst), 1);
        assert!(harness.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancellation_reaches_cooperative_handlers() {
        let mut harness = Harness::new().await;
        harness.send(call(3, "wait_for_cancel", json!({}))).await;
        harness.settle().await;

        assert!(harness.dispatcher.cancel("test", &RequestId::Number(3), "test"));
        harness.settle().await;
        assert_eq!(harness.finished.load(Ordering::SeqCst), 1);
        assert!(harness.rx.try_recv().is_err());
        assert!(!harness.dispatcher.cancel("test", &RequestId::Number(3), "again"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_behaves_like_cancellation() {
        let mut harness = Harness::new().await;
        harness
            .send(call(5, "wait_for_cancel", json!({"_meta": {"timeoutMs": 50}})))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.settle().await;
        assert!(!harness.dispatcher.is_in_flight("test", &RequestId::Number(5)));
        assert_eq!(harness.finished.load(Ordering::SeqCst), 1);
        assert!(harness.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_arguments_never_invoke_the_handler() {
        let mut harness = Harness::new().await;
        harness
            .send(Message::request(
                RequestId::Number(2),
                TOOLS_CALL,
                Some(json!({"name": "echo", "arguments": {"value": 12}})),
            ))
            .await;
        assert_eq!(error_code(&harness.next().await), -32602);

        harness
            .send(Message::request(
                RequestId::Number(3),
                TOOLS_CALL,
                Some(json!({"name": "echo", "arguments": {}})),
            ))
            .await;
        assert_eq!(error_code(&harness.next().await), -32602);
        assert_eq!(harness.invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found_with_name() {
        let mut harness = Harness::new().await;
        harness.send(call(2, "nope", json!({}))).await;
        let Message::Error(error) = harness.next().await else {
            panic!("expected error");
        };
        assert_eq!(error.error.code, -32601);
        assert_eq!(error.error.data.expect("data")["name"], "nope");
    }

    #[tokio::test]
    async fn call_tool_alias_accepts_args_spelling() {
        let mut harness = Harness::new().await;
        harness
            .send(Message::request(
                RequestId::Number(2),
                "callTool",
                Some(json!({"name": "echo", "args": {"value": "Dune"}})),
            ))
            .await;
        let Message::Response(response) = harness.next().await else {
            panic!("expected response");
        };
        assert_eq!(response.result["content"][0]["text"], "Dune");
    }

    #[tokio::test]
    async fn streaming_handler_emits_progress_before_response() {
        let mut harness = Harness::new().await;
        harness
            .send(call(2, "progress", json!({"_meta": {"progressToken": "tok"}})))
            .await;

        let first = harness.next().await;
        let second = harness.next().await;
        let last = harness.next().await;
        for progress in [&first, &second] {
            let Message::Notification(notification) = progress else {
                panic!("expected progress, got {progress:?}");
            };
            assert_eq!(notification.method, "notifications/progress");
            assert_eq!(notification.params.as_ref().expect("params")["progressToken"], "tok");
        }
        assert!(matches!(last, Message::Response(ref r) if r.id == RequestId::Number(2)));
    }

    #[tokio::test]
    async fn progress_is_silent_without_token() {
        let mut harness = Harness::new().await;
        harness.send(call(2, "progress", json!({}))).await;
        assert!(matches!(harness.next().await, Message::Response(_)));
    }

    #[tokio::test]
    async fn handler_error_carries_tool_context() {
        let mut harness = Harness::new().await;
        harness.send(call(8, "fail", json!({}))).await;
        let Message::Error(error) = harness.next().await else {
            panic!("expected error");
        };
        assert_eq!(error.error.code, -32003);
        let data = error.error.data.expect("data");
        assert_eq!(data["tool"], "fail");
        assert_eq!(data["method"], "tools/call");
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected_without_touching_the_first() {
        let mut harness = Harness::new().await;
        harness.send(call(6, "gated", json!({}))).await;
        harness.send(call(6, "echo", json!({}))).await;
        let Message::Error(rejected) = harness.next().await else {
            panic!("expected the duplicate to be rejected");
        };
        assert_eq!(rejected.error.code, -32600);
        assert_eq!(rejected.error.data.expect("data")["kind"], "InvalidRequest");

        harness.gate.notify_one();
        let Message::Response(response) = harness.next().await else {
            panic!("expected first response");
        };
        assert_eq!(response.id, RequestId::Number(6));
        assert_eq!(response.result["content"][0]["text"], "late");
    }

    #[tokio::test(start_paused = true)]
    async fn drain_cancels_requests_that_outlive_the_grace_period() {
        let mut harness = Harness::new().await;
        harness.send(call(1, "wait_for_cancel", json!({}))).await;
        harness.send(call(2, "echo", json!({}))).await;

        let cancelled = harness.dispatcher.drain(None, Duration::from_secs(1)).await;
        assert_eq!(cancelled, 1);
        assert_eq!(harness.dispatcher.in_flight_count(None), 0);

        let message = harness.next().await;
        assert_eq!(message.id(), Some(&RequestId::Number(2)));
        harness.settle().await;
        assert!(harness.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_with_id_is_answered() {
        let mut harness = Harness::new().await;
        let error = Message::from_value(json!({"id": 11, "method": 5})).expect_err("malformed");
        harness.dispatcher.handle_malformed(&harness.peer, error).await;
        assert_eq!(error_code(&harness.next().await), -32600);

        let error = Message::from_value(json!(["not", "an", "object"])).expect_err("malformed");
        harness.dispatcher.handle_malformed(&harness.peer, error).await;
        harness.settle().await;
        assert!(harness.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_scope_releases_every_entry_of_the_scope() {
        let mut harness = Harness::new().await;
        harness.send(call(1, "wait_for_cancel", json!({}))).await;
        harness.send(call(2, "wait_for_cancel", json!({}))).await;
        assert_eq!(harness.dispatcher.cancel_scope("test"), 2);
        harness.settle().await;
        assert_eq!(harness.finished.load(Ordering::SeqCst), 2);
        assert!(harness.rx.try_recv().is_err());
    }
}
