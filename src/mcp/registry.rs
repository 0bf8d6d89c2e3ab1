//! Tool and resource registry
//!
//! Handlers are registered at startup. [`Registry::close`] freezes the table;
//! after that lookups are lock-free and registration fails.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_mcp_sdk::schema::{CallToolResult, ReadResourceResult, Resource, Tool};
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{HandlerError, ProtocolError, RegistryError};
use crate::mcp::context::ToolContext;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> Tool;

    /// Streaming handlers get a live progress emitter.
    fn streaming(&self) -> bool {
        false
    }

    async fn invoke(&self, arguments: Value, ctx: ToolContext) -> Result<CallToolResult, HandlerError>;
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    fn definition(&self) -> Resource;

    async fn read(&self, ctx: ToolContext) -> Result<ReadResourceResult, HandlerError>;
}

pub struct ToolEntry {
    pub name: String,
    pub input_schema: Value,
    pub definition: Tool,
    pub handler: Arc<dyn ToolHandler>,
}

pub struct ResourceEntry {
    pub uri: String,
    pub definition: Resource,
    pub handler: Arc<dyn ResourceHandler>,
}

#[derive(Default)]
struct Entries {
    tools: Vec<Arc<ToolEntry>>,
    tool_index: HashMap<String, usize>,
    resources: Vec<Arc<ResourceEntry>>,
    resource_index: HashMap<String, usize>,
}

impl Entries {
    fn tool(&self, name: &str) -> Option<Arc<ToolEntry>> {
        self.tool_index.get(name).map(|index| Arc::clone(&self.tools[*index]))
    }

    fn resource(&self, uri: &str) -> Option<Arc<ResourceEntry>> {
        self.resource_index
            .get(uri)
            .map(|index| Arc::clone(&self.resources[*index]))
    }
}

pub struct Registry {
    pending: Mutex<Option<Entries>>,
    frozen: OnceLock<Entries>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Some(Entries::default())),
            frozen: OnceLock::new(),
        }
    }

    pub fn register_tool<T: ToolHandler + 'static>(&self, tool: T) -> Result<(), RegistryError> {
        let definition = tool.definition();
        let name = definition.name.clone();
        let input_schema = serde_json::to_value(&definition)
            .ok()
            .and_then(|value| value.get("inputSchema").cloned())
            .unwrap_or_else(|| json!({ "type": "object" }));

        let mut pending = self.pending.lock();
        let Some(entries) = pending.as_mut() else {
            return Err(RegistryError::RegistryClosed(name));
        };
        if entries.tool_index.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }

        debug!(tool = %name, streaming = tool.streaming(), "registering tool");
        entries.tool_index.insert(name.clone(), entries.tools.len());
        entries.tools.push(Arc::new(ToolEntry {
            name,
            input_schema,
            definition,
            handler: Arc::new(tool),
        }));
        Ok(())
    }

    pub fn register_resource<R: ResourceHandler + 'static>(
        &self,
        resource: R,
    ) -> Result<(), RegistryError> {
        let definition = resource.definition();
        let uri = definition.uri.clone();

        let mut pending = self.pending.lock();
        let Some(entries) = pending.as_mut() else {
            return Err(RegistryError::RegistryClosed(uri));
        };
        if entries.resource_index.contains_key(&uri) {
            return Err(RegistryError::DuplicateName(uri));
        }

        debug!(resource = %uri, "registering resource");
        entries.resource_index.insert(uri.clone(), entries.resources.len());
        entries.resources.push(Arc::new(ResourceEntry {
            uri,
            definition,
            handler: Arc::new(resource),
        }));
        Ok(())
    }

    /// Freezes the registry. Idempotent.
    pub fn close(&self) {
        let mut pending = self.pending.lock();
        if let Some(entries) = pending.take() {
            let _ = self.frozen.set(entries);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.frozen.get().is_some()
    }

    fn with_entries<T>(&self, read: impl FnOnce(&Entries) -> T) -> T {
        if let Some(entries) = self.frozen.get() {
            return read(entries);
        }
        let pending = self.pending.lock();
        match pending.as_ref() {
            Some(entries) => read(entries),
            // Closed between the two checks.
            None => read(self.frozen.get().unwrap_or(&Entries::default())),
        }
    }

    pub fn resolve_tool(&self, name: &str) -> Result<Arc<ToolEntry>, ProtocolError> {
        self.with_entries(|entries| entries.tool(name))
            .ok_or_else(|| ProtocolError::MethodNotFound {
                method: "tools/call".to_string(),
                data: Some(json!({ "name": name, "reason": "tool_not_found" })),
            })
    }

    pub fn resolve_resource(&self, uri: &str) -> Result<Arc<ResourceEntry>, ProtocolError> {
        self.with_entries(|entries| entries.resource(uri))
            .ok_or_else(|| ProtocolError::MethodNotFound {
                method: "resources/read".to_string(),
                data: Some(json!({ "uri": uri, "reason": "resource_not_found" })),
            })
    }

    /// Tool definitions in registration order.
    pub fn tools(&self) -> Vec<Tool> {
        self.with_entries(|entries| {
            entries
                .tools
                .iter()
                .map(|entry| entry.definition.clone())
                .collect()
        })
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.with_entries(|entries| {
            entries
                .resources
                .iter()
                .map(|entry| entry.definition.clone())
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.tools.len() + entries.resources.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
