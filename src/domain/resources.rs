//! Model Context Protocol static resource providers
//!
//! Exposes catalog snapshots as file-like resources under `resource://` URIs.

use std::sync::Arc;

use async_trait::async_trait;
use rust_mcp_sdk::schema::{ReadResourceContent, ReadResourceResult, Resource, TextResourceContents};
use serde_json::json;

use crate::domain::catalog::MovieCatalog;
use crate::errors::HandlerError;
use crate::mcp::context::ToolContext;
use crate::mcp::registry::ResourceHandler;

pub const ALL_MOVIES_RESOURCE_URI: &str = "resource://movies/all";
pub const AVAILABLE_MOVIES_RESOURCE_URI: &str = "resource://movies/available";

pub struct MoviesResource {
    catalog: Arc<dyn MovieCatalog>,
    uri: &'static str,
    name: &'static str,
    description: &'static str,
    only_available: bool,
}

impl MoviesResource {
    pub fn all(catalog: Arc<dyn MovieCatalog>) -> Self {
        Self {
            catalog,
            uri: ALL_MOVIES_RESOURCE_URI,
            name: "All Movies",
            description: "Every movie in the library",
            only_available: false,
        }
    }

    pub fn available(catalog: Arc<dyn MovieCatalog>) -> Self {
        Self {
            catalog,
            uri: AVAILABLE_MOVIES_RESOURCE_URI,
            name: "Available Movies",
            description: "Movies that are not currently borrowed",
            only_available: true,
        }
    }
}

#[async_trait]
impl ResourceHandler for MoviesResource {
    fn definition(&self) -> Resource {
        Resource {
            annotations: None,
            description: Some(self.description.to_string()),
            icons: vec![],
            meta: None,
            mime_type: Some("application/json".to_string()),
            name: self.name.to_string(),
            size: None,
            title: None,
            uri: self.uri.to_string(),
        }
    }

    async fn read(&self, _ctx: ToolContext) -> Result<ReadResourceResult, HandlerError> {
        let movies = self.catalog.list(self.only_available).await?;
        let document = json!({ "count": movies.len(), "movies": movies });

        Ok(ReadResourceResult {
            contents: vec![ReadResourceContent::from(TextResourceContents {
                meta: None,
                mime_type: Some("application/json".to_string()),
                text: document.to_string(),
                uri: self.uri.to_string(),
            })],
            meta: None,
        })
    }
}
