//! Movie library tools exposed via Model Context Protocol
//!
//! Each tool is an argument struct carrying its schema through
//! `mcp_tool`, plus a [`MovieTool::run`] body. [`CatalogTool`] adapts them to
//! the registry's [`ToolHandler`] seam.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use rust_mcp_sdk::{
    macros,
    schema::{CallToolResult, ContentBlock, TextContent, Tool},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::domain::catalog::{CatalogError, MovieCatalog, MovieUpdate, NewMovie};
use crate::domain::utils::MovieFilter;
use crate::errors::HandlerError;
use crate::mcp::context::ToolContext;
use crate::mcp::registry::ToolHandler;

/// Movies scanned between two progress notifications of `search_movies`.
pub const SEARCH_PROGRESS_CHUNK: usize = 25;

#[async_trait]
pub trait MovieTool: DeserializeOwned + Send + 'static {
    fn definition() -> Tool;

    fn streaming() -> bool {
        false
    }

    async fn run(self, catalog: &dyn MovieCatalog, ctx: &ToolContext) -> Result<Value, CatalogError>;
}

pub struct CatalogTool<T> {
    catalog: Arc<dyn MovieCatalog>,
    tool: PhantomData<fn() -> T>,
}

impl<T> CatalogTool<T> {
    pub fn new(catalog: Arc<dyn MovieCatalog>) -> Self {
        Self {
            catalog,
            tool: PhantomData,
        }
    }
}

#[async_trait]
impl<T: MovieTool> ToolHandler for CatalogTool<T> {
    fn definition(&self) -> Tool {
        T::definition()
    }

    fn streaming(&self) -> bool {
        T::streaming()
    }

    async fn invoke(&self, arguments: Value, ctx: ToolContext) -> Result<CallToolResult, HandlerError> {
        let args: T = serde_json::from_value(arguments)
            .map_err(|err| HandlerError::invalid(format!("invalid arguments: {err}")))?;
        let value = args.run(self.catalog.as_ref(), &ctx).await?;
        Ok(tool_result(value))
    }
}

/// Text content carries the JSON document; objects are also returned as
/// structured content, anything else under `result`.
pub fn tool_result(value: Value) -> CallToolResult {
    let text = value.to_string();
    let structured_content = match value {
        Value::Object(map) => map,
        other => Map::from_iter([("result".to_string(), other)]),
    };
    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(text, None, None))],
        is_error: None,
        meta: None,
        structured_content: Some(structured_content),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, CatalogError> {
    serde_json::to_value(value)
        .map_err(|err| CatalogError::InvalidInput(format!("unserializable record: {err}")))
}

#[macros::mcp_tool(
    name = "add_movie",
    description = "Add a movie to the library and return the created record"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct AddMovieTool {
    pub title: String,
    pub year: i32,
    pub genres: Option<Vec<String>>,
    pub director: Option<String>,
}

#[async_trait]
impl MovieTool for AddMovieTool {
    fn definition() -> Tool {
        Self::tool()
    }

    async fn run(self, catalog: &dyn MovieCatalog, _ctx: &ToolContext) -> Result<Value, CatalogError> {
        let movie = catalog
            .add(NewMovie {
                title: self.title,
                year: self.year,
                genres: self.genres,
                director: self.director,
            })
            .await?;
        to_value(&movie)
    }
}

#[macros::mcp_tool(name = "get_movie", description = "Get a movie by id")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetMovieTool {
    pub movie_id: String,
}

#[async_trait]
impl MovieTool for GetMovieTool {
    fn definition() -> Tool {
        Self::tool()
    }

    async fn run(self, catalog: &dyn MovieCatalog, _ctx: &ToolContext) -> Result<Value, CatalogError> {
        to_value(&catalog.get(&self.movie_id).await?)
    }
}

#[macros::mcp_tool(
    name = "list_movies",
    description = "List movies. Set only_available to exclude borrowed ones"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListMoviesTool {
    pub only_available: Option<bool>,
}

#[async_trait]
impl MovieTool for ListMoviesTool {
    fn definition() -> Tool {
        Self::tool()
    }

    async fn run(self, catalog: &dyn MovieCatalog, _ctx: &ToolContext) -> Result<Value, CatalogError> {
        to_value(&catalog.list(self.only_available.unwrap_or(false)).await?)
    }
}

#[macros::mcp_tool(
    name = "search_movies",
    description = "Search movies by title substring, exact year, genre, director substring and availability"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SearchMoviesTool {
    pub query: Option<String>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    pub director: Option<String>,
    pub only_available: Option<bool>,
}

#[async_trait]
impl MovieTool for SearchMoviesTool {
    fn definition() -> Tool {
        Self::tool()
    }

    fn streaming() -> bool {
        true
    }

    async fn run(self, catalog: &dyn MovieCatalog, ctx: &ToolContext) -> Result<Value, CatalogError> {
        let filter = MovieFilter::new(
            self.query.as_deref(),
            self.year,
            self.genre.as_deref(),
            self.director.as_deref(),
            self.only_available.unwrap_or(false),
        );
        let candidates = catalog.list(filter.only_available).await?;
        let total = candidates.len() as f64;
        ctx.progress
            .report(0.0, Some(total), Some(format!("scanning {total} movies")))
            .await;

        let mut matches = Vec::new();
        let mut scanned = 0;
        for chunk in candidates.chunks(SEARCH_PROGRESS_CHUNK) {
            if ctx.is_cancelled() {
                break;
            }
            matches.extend(chunk.iter().filter(|movie| filter.matches(movie)).cloned());
            scanned += chunk.len();
            ctx.progress.report(scanned as f64, Some(total), None).await;
        }

        to_value(&matches)
    }
}

#[macros::mcp_tool(
    name = "update_movie",
    description = "Update fields on a movie and return the updated record"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct UpdateMovieTool {
    pub movie_id: String,
    pub title: Option<String>,
    pub year: Option<i32>,
    pub genres: Option<Vec<String>>,
    pub director: Option<String>,
}

#[async_trait]
impl MovieTool for UpdateMovieTool {
    fn definition() -> Tool {
        Self::tool()
    }

    async fn run(self, catalog: &dyn MovieCatalog, _ctx: &ToolContext) -> Result<Value, CatalogError> {
        let update = MovieUpdate {
            title: self.title,
            year: self.year,
            genres: self.genres,
            director: self.director,
        };
        to_value(&catalog.update(&self.movie_id, update).await?)
    }
}

#[macros::mcp_tool(name = "delete_movie", description = "Delete a movie by id")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct DeleteMovieTool {
    pub movie_id: String,
}

#[async_trait]
impl MovieTool for DeleteMovieTool {
    fn definition() -> Tool {
        Self::tool()
    }

    async fn run(self, catalog: &dyn MovieCatalog, _ctx: &ToolContext) -> Result<Value, CatalogError> {
        catalog.delete(&self.movie_id).await?;
        Ok(json!({ "deleted": true, "id": self.movie_id }))
    }
}

#[macros::mcp_tool(name = "borrow_movie", description = "Mark a movie as borrowed by someone")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct BorrowMovieTool {
    pub movie_id: String,
    pub borrower: String,
}

#[async_trait]
impl MovieTool for BorrowMovieTool {
    fn definition() -> Tool {
        Self::tool()
    }

    async fn run(self, catalog: &dyn MovieCatalog, _ctx: &ToolContext) -> Result<Value, CatalogError> {
        to_value(&catalog.borrow(&self.movie_id, &self.borrower).await?)
    }
}

#[macros::mcp_tool(
    name = "return_movie",
    description = "Return a borrowed movie and make it available again"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ReturnMovieTool {
    pub movie_id: String,
}

#[async_trait]
impl MovieTool for ReturnMovieTool {
    fn definition() -> Tool {
        Self::tool()
    }

    async fn run(self, catalog: &dyn MovieCatalog, _ctx: &ToolContext) -> Result<Value, CatalogError> {
        to_value(&catalog.return_movie(&self.movie_id).await?)
    }
}
