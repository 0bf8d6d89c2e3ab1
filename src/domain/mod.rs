//! Movie library plugins
//!
//! The in-memory catalog and the tools/resources that expose it over MCP.

use std::sync::Arc;

use crate::errors::RegistryError;
use crate::mcp::registry::Registry;

pub mod catalog;
pub mod resources;
pub mod tools;
pub mod utils;

use catalog::MovieCatalog;
use resources::MoviesResource;
use tools::{
    AddMovieTool, BorrowMovieTool, CatalogTool, DeleteMovieTool, GetMovieTool, ListMoviesTool,
    ReturnMovieTool, SearchMoviesTool, UpdateMovieTool,
};

pub const INSTRUCTIONS: &str = "Movie library. Add, look up, search, update and delete movies, \
and track who borrowed them. Catalog snapshots are available as resources.";

pub fn register(registry: &Registry, catalog: Arc<dyn MovieCatalog>) -> Result<(), RegistryError> {
    registry.register_tool(CatalogTool::<AddMovieTool>::new(Arc::clone(&catalog)))?;
    registry.register_tool(CatalogTool::<GetMovieTool>::new(Arc::clone(&catalog)))?;
    registry.register_tool(CatalogTool::<ListMoviesTool>::new(Arc::clone(&catalog)))?;
    registry.register_tool(CatalogTool::<SearchMoviesTool>::new(Arc::clone(&catalog)))?;
    registry.register_tool(CatalogTool::<UpdateMovieTool>::new(Arc::clone(&catalog)))?;
    registry.register_tool(CatalogTool::<DeleteMovieTool>::new(Arc::clone(&catalog)))?;
    registry.register_tool(CatalogTool::<BorrowMovieTool>::new(Arc::clone(&catalog)))?;
    registry.register_tool(CatalogTool::<ReturnMovieTool>::new(Arc::clone(&catalog)))?;

    registry.register_resource(MoviesResource::all(Arc::clone(&catalog)))?;
    registry.register_resource(MoviesResource::available(catalog))?;
    Ok(())
}
