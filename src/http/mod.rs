//! Streamable HTTP transport for the Model Context Protocol
//!
//! Provides the external API routing: the `/mcp` endpoint, its session
//! header and the metadata endpoints.

pub mod handlers;
pub mod headers;
