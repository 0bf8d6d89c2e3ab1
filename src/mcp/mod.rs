//! Model Context Protocol (MCP) engine
//!
//! Message model, framing, handler registry and the dispatcher that routes
//! JSON-RPC requests independently of the transport carrying them.

pub mod audit;
pub mod codec;
pub mod context;
pub mod dispatcher;
pub mod message;
pub mod peer;
pub mod registry;
pub mod schema;
