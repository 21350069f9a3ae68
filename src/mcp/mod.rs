//! MCP (Model Context Protocol) module
//!
//! Implements the MCP server protocol for tool invocation.

pub mod server;
pub mod tools;
pub mod types;

pub use server::McpServer;
pub use tools::ToolHandler;
