//! Gmail MCP Vault Library
//!
//! Credential and authorization core of a Gmail MCP server: encrypted
//! per-user token storage, single-flight token refresh, the OAuth
//! authorization-code flow, and two-step confirmation for destructive tools.
//! The MCP stdio server and a slim Gmail client sit on top.

pub mod clock;
pub mod config;
pub mod confirmation;
pub mod credentials;
pub mod error;
pub mod gmail;
pub mod mcp;
pub mod oauth;
pub mod vault;

#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

pub use config::Config;
pub use error::{GmailMcpError, Result};
