//! Gmail API module
//!
//! Types and a token-per-call client for the Gmail endpoints the tools use.

pub mod client;
pub mod types;

pub use client::GmailClient;
