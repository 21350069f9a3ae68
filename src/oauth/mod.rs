//! OAuth 2.0 authorization-code flow
//!
//! - [`provider`]: the provider capability the Vault and the flow depend on
//! - [`google`]: Google implementation
//! - [`state`]: single-use anti-forgery states
//! - [`flow`]: `begin_auth` / `handle_callback`
//! - [`callback`]: interactive localhost callback for the CLI

pub mod callback;
pub mod flow;
pub mod google;
pub mod provider;
pub mod state;

pub use flow::{AuthorizationRequest, OAuthFlow};
pub use google::{GoogleOAuthProvider, OAuthKeys};
pub use provider::{OAuthProvider, TokenSet};
pub use state::{AuthState, AuthStateStore};
