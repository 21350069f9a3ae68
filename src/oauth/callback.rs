//! Interactive authorization with a local callback server.
//!
//! Binds `127.0.0.1:<port>`, opens the consent page in the browser and waits
//! for Google to redirect back with `code` and `state`.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{extract::Query, response::Html, routing::get, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use super::flow::OAuthFlow;
use super::provider::OAuthProvider;
use crate::config::Config;
use crate::error::{AuthError, GmailMcpError, Result};

/// Query parameters of the provider redirect
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackQuery {
    /// A request that carries none of the redirect parameters, such as a
    /// browser prefetch
    fn is_empty(&self) -> bool {
        self.code.is_none() && self.state.is_none() && self.error.is_none()
    }
}

/// Run the whole browser flow and return the authorized user id
pub async fn authorize_interactive<P: OAuthProvider>(flow: &OAuthFlow<P>, config: &Config) -> Result<String> {
    // Bound before the URL is shown so the redirect cannot beat the listener.
    let addr = SocketAddr::from(([127, 0, 0, 1], config.oauth_callback_port));
    let listener = TcpListener::bind(addr).await?;

    let request = flow.begin_auth(&config.oauth_callback_url, &config.scopes);

    eprintln!("\nPlease visit this URL to authenticate:");
    eprintln!("{}\n", request.url);

    if let Err(e) = open::that(&request.url) {
        eprintln!("Could not open browser automatically: {}", e);
        eprintln!("Please open the URL manually.");
    }

    eprintln!(
        "Waiting for authentication callback on port {}...",
        config.oauth_callback_port
    );

    let query = wait_for_callback(listener, config.auth_state_ttl).await?;

    eprintln!("Received authorization code, exchanging for tokens...");
    Ok(complete(flow, query).await?)
}

/// Serve `/oauth2callback` on `listener` until the first redirect arrives.
///
/// Gives up after `deadline`, by which time the state has expired anyway.
pub async fn wait_for_callback(listener: TcpListener, deadline: Duration) -> Result<CallbackQuery> {
    let (tx, rx) = oneshot::channel::<CallbackQuery>();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let callback_handler = move |Query(query): Query<CallbackQuery>| {
        let tx = Arc::clone(&tx);
        async move {
            if query.is_empty() {
                tracing::debug!("Ignoring callback request without OAuth parameters");
                return Html("<html><body><h1>Waiting for authorization</h1></body></html>");
            }

            let page = if query.error.is_some() || query.code.is_none() {
                Html("<html><body><h1>Authentication failed</h1><p>You can close this window and try again.</p></body></html>")
            } else {
                Html("<html><body><h1>Authorization received</h1><p>You can close this window.</p></body></html>")
            };

            if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(query);
            }
            page
        }
    };

    let app = Router::new().route("/oauth2callback", get(callback_handler));
    let server = axum::serve(listener, app).into_future();

    tokio::select! {
        result = server => {
            result?;
            Err(GmailMcpError::Auth(AuthError::StateMismatch))
        }
        received = tokio::time::timeout(deadline, rx) => match received {
            Ok(Ok(query)) => Ok(query),
            Ok(Err(_)) | Err(_) => {
                tracing::warn!("No OAuth callback received before the state expired");
                Err(GmailMcpError::Auth(AuthError::StateMismatch))
            }
        }
    }
}

/// Turn a redirect into a finished flow
pub async fn complete<P: OAuthProvider>(
    flow: &OAuthFlow<P>,
    query: CallbackQuery,
) -> std::result::Result<String, AuthError> {
    if let Some(error) = query.error {
        // The state is still burned so the URL cannot be reused.
        if let Some(state) = query.state.as_deref() {
            flow.states().consume(state);
        }
        return Err(AuthError::CodeExchangeFailed {
            message: format!("authorization denied by provider: {}", error),
        });
    }

    let state = query.state.ok_or(AuthError::StateMismatch)?;
    let Some(code) = query.code else {
        flow.states().consume(&state);
        return Err(AuthError::CodeExchangeFailed {
            message: "no authorization code received".to_string(),
        });
    };

    flow.handle_callback(&state, &code).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::credentials::{MemoryCredentialStore, TokenCipher};
    use crate::mocks::MockOAuthProvider;
    use crate::oauth::AuthStateStore;
    use crate::vault::{CredentialVault, VaultOptions};

    fn flow() -> OAuthFlow<MockOAuthProvider> {
        let vault = CredentialVault::new(
            Arc::new(MemoryCredentialStore::new()),
            TokenCipher::from_bytes(&[7u8; 32]).unwrap(),
            Arc::new(MockOAuthProvider::new("user-1")),
            Arc::new(SystemClock),
            VaultOptions::default(),
        );
        let states = AuthStateStore::new(chrono::Duration::minutes(10), Arc::new(SystemClock));
        OAuthFlow::new(vault, states, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_callback_server_receives_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let waiter = tokio::spawn(wait_for_callback(listener, Duration::from_secs(5)));

        let url = format!("http://{}/oauth2callback?code=4%2Fabc&state=xyz", addr);
        let page = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert!(page.contains("Authorization received"));

        let query = waiter.await.unwrap().unwrap();
        assert_eq!(query.code.as_deref(), Some("4/abc"));
        assert_eq!(query.state.as_deref(), Some("xyz"));
        assert!(query.error.is_none());
    }

    #[tokio::test]
    async fn test_callback_server_ignores_stray_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let waiter = tokio::spawn(wait_for_callback(listener, Duration::from_secs(5)));

        let stray = format!("http://{}/oauth2callback", addr);
        let page = reqwest::get(&stray).await.unwrap().text().await.unwrap();
        assert!(page.contains("Waiting for authorization"));
        assert!(!waiter.is_finished());

        let url = format!("http://{}/oauth2callback?code=abc&state=xyz", addr);
        reqwest::get(&url).await.unwrap();

        let query = waiter.await.unwrap().unwrap();
        assert_eq!(query.code.as_deref(), Some("abc"));
        assert_eq!(query.state.as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn test_callback_server_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let err = wait_for_callback(listener, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, GmailMcpError::Auth(AuthError::StateMismatch)));
    }

    #[tokio::test]
    async fn test_complete_success() {
        let flow = flow();
        let request = flow.begin_auth("http://localhost/cb", &[]);

        let user_id = complete(
            &flow,
            CallbackQuery {
                code: Some("abc".to_string()),
                state: Some(request.state),
                error: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(user_id, "user-1");
    }

    #[tokio::test]
    async fn test_provider_error_burns_state() {
        let flow = flow();
        let request = flow.begin_auth("http://localhost/cb", &[]);

        let err = complete(
            &flow,
            CallbackQuery {
                code: None,
                state: Some(request.state.clone()),
                error: Some("access_denied".to_string()),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("access_denied"));
        assert!(flow.states().is_empty());
    }

    #[tokio::test]
    async fn test_missing_state_is_mismatch() {
        let flow = flow();

        let err = complete(
            &flow,
            CallbackQuery {
                code: Some("abc".to_string()),
                ..CallbackQuery::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, AuthError::StateMismatch);
    }
}
