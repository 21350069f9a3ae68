//! Google OAuth 2.0 provider
//!
//! Handles:
//! - Loading client credentials from the Cloud Console JSON file
//! - Building consent URLs with offline access
//! - Code exchange and refresh against the token endpoint
//! - Resolving the stable Google account id (`sub`)

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::provider::{OAuthProvider, TokenSet};
use crate::error::{AuthError, ProviderError};

/// OpenID Connect userinfo endpoint
const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// OAuth client credentials
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthKeys {
    /// Client ID
    pub client_id: String,

    /// Client secret
    pub client_secret: String,

    /// Auth URI
    pub auth_uri: String,

    /// Token URI
    pub token_uri: String,
}

/// OAuth keys file format (can be "installed" or "web")
#[derive(Debug, Deserialize)]
struct OAuthKeysFile {
    #[serde(alias = "web")]
    installed: Option<OAuthKeys>,
}

impl OAuthKeys {
    /// Load OAuth keys from file
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        if !path.exists() {
            return Err(AuthError::KeysFileNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|_| AuthError::KeysFileNotFound {
            path: path.display().to_string(),
        })?;

        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self, AuthError> {
        let keys_file: OAuthKeysFile =
            serde_json::from_str(content).map_err(|_| AuthError::InvalidKeysFormat)?;

        keys_file.installed.ok_or(AuthError::InvalidKeysFormat)
    }
}

/// Token response from the OAuth token endpoint
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: String,
}

/// Error body of the OAuth token endpoint
#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct UserInfo {
    sub: String,
}

/// Google implementation of [`OAuthProvider`]
#[derive(Debug, Clone)]
pub struct GoogleOAuthProvider {
    /// HTTP client
    http_client: reqwest::Client,

    /// OAuth client credentials
    keys: OAuthKeys,
}

impl GoogleOAuthProvider {
    /// Create a provider whose requests time out after `timeout`
    pub fn new(keys: OAuthKeys, timeout: Duration) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client, keys })
    }

    /// POST a form to the token endpoint
    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenSet, ProviderError> {
        let response = self
            .http_client
            .post(&self.keys.token_uri)
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_token_error(status.as_u16(), &body));
        }

        let token_response: TokenResponse = response.json().await?;

        tracing::debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token endpoint answered"
        );

        Ok(TokenSet {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_in: token_response.expires_in.unwrap_or(3600),
            scopes: token_response
                .scope
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        })
    }
}

impl OAuthProvider for GoogleOAuthProvider {
    fn authorization_url(&self, state: &str, redirect_uri: &str, scopes: &[String]) -> String {
        let scopes = scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}&access_type=offline&prompt=consent&include_granted_scopes=true",
            self.keys.auth_uri,
            urlencoding::encode(&self.keys.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state),
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenSet, ProviderError> {
        let params = [
            ("client_id", self.keys.client_id.as_str()),
            ("client_secret", self.keys.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ];

        self.token_request(&params).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, ProviderError> {
        let params = [
            ("client_id", self.keys.client_id.as_str()),
            ("client_secret", self.keys.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        self.token_request(&params).await
    }

    async fn resolve_user(&self, tokens: &TokenSet) -> Result<String, ProviderError> {
        let response = self
            .http_client
            .get(USERINFO_URL)
            .bearer_auth(&tokens.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                code: "userinfo_failed".to_string(),
            });
        }

        let info: UserInfo = response.json().await?;
        if info.sub.is_empty() {
            return Err(ProviderError::Malformed {
                message: "userinfo response without subject".to_string(),
            });
        }

        Ok(info.sub)
    }
}

/// Reduce a token endpoint failure to its OAuth error code.
///
/// The body is never copied into the error.
fn classify_token_error(status: u16, body: &str) -> ProviderError {
    let code = serde_json::from_str::<TokenErrorResponse>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| "unknown_error".to_string());

    if code == "invalid_grant" {
        ProviderError::InvalidGrant
    } else {
        ProviderError::Rejected { status, code }
    }
}
