//! Gmail API client
//!
//! Thin REST client. It holds no credentials: every call takes the access
//! token the Vault handed out for the current user.

use std::time::Duration;

use crate::config::gmail::{API_BASE_URL, USER_ID};
use crate::error::{GmailApiError, GmailMcpError, Result};
use crate::gmail::types::*;
use crate::vault::AccessToken;

/// Gmail API client
#[derive(Debug, Clone)]
pub struct GmailClient {
    /// HTTP client
    http_client: reqwest::Client,

    /// API root, without the `/users/me` suffix
    base_url: String,
}

impl GmailClient {
    /// Create a client for the public Gmail API
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(API_BASE_URL, timeout)
    }

    /// Create a client against another API root
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn user_url(&self, path: &str) -> String {
        format!("{}/users/{}/{}", self.base_url, USER_ID, path)
    }

    // ==================== Message Operations ====================

    /// Search for messages and fetch their headers
    pub async fn search_messages(
        &self,
        token: &AccessToken,
        query: &str,
        max_results: Option<u32>,
    ) -> Result<Vec<MessageSummary>> {
        let max = max_results.unwrap_or(10);
        let url = format!(
            "{}?q={}&maxResults={}",
            self.user_url("messages"),
            urlencoding::encode(query),
            max
        );

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token.secret())
            .send()
            .await?;
        let message_list: MessageList = check(response, "search messages", || None)
            .await?
            .json()
            .await?;

        let mut results = Vec::new();
        for msg_ref in message_list.messages {
            let url = format!(
                "{}/{}?format=metadata&metadataHeaders=Subject&metadataHeaders=From&metadataHeaders=To&metadataHeaders=Date",
                self.user_url("messages"),
                msg_ref.id
            );

            let response = self
                .http_client
                .get(&url)
                .bearer_auth(token.secret())
                .send()
                .await?;

            if response.status().is_success() {
                let message: Message = response.json().await?;
                results.push(message.summary());
            } else {
                tracing::debug!(
                    message_id = %msg_ref.id,
                    status = %response.status(),
                    "Skipping message whose metadata could not be fetched"
                );
            }
        }

        Ok(results)
    }

    /// Get a whole conversation
    pub async fn get_thread(&self, token: &AccessToken, thread_id: &str) -> Result<Thread> {
        let url = format!(
            "{}/{}?format=metadata",
            self.user_url("threads"),
            urlencoding::encode(thread_id)
        );

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token.secret())
            .send()
            .await?;

        Ok(check(response, "get thread", || {
            Some(GmailApiError::ThreadNotFound {
                thread_id: thread_id.to_string(),
            })
        })
        .await?
        .json()
        .await?)
    }

    // ==================== Draft Operations ====================

    /// List drafts
    pub async fn list_drafts(&self, token: &AccessToken, max_results: Option<u32>) -> Result<DraftList> {
        let url = format!(
            "{}?maxResults={}",
            self.user_url("drafts"),
            max_results.unwrap_or(10)
        );

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token.secret())
            .send()
            .await?;

        Ok(check(response, "list drafts", || None).await?.json().await?)
    }

    /// Permanently delete a draft
    pub async fn delete_draft(&self, token: &AccessToken, draft_id: &str) -> Result<()> {
        let url = format!("{}/{}", self.user_url("drafts"), urlencoding::encode(draft_id));

        let response = self
            .http_client
            .delete(&url)
            .bearer_auth(token.secret())
            .send()
            .await?;

        check(response, "delete draft", || {
            Some(GmailApiError::DraftNotFound {
                draft_id: draft_id.to_string(),
            })
        })
        .await?;

        tracing::info!(draft_id, "Deleted draft");
        Ok(())
    }

    // ==================== Label Operations ====================

    /// List all labels
    pub async fn list_labels(&self, token: &AccessToken) -> Result<LabelList> {
        let response = self
            .http_client
            .get(self.user_url("labels"))
            .bearer_auth(token.secret())
            .send()
            .await?;

        Ok(check(response, "list labels", || None).await?.json().await?)
    }

    /// Get a label by ID
    pub async fn get_label(&self, token: &AccessToken, label_id: &str) -> Result<Label> {
        let url = format!("{}/{}", self.user_url("labels"), urlencoding::encode(label_id));

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token.secret())
            .send()
            .await?;

        Ok(check(response, "get label", || {
            Some(GmailApiError::LabelNotFound {
                label_id: label_id.to_string(),
            })
        })
        .await?
        .json()
        .await?)
    }

    /// Delete a user label. System labels are refused before any delete is sent.
    pub async fn delete_label(&self, token: &AccessToken, label_id: &str) -> Result<()> {
        let label = self.get_label(token, label_id).await?;
        if label.is_system() {
            return Err(GmailMcpError::Gmail(GmailApiError::CannotDeleteSystemLabel {
                label_id: label_id.to_string(),
            }));
        }

        let url = format!("{}/{}", self.user_url("labels"), urlencoding::encode(label_id));
        let response = self
            .http_client
            .delete(&url)
            .bearer_auth(token.secret())
            .send()
            .await?;

        check(response, "delete label", || {
            Some(GmailApiError::LabelNotFound {
                label_id: label_id.to_string(),
            })
        })
        .await?;

        tracing::info!(label_id, "Deleted label");
        Ok(())
    }
}

/// Map a non-success response onto a [`GmailApiError`].
///
/// `not_found` supplies the error for a 404, if the call has one.
async fn check(
    response: reqwest::Response,
    action: &str,
    not_found: impl FnOnce() -> Option<GmailApiError>,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let err = match status.as_u16() {
        401 => GmailApiError::Unauthorized,
        404 => match not_found() {
            Some(err) => err,
            None => GmailApiError::RequestFailed {
                message: format!("Failed to {} (404)", action),
            },
        },
        429 => GmailApiError::RateLimited {
            retry_after_secs: response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        },
        _ => {
            let text = response.text().await.unwrap_or_default();
            GmailApiError::RequestFailed {
                message: format!("Failed to {} ({}): {}", action, status, text),
            }
        }
    };

    tracing::warn!(action, status = status.as_u16(), "Gmail API call failed");
    Err(GmailMcpError::Gmail(err))
}
