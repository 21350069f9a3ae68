//! MCP Tool definitions and handlers
//!
//! Every tool asks the Vault for an access token before touching Gmail.
//! The two delete tools additionally go through the confirmation gate: the
//! first call returns a token instead of deleting, the second call must
//! present it.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::confirmation::{Confirmation, ConfirmationGate, DestructiveAction, DestructiveCall, IssuedConfirmation};
use crate::error::AuthError;
use crate::gmail::GmailClient;
use crate::mcp::types::{CallToolResult, Tool};
use crate::oauth::OAuthProvider;
use crate::vault::{AccessToken, CredentialVault};

/// Tool handler bound to one end user
pub struct ToolHandler<P: OAuthProvider> {
    vault: CredentialVault<P>,
    gate: ConfirmationGate,
    gmail_client: GmailClient,
    user_id: String,
}

impl<P: OAuthProvider> ToolHandler<P> {
    /// Create a tool handler acting for `user_id`
    pub fn new(
        vault: CredentialVault<P>,
        gate: ConfirmationGate,
        gmail_client: GmailClient,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            vault,
            gate,
            gmail_client,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// List all available tools
    pub fn list_tools(&self) -> Vec<Tool> {
        vec![
            tool_def("search_emails", "Searches for emails using Gmail search syntax", search_emails_schema()),
            tool_def("get_thread", "Retrieves every message of a conversation", get_thread_schema()),
            tool_def("list_drafts", "Lists email drafts", list_drafts_schema()),
            tool_def(
                "delete_draft",
                "Permanently deletes a draft. The first call returns a confirmation_token; confirm with the user, then call again with it.",
                delete_draft_schema(),
            ),
            tool_def("list_email_labels", "Retrieves all available Gmail labels", json!({"type": "object", "properties": {}})),
            tool_def(
                "delete_label",
                "Deletes a Gmail label. The first call returns a confirmation_token; confirm with the user, then call again with it.",
                delete_label_schema(),
            ),
        ]
    }

    /// Call a tool by name
    pub async fn call_tool(&self, name: &str, args: Value) -> CallToolResult {
        match name {
            "search_emails" => self.handle_search_emails(args).await,
            "get_thread" => self.handle_get_thread(args).await,
            "list_drafts" => self.handle_list_drafts(args).await,
            "delete_draft" => self.handle_delete_draft(args).await,
            "list_email_labels" => self.handle_list_labels().await,
            "delete_label" => self.handle_delete_label(args).await,
            _ => CallToolResult::error(format!("Unknown tool: {}", name)),
        }
    }

    /// Valid access token for this user, or the tool result explaining why not
    async fn access_token(&self) -> Result<AccessToken, CallToolResult> {
        self.vault
            .get_access_token(&self.user_id)
            .await
            .map_err(|e| auth_failure(&e))
    }

    // ==================== Tool Handlers ====================

    async fn handle_search_emails(&self, args: Value) -> CallToolResult {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            query: String,
            max_results: Option<u32>,
        }

        let args: Args = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return CallToolResult::error(format!("Invalid arguments: {}", e)),
        };
        let token = match self.access_token().await {
            Ok(t) => t,
            Err(result) => return result,
        };

        match self
            .gmail_client
            .search_messages(&token, &args.query, args.max_results)
            .await
        {
            Ok(results) if results.is_empty() => CallToolResult::text("No messages found"),
            Ok(results) => {
                let text = results
                    .iter()
                    .map(|r| {
                        format!(
                            "ID: {}\nThread: {}\nSubject: {}\nFrom: {}\nDate: {}\n",
                            r.id, r.thread_id, r.subject, r.from, r.date
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");

                CallToolResult::text(text)
            }
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }

    async fn handle_get_thread(&self, args: Value) -> CallToolResult {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            #[serde(alias = "thread_id")]
            thread_id: String,
        }

        let args: Args = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return CallToolResult::error(format!("Invalid arguments: {}", e)),
        };
        let token = match self.access_token().await {
            Ok(t) => t,
            Err(result) => return result,
        };

        match self.gmail_client.get_thread(&token, &args.thread_id).await {
            Ok(thread) => {
                let mut text = format!("Thread {} ({} messages)\n\n", thread.id, thread.messages.len());
                for message in &thread.messages {
                    let m = message.summary();
                    text.push_str(&format!(
                        "ID: {}\nFrom: {}\nTo: {}\nDate: {}\nSubject: {}\n{}\n\n",
                        m.id, m.from, m.to, m.date, m.subject, m.snippet
                    ));
                }
                CallToolResult::text(text)
            }
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }

    async fn handle_list_drafts(&self, args: Value) -> CallToolResult {
        #[derive(Deserialize, Default)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            max_results: Option<u32>,
        }

        let args: Args = if args.is_null() {
            Args::default()
        } else {
            match serde_json::from_value(args) {
                Ok(a) => a,
                Err(e) => return CallToolResult::error(format!("Invalid arguments: {}", e)),
            }
        };
        let token = match self.access_token().await {
            Ok(t) => t,
            Err(result) => return result,
        };

        match self.gmail_client.list_drafts(&token, args.max_results).await {
            Ok(list) if list.drafts.is_empty() => CallToolResult::text("No drafts found"),
            Ok(list) => {
                let mut text = format!("Found {} drafts:\n\n", list.drafts.len());
                for draft in &list.drafts {
                    let message_id = draft.message.as_ref().map(|m| m.id.as_str()).unwrap_or("");
                    text.push_str(&format!("ID: {}\nMessage: {}\n\n", draft.id, message_id));
                }
                CallToolResult::text(text)
            }
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }

    async fn handle_delete_draft(&self, args: Value) -> CallToolResult {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            #[serde(alias = "draft_id")]
            draft_id: String,
            #[serde(alias = "confirmation_token")]
            confirmation_token: Option<String>,
        }

        let args: Args = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return CallToolResult::error(format!("Invalid arguments: {}", e)),
        };
        let call = DestructiveCall::new(
            DestructiveAction::DeleteDraft,
            &args.draft_id,
            args.confirmation_token.as_deref(),
        );

        self.run_destructive(call).await
    }

    async fn handle_list_labels(&self) -> CallToolResult {
        let token = match self.access_token().await {
            Ok(t) => t,
            Err(result) => return result,
        };

        match self.gmail_client.list_labels(&token).await {
            Ok(result) => {
                let (system, user): (Vec<_>, Vec<_>) =
                    result.labels.iter().partition(|label| label.is_system());

                let mut text = format!(
                    "Found {} labels ({} system, {} user):\n\n",
                    result.labels.len(),
                    system.len(),
                    user.len()
                );

                text.push_str("System Labels:\n");
                for label in &system {
                    text.push_str(&format!("ID: {}\nName: {}\n\n", label.id, label.name));
                }

                text.push_str("\nUser Labels:\n");
                for label in &user {
                    text.push_str(&format!("ID: {}\nName: {}\n\n", label.id, label.name));
                }

                CallToolResult::text(text)
            }
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }

    async fn handle_delete_label(&self, args: Value) -> CallToolResult {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            #[serde(alias = "label_id", alias = "id")]
            label_id: String,
            #[serde(alias = "confirmation_token")]
            confirmation_token: Option<String>,
        }

        let args: Args = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return CallToolResult::error(format!("Invalid arguments: {}", e)),
        };
        let call = DestructiveCall::new(
            DestructiveAction::DeleteLabel,
            &args.label_id,
            args.confirmation_token.as_deref(),
        );

        self.run_destructive(call).await
    }

    /// Authorize, then either hand out a confirmation token or perform the
    /// confirmed deletion
    async fn run_destructive(&self, call: DestructiveCall) -> CallToolResult {
        let token = match self.access_token().await {
            Ok(t) => t,
            Err(result) => return result,
        };

        match self.gate.check(&self.user_id, &call) {
            Ok(Confirmation::Required(issued)) => CallToolResult::json(&confirmation_payload(&issued)),
            Ok(Confirmation::Proceed) => {
                let target = call.target_id();
                let outcome = match call.action() {
                    DestructiveAction::DeleteDraft => self.gmail_client.delete_draft(&token, target).await,
                    DestructiveAction::DeleteLabel => self.gmail_client.delete_label(&token, target).await,
                };

                match outcome {
                    Ok(()) => CallToolResult::json(&json!({
                        "status": "success",
                        "message": format!("{} {} deleted successfully", capitalize(call.action().target_kind()), target),
                    })),
                    Err(e) => CallToolResult::error(e.to_string()),
                }
            }
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }
}

/// Payload returned instead of deleting on the first call
fn confirmation_payload(issued: &IssuedConfirmation) -> Value {
    json!({
        "message": format!(
            "Confirmation required to delete {} with ID '{}', confirm deletion with user and use the given confirmation_token with the same request parameters.",
            issued.action.target_kind(),
            issued.target_id
        ),
        "confirmation_token": issued.token_id,
        "action": "confirm_deletion",
        "expires_at": issued.expires_at.to_rfc3339(),
    })
}

fn auth_failure(err: &AuthError) -> CallToolResult {
    if err.requires_reauth() {
        CallToolResult::error(format!(
            "{}. Run `gmail-mcp-vault auth` to authorize again.",
            err
        ))
    } else if err.is_retryable() {
        CallToolResult::error(format!("{}. Try again shortly.", err))
    } else {
        CallToolResult::error(err.to_string())
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ==================== Schema Definitions ====================

fn tool_def(name: &str, description: &str, input_schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema,
    }
}

fn search_emails_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "Gmail search query"
            },
            "maxResults": {
                "type": "number",
                "description": "Maximum number of results"
            }
        },
        "required": ["query"]
    })
}

fn get_thread_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "threadId": {
                "type": "string",
                "description": "ID of the conversation"
            }
        },
        "required": ["threadId"]
    })
}

fn list_drafts_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "maxResults": {
                "type": "number",
                "description": "Maximum number of drafts"
            }
        }
    })
}

fn delete_draft_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "draftId": {
                "type": "string",
                "description": "ID of the draft to delete"
            },
            "confirmationToken": {
                "type": "string",
                "description": "Token returned by the first call, after the user confirmed"
            }
        },
        "required": ["draftId"]
    })
}

fn delete_label_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "labelId": {
                "type": "string",
                "description": "ID of the label to delete"
            },
            "confirmationToken": {
                "type": "string",
                "description": "Token returned by the first call, after the user confirmed"
            }
        },
        "required": ["labelId"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_confirmation_payload_shape() {
        let issued = IssuedConfirmation {
            token_id: "tok".to_string(),
            action: DestructiveAction::DeleteLabel,
            target_id: "Label_7".to_string(),
            expires_at: Utc::now(),
        };

        let payload = confirmation_payload(&issued);
        assert_eq!(payload["action"], "confirm_deletion");
        assert_eq!(payload["confirmation_token"], "tok");
        assert!(payload["message"]
            .as_str()
            .unwrap()
            .contains("label with ID 'Label_7'"));
    }

    #[test]
    fn test_auth_failure_messages() {
        let result = auth_failure(&AuthError::reauth(crate::error::ReauthReason::RevokedGrant));
        assert!(result.is_error);
        assert!(result.first_text().contains("gmail-mcp-vault auth"));

        let result = auth_failure(&AuthError::ProviderTimeout { secs: 30 });
        assert!(result.first_text().contains("Try again"));
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("draft"), "Draft");
        assert_eq!(capitalize(""), "");
    }
}
