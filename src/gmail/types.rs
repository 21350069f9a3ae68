//! Gmail API type definitions
//!
//! Only the fields the tools read are modelled; everything else in the Gmail
//! responses is ignored.

use serde::{Deserialize, Serialize};

/// A Gmail message part, headers only
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    /// MIME type of this part
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// Headers for this part
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,
}

impl MessagePart {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// Header in a message part
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A Gmail message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message ID
    pub id: String,

    /// Thread ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Label IDs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_ids: Vec<String>,

    /// Snippet (preview text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,

    /// Message payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePart>,
}

impl Message {
    fn header(&self, name: &str) -> String {
        self.payload
            .as_ref()
            .and_then(|p| p.header(name))
            .unwrap_or("")
            .to_string()
    }

    /// Flatten into what the tools report
    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            id: self.id.clone(),
            thread_id: self.thread_id.clone().unwrap_or_default(),
            subject: self.header("subject"),
            from: self.header("from"),
            to: self.header("to"),
            date: self.header("date"),
            snippet: self.snippet.clone().unwrap_or_default(),
        }
    }
}

/// List of messages response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageList {
    /// Messages in this page
    #[serde(default)]
    pub messages: Vec<MessageRef>,

    /// Next page token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Reference to a message (id and thread_id only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    pub thread_id: String,
}

/// Headers and snippet of one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: String,
    pub snippet: String,
}

/// A conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,

    #[serde(default)]
    pub messages: Vec<Message>,
}

/// A draft
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

/// List of drafts response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftList {
    #[serde(default)]
    pub drafts: Vec<Draft>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_size_estimate: Option<u32>,
}

/// A Gmail label
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    /// Label ID
    pub id: String,

    /// Label name
    pub name: String,

    /// Label type (system or user)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub label_type: Option<String>,

    /// Total message count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_total: Option<i32>,

    /// Unread message count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_unread: Option<i32>,
}

impl Label {
    /// INBOX, SENT, TRASH and friends cannot be deleted
    pub fn is_system(&self) -> bool {
        self.label_type.as_deref() == Some("system")
    }
}

/// List of labels response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelList {
    #[serde(default)]
    pub labels: Vec<Label>,
}
