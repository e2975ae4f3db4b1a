//! Durable record types shared by the store and the orchestration layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle of a conversation as seen by listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Draft,
    Published,
    /// Soft-deleted; hidden from listings but kept in storage.
    Deleted,
}

/// A remote repository and the location of its local working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    /// Repository identity in `github.com/<owner>/<repo>` form.
    pub url: String,
    pub local_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One conversation with the AI CLI about one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub repository_id: i64,
    /// Joined from the repository record.
    pub repo_url: String,
    /// Joined from the repository record.
    pub repo_local_path: String,
    pub title: String,
    pub status: ConversationStatus,
    /// Stable CLI session token, fixed at creation.
    pub session_token: String,
    pub issue_number: Option<u64>,
    pub issue_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing row: a conversation plus counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub message_count: usize,
    pub revision_count: usize,
}

/// An append-only conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Strictly increasing in creation order.
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    /// Undecoded CLI output, kept so it can be re-parsed later.
    pub raw_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A published snapshot of generated content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: i64,
    pub conversation_id: i64,
    pub content: String,
    /// Last message present at publish time. `None` for legacy revisions.
    pub after_message_id: Option<i64>,
    pub published_at: DateTime<Utc>,
}
