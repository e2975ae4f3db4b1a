//! Durable storage for repositories, conversations, messages and revisions.
//!
//! [`JsonStore`] keeps everything in one JSON document. Every mutation is
//! applied to a copy, written to disk (temp file + rename) and only then made
//! visible, so a failed write leaves both the file and memory unchanged.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{
    Conversation, ConversationStatus, ConversationSummary, Message, Repository, Revision, Role,
};

/// Storage operations used by the orchestration layer. Blocking.
pub trait Store: Send + Sync {
    /// Insert the repository or refresh its local path.
    fn upsert_repository(&self, url: &str, local_path: &str) -> Result<Repository>;

    fn create_conversation(&self, repository_id: i64, session_token: &str)
    -> Result<Conversation>;

    fn get_conversation(&self, id: i64) -> Result<Option<Conversation>>;

    /// Non-deleted conversations, most recently updated first.
    fn list_conversations(&self, repo_url: Option<&str>) -> Result<Vec<ConversationSummary>>;

    fn update_title(&self, id: i64, title: &str) -> Result<()>;

    fn update_status(&self, id: i64, status: ConversationStatus) -> Result<()>;

    fn update_issue(&self, id: i64, number: u64, url: &str) -> Result<()>;

    fn create_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        raw_response: Option<&str>,
    ) -> Result<Message>;

    fn get_message(&self, id: i64) -> Result<Option<Message>>;

    fn last_message(&self, conversation_id: i64) -> Result<Option<Message>>;

    /// Messages of a conversation in id order.
    fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>>;

    /// Record a publication. `after_message_id` must name a message of the
    /// same conversation.
    fn create_revision(
        &self,
        conversation_id: i64,
        content: &str,
        after_message_id: Option<i64>,
    ) -> Result<Revision>;

    /// Revisions of a conversation in publish order.
    fn list_revisions(&self, conversation_id: i64) -> Result<Vec<Revision>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationRecord {
    id: i64,
    repository_id: i64,
    title: String,
    status: ConversationStatus,
    session_token: String,
    issue_number: Option<u64>,
    issue_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Sequences {
    repository: i64,
    conversation: i64,
    message: i64,
    revision: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreData {
    sequences: Sequences,
    repositories: Vec<Repository>,
    conversations: Vec<ConversationRecord>,
    messages: Vec<Message>,
    revisions: Vec<Revision>,
}

impl StoreData {
    fn conversation_mut(&mut self, id: i64) -> Result<&mut ConversationRecord> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow!("conversation {id} not found"))
    }

    fn joined(&self, record: &ConversationRecord) -> Result<Conversation> {
        let repo = self
            .repositories
            .iter()
            .find(|r| r.id == record.repository_id)
            .ok_or_else(|| {
                anyhow!(
                    "conversation {} references missing repository {}",
                    record.id,
                    record.repository_id
                )
            })?;
        Ok(Conversation {
            id: record.id,
            repository_id: record.repository_id,
            repo_url: repo.url.clone(),
            repo_local_path: repo.local_path.clone(),
            title: record.title.clone(),
            status: record.status,
            session_token: record.session_token.clone(),
            issue_number: record.issue_number,
            issue_url: record.issue_url.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    fn messages_of(&self, conversation_id: i64) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(move |m| m.conversation_id == conversation_id)
    }
}

/// Single-document JSON store. `path == None` keeps data in memory only.
pub struct JsonStore {
    path: Option<PathBuf>,
    data: Mutex<StoreData>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StoreData::default()),
        }
    }

    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read store {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parse store {}", path.display()))?
        } else {
            StoreData::default()
        };
        debug!(path = %path.display(), "store opened");
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    fn read<T>(&self, f: impl FnOnce(&StoreData) -> Result<T>) -> Result<T> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(&data)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = data.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            write_atomic(path, &next)?;
        }
        *data = next;
        Ok(out)
    }
}

fn write_atomic(path: &Path, data: &StoreData) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("store path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(data)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp store {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace store {}", path.display()))?;
    Ok(())
}

impl Store for JsonStore {
    fn upsert_repository(&self, url: &str, local_path: &str) -> Result<Repository> {
        self.mutate(|data| {
            let now = Utc::now();
            if let Some(repo) = data.repositories.iter_mut().find(|r| r.url == url) {
                repo.local_path = local_path.to_string();
                repo.updated_at = now;
                return Ok(repo.clone());
            }
            let repo = Repository {
                id: next_id(&mut data.sequences.repository),
                url: url.to_string(),
                local_path: local_path.to_string(),
                created_at: now,
                updated_at: now,
            };
            data.repositories.push(repo.clone());
            Ok(repo)
        })
    }

    fn create_conversation(
        &self,
        repository_id: i64,
        session_token: &str,
    ) -> Result<Conversation> {
        self.mutate(|data| {
            let now = Utc::now();
            let record = ConversationRecord {
                id: next_id(&mut data.sequences.conversation),
                repository_id,
                title: String::new(),
                status: ConversationStatus::Draft,
                session_token: session_token.to_string(),
                issue_number: None,
                issue_url: None,
                created_at: now,
                updated_at: now,
            };
            let conversation = data.joined(&record)?;
            data.conversations.push(record);
            Ok(conversation)
        })
    }

    fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        self.read(|data| {
            data.conversations
                .iter()
                .find(|c| c.id == id)
                .map(|record| data.joined(record))
                .transpose()
        })
    }

    fn list_conversations(&self, repo_url: Option<&str>) -> Result<Vec<ConversationSummary>> {
        self.read(|data| {
            let mut summaries = Vec::new();
            for record in &data.conversations {
                if record.status == ConversationStatus::Deleted {
                    continue;
                }
                let conversation = data.joined(record)?;
                if repo_url.is_some_and(|url| url != conversation.repo_url) {
                    continue;
                }
                summaries.push(ConversationSummary {
                    message_count: data.messages_of(record.id).count(),
                    revision_count: data
                        .revisions
                        .iter()
                        .filter(|r| r.conversation_id == record.id)
                        .count(),
                    conversation,
                });
            }
            summaries.sort_by(|a, b| {
                (b.conversation.updated_at, b.conversation.id)
                    .cmp(&(a.conversation.updated_at, a.conversation.id))
            });
            Ok(summaries)
        })
    }

    fn update_title(&self, id: i64, title: &str) -> Result<()> {
        self.mutate(|data| {
            let record = data.conversation_mut(id)?;
            record.title = title.to_string();
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    fn update_status(&self, id: i64, status: ConversationStatus) -> Result<()> {
        self.mutate(|data| {
            let record = data.conversation_mut(id)?;
            record.status = status;
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    fn update_issue(&self, id: i64, number: u64, url: &str) -> Result<()> {
        self.mutate(|data| {
            let record = data.conversation_mut(id)?;
            record.issue_number = Some(number);
            record.issue_url = Some(url.to_string());
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    fn create_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        raw_response: Option<&str>,
    ) -> Result<Message> {
        self.mutate(|data| {
            let now = Utc::now();
            data.conversation_mut(conversation_id)?.updated_at = now;
            let message = Message {
                id: next_id(&mut data.sequences.message),
                conversation_id,
                role,
                content: content.to_string(),
                raw_response: raw_response.map(str::to_string),
                created_at: now,
            };
            data.messages.push(message.clone());
            Ok(message)
        })
    }

    fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.read(|data| Ok(data.messages.iter().find(|m| m.id == id).cloned()))
    }

    fn last_message(&self, conversation_id: i64) -> Result<Option<Message>> {
        self.read(|data| Ok(data.messages_of(conversation_id).max_by_key(|m| m.id).cloned()))
    }

    fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        self.read(|data| {
            let mut messages: Vec<Message> = data.messages_of(conversation_id).cloned().collect();
            messages.sort_by_key(|m| m.id);
            Ok(messages)
        })
    }

    fn create_revision(
        &self,
        conversation_id: i64,
        content: &str,
        after_message_id: Option<i64>,
    ) -> Result<Revision> {
        self.mutate(|data| {
            data.conversation_mut(conversation_id)?;
            if let Some(anchor) = after_message_id
                && !data.messages_of(conversation_id).any(|m| m.id == anchor)
            {
                return Err(anyhow!(
                    "revision anchor {anchor} is not a message of conversation {conversation_id}"
                ));
            }
            let revision = Revision {
                id: next_id(&mut data.sequences.revision),
                conversation_id,
                content: content.to_string(),
                after_message_id,
                published_at: Utc::now(),
            };
            data.revisions.push(revision.clone());
            Ok(revision)
        })
    }

    fn list_revisions(&self, conversation_id: i64) -> Result<Vec<Revision>> {
        self.read(|data| {
            let mut revisions: Vec<Revision> = data
                .revisions
                .iter()
                .filter(|r| r.conversation_id == conversation_id)
                .cloned()
                .collect();
            revisions.sort_by_key(|r| r.id);
            Ok(revisions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(store: &JsonStore, url: &str) -> Conversation {
        let repo = store
            .upsert_repository(url, &format!("/cache/repos/{url}"))
            .expect("repo");
        store.create_conversation(repo.id, "token").expect("conversation")
    }

    #[test]
    fn data_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("data/store.json");
        let conv_id = {
            let store = JsonStore::open(&path).expect("open");
            let conv = conversation(&store, "github.com/a/b");
            store
                .create_message(conv.id, Role::User, "hello", None)
                .expect("message");
            conv.id
        };

        let store = JsonStore::open(&path).expect("reopen");
        let conv = store.get_conversation(conv_id).expect("get").expect("exists");
        assert_eq!(conv.repo_url, "github.com/a/b");
        assert_eq!(conv.status, ConversationStatus::Draft);
        let last = store.last_message(conv_id).expect("last").expect("message");
        assert_eq!(last.content, "hello");

        let next = store
            .create_message(conv_id, Role::Assistant, "hi", Some("{}"))
            .expect("message");
        assert!(next.id > last.id, "ids keep increasing across reopen");
    }

    #[test]
    fn upsert_reuses_repository_by_url() {
        let store = JsonStore::in_memory();
        let first = store.upsert_repository("github.com/a/b", "/x").expect("first");
        let second = store.upsert_repository("github.com/a/b", "/y").expect("second");
        assert_eq!(first.id, second.id);
        assert_eq!(second.local_path, "/y");
    }

    #[test]
    fn revision_anchor_must_belong_to_conversation() {
        let store = JsonStore::in_memory();
        let a = conversation(&store, "github.com/a/a");
        let b = conversation(&store, "github.com/b/b");
        let foreign = store
            .create_message(b.id, Role::User, "other", None)
            .expect("message");

        let err = store
            .create_revision(a.id, "body", Some(foreign.id))
            .unwrap_err();
        assert!(err.to_string().contains("not a message of conversation"));
        assert!(store.list_revisions(a.id).expect("list").is_empty());

        let own = store.create_message(a.id, Role::User, "mine", None).expect("message");
        let rev = store.create_revision(a.id, "body", Some(own.id)).expect("revision");
        assert_eq!(rev.after_message_id, Some(own.id));
        store.create_revision(a.id, "legacy", None).expect("unanchored");
    }

    #[test]
    fn listing_hides_deleted_and_filters_by_repo() {
        let store = JsonStore::in_memory();
        let older = conversation(&store, "github.com/a/a");
        let newer = conversation(&store, "github.com/b/b");
        let deleted = conversation(&store, "github.com/a/a");
        store
            .update_status(deleted.id, ConversationStatus::Deleted)
            .expect("delete");
        store
            .create_message(older.id, Role::User, "bump", None)
            .expect("message");

        let all = store.list_conversations(None).expect("list");
        let ids: Vec<i64> = all.iter().map(|s| s.conversation.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
        assert_eq!(all[0].message_count, 1);
        assert_eq!(all[0].revision_count, 0);

        let filtered = store.list_conversations(Some("github.com/b/b")).expect("list");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].conversation.id, newer.id);
    }

    #[test]
    fn updates_on_missing_conversation_fail() {
        let store = JsonStore::in_memory();
        assert!(store.update_title(99, "x").is_err());
        assert!(store.create_message(99, Role::User, "x", None).is_err());
        assert!(store.get_conversation(99).expect("get").is_none());
    }
}
