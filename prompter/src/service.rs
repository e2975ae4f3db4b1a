//! The [`Prompter`] facade: conversation lifecycle, manual sends and publish.
//!
//! Background work (provisioning, auto-dispatch) lives in
//! [`crate::provisioning`] and [`crate::dispatch`]; both extend `Prompter`.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::core::answers::{QuestionAnswer, assemble_answers};
use crate::core::content::{compose_issue_body, latest_generated_content, publish_titles};
use crate::core::repo_ref::RepoRef;
use crate::core::response::{PendingQuestions, extract_questions};
use crate::core::timeline::{TimelineItem, build_timeline};
use crate::core::types::{
    Conversation, ConversationStatus, ConversationSummary, Message, Revision, Role,
};
use crate::io::assistant::{Assistant, ClaudeCli};
use crate::io::config::PrompterConfig;
use crate::io::git::{GitProvisioner, Provisioner};
use crate::io::github::{GhCli, Issue, IssueTracker};
use crate::io::paths;
use crate::io::store::{JsonStore, Store};
use crate::locks::LockRegistry;
use crate::provisioning::{ProvisioningEntry, ProvisioningStatus, ProvisioningTable, RepoSlot};
use crate::turn::TurnReply;

/// Failures a caller can act on. Anything else is an internal error.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    /// The issue tracker rejected or failed the request.
    #[error("{0}")]
    Upstream(String),
}

/// Side-effecting collaborators, shared across tasks.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub assistant: Arc<dyn Assistant>,
    pub provisioner: Arc<dyn Provisioner>,
    pub issues: Arc<dyn IssueTracker>,
}

impl Collaborators {
    /// Production adapters: JSON store in the data dir, `claude`, `git`, `gh`.
    pub fn from_config(config: &PrompterConfig) -> Result<Self> {
        let store_path = paths::data_dir(config)?.join("store.json");
        let store = JsonStore::open(&store_path)
            .with_context(|| format!("open store {}", store_path.display()))?;
        let cache_dir = paths::cache_dir(config)?;
        info!(
            store = %store_path.display(),
            cache = %cache_dir.display(),
            "using default collaborators"
        );
        Ok(Self {
            store: Arc::new(store),
            assistant: Arc::new(ClaudeCli::new(config.assistant.clone())),
            provisioner: Arc::new(GitProvisioner::new(cache_dir, config.git.clone())),
            issues: Arc::new(GhCli::new(config.issues.clone())),
        })
    }
}

pub(crate) struct Inner {
    pub(crate) config: PrompterConfig,
    pub(crate) collab: Collaborators,
    /// Keyed by CLI session token.
    pub(crate) sessions: LockRegistry<String>,
    /// Keyed by repository URL.
    pub(crate) repos: LockRegistry<String, RepoSlot>,
    pub(crate) provisioning: ProvisioningTable,
}

/// Cheaply cloneable handle to the orchestration core.
#[derive(Clone)]
pub struct Prompter {
    pub(crate) inner: Arc<Inner>,
}

/// Everything needed to render one conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub revisions: Vec<Revision>,
    pub provisioning: ProvisioningEntry,
    pub pending: PendingQuestions,
}

impl ConversationView {
    pub fn timeline(&self) -> Vec<TimelineItem<'_>> {
        build_timeline(&self.messages, &self.revisions)
    }

    pub fn last_message_id(&self) -> Option<i64> {
        self.messages.last().map(|m| m.id)
    }
}

/// Result of a send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    /// The working copy is not ready; the message waits for auto-dispatch.
    Deferred {
        user_message: Message,
        status: ProvisioningStatus,
    },
    Answered {
        user_message: Message,
        reply: TurnReply,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub issue_number: u64,
    pub issue_url: String,
    pub revision: Revision,
}

impl Prompter {
    pub fn new(config: PrompterConfig, collab: Collaborators) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                collab,
                sessions: LockRegistry::new(),
                repos: LockRegistry::new(),
                provisioning: ProvisioningTable::default(),
            }),
        }
    }

    pub fn config(&self) -> &PrompterConfig {
        &self.inner.config
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.inner.collab.store.as_ref()
    }

    /// Load a live (non-deleted) conversation or fail with `NotFound`.
    pub(crate) fn conversation(&self, id: i64) -> Result<Conversation> {
        match self.store().get_conversation(id)? {
            Some(conv) if conv.status != ConversationStatus::Deleted => Ok(conv),
            _ => Err(RequestError::NotFound(format!("conversation {id}")).into()),
        }
    }

    /// Register a conversation for `repo_url` and start provisioning its working copy.
    #[instrument(skip_all, fields(repo_url = %repo_url))]
    pub fn create_conversation(&self, repo_url: &str) -> Result<Conversation> {
        let repo = RepoRef::parse(repo_url.trim())
            .map_err(|e| RequestError::BadRequest(format!("{e:#}")))?;
        let local_path = self.inner.collab.provisioner.local_path(&repo);
        let repository = self
            .store()
            .upsert_repository(&repo.to_string(), &local_path.display().to_string())?;
        let token = Uuid::new_v4().to_string();
        let conversation = self.store().create_conversation(repository.id, &token)?;
        let status = self.start_provisioning(conversation.id, &repo);
        info!(conversation_id = conversation.id, ?status, "conversation created");
        Ok(conversation)
    }

    pub fn list_conversations(&self, repo_url: Option<&str>) -> Result<Vec<ConversationSummary>> {
        self.store().list_conversations(repo_url)
    }

    /// Read-only view; never starts background work.
    pub fn conversation_view(&self, id: i64) -> Result<ConversationView> {
        let conversation = self.conversation(id)?;
        let messages = self.store().list_messages(id)?;
        let revisions = self.store().list_revisions(id)?;
        let provisioning = self.probe_status(&conversation);

        let mut pending = match messages.last() {
            Some(last) if last.role == Role::Assistant => last
                .raw_response
                .as_deref()
                .map(extract_questions)
                .unwrap_or_default(),
            _ => PendingQuestions::default(),
        };
        // Already published as of the latest message.
        if let (Some(last), Some(revision)) = (messages.last(), revisions.last())
            && revision.after_message_id.is_some_and(|anchor| anchor >= last.id)
        {
            pending.prompt_ready = false;
        }

        Ok(ConversationView {
            conversation,
            messages,
            revisions,
            provisioning,
            pending,
        })
    }

    /// Send a user message.
    ///
    /// Deferred while the working copy is cloning, pulling or failed. While an
    /// auto-dispatched turn is running or awaiting delivery the send queues
    /// behind it on the session lock.
    #[instrument(skip_all, fields(conversation_id = id))]
    pub async fn send_message(&self, id: i64, text: &str) -> Result<SendOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RequestError::BadRequest("message must not be empty".to_string()).into());
        }
        let conversation = self.conversation(id)?;
        let entry = self.current_status(&conversation)?;
        if matches!(
            entry.status,
            ProvisioningStatus::Cloning | ProvisioningStatus::Pulling | ProvisioningStatus::Error
        ) {
            let user_message = self
                .store()
                .create_message(id, Role::User, text, None)?;
            info!(status = ?entry.status, "working copy busy, message deferred");
            return Ok(SendOutcome::Deferred {
                user_message,
                status: entry.status,
            });
        }

        let session = self
            .inner
            .sessions
            .acquire(&conversation.session_token)
            .await;
        let resume = self.store().last_message(id)?.is_some();
        let user_message = self
            .store()
            .create_message(id, Role::User, text, None)?;
        let reply = self
            .complete_turn(session, &conversation, text, resume)
            .await?;
        Ok(SendOutcome::Answered {
            user_message,
            reply,
        })
    }

    /// Send structured answers to the pending questions as one message.
    pub async fn send_answers(&self, id: i64, answers: &[QuestionAnswer]) -> Result<SendOutcome> {
        let text = assemble_answers(answers)
            .ok_or_else(|| RequestError::BadRequest("no answer selected".to_string()))?;
        self.send_message(id, &text).await
    }

    /// Publish the latest generated prompt as an issue (or update the existing one).
    ///
    /// Runs under the session lock, so concurrent publishes of a conversation
    /// create at most one issue.
    #[instrument(skip_all, fields(conversation_id = id))]
    pub async fn publish(&self, id: i64) -> Result<PublishOutcome> {
        let token = self.conversation(id)?.session_token;
        let _session = self.inner.sessions.acquire(&token).await;
        let conversation = self.conversation(id)?;
        let messages = self.store().list_messages(id)?;
        let content = latest_generated_content(&messages).ok_or_else(|| {
            RequestError::BadRequest("no generated prompt to publish yet".to_string())
        })?;
        let repo = RepoRef::parse(&conversation.repo_url)?;

        let body = compose_issue_body(&content);
        let (issue_title, title) = publish_titles(&conversation.title, &content.title);
        if !content.title.is_empty() && title != conversation.title {
            self.store().update_title(id, &title)?;
        }

        let issues = self.inner.collab.issues.clone();
        let existing = conversation
            .issue_number
            .map(|number| (number, conversation.issue_url.clone().unwrap_or_default()));
        let issue_body = body.clone();
        let issue = tokio::task::spawn_blocking(move || match existing {
            Some((number, url)) => issues
                .edit_issue(&repo, number, &issue_body)
                .map(|()| Issue { number, url }),
            None => issues.create_issue(&repo, &issue_title, &issue_body),
        })
        .await
        .context("issue tracker task panicked")?
        .map_err(|e| RequestError::Upstream(format!("{e:#}")))?;

        if conversation.issue_number.is_none() {
            self.store().update_issue(id, issue.number, &issue.url)?;
        }
        let anchor = messages.last().map(|m| m.id);
        let revision = self.store().create_revision(id, &body, anchor)?;
        self.store()
            .update_status(id, ConversationStatus::Published)?;
        info!(issue = issue.number, revision = revision.id, "conversation published");

        Ok(PublishOutcome {
            issue_number: issue.number,
            issue_url: issue.url,
            revision,
        })
    }

    /// Soft delete: hidden from listings, kept in storage.
    pub fn delete_conversation(&self, id: i64) -> Result<()> {
        self.conversation(id)?;
        self.store()
            .update_status(id, ConversationStatus::Deleted)?;
        self.inner.provisioning.remove(id);
        info!(conversation_id = id, "conversation deleted");
        Ok(())
    }
}
