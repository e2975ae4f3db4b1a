//! Deterministic fixtures and scripted collaborators for tests.
//!
//! Enabled for the crate's own tests and, through the `test-support` feature,
//! for integration tests and the server crate.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use crate::core::repo_ref::RepoRef;
use crate::core::types::{Conversation, Message, Revision, Role};
use crate::io::assistant::{Assistant, AssistantError, TurnRequest};
use crate::io::config::PrompterConfig;
use crate::io::git::Provisioner;
use crate::io::github::{Issue, IssueTracker};
use crate::io::process::CancelFlag;
use crate::io::store::JsonStore;
use crate::provisioning::{ProvisioningEntry, ProvisioningStatus};
use crate::service::{Collaborators, Prompter};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message of conversation 1 with a fixed timestamp.
pub fn message(id: i64, role: Role, content: &str) -> Message {
    Message {
        id,
        conversation_id: 1,
        role,
        content: content.to_string(),
        raw_response: None,
        created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).single().unwrap_or_default(),
    }
}

/// A revision of conversation 1 anchored after `after_message_id`.
pub fn revision(id: i64, after_message_id: Option<i64>) -> Revision {
    Revision {
        id,
        conversation_id: 1,
        content: format!("revision {id}"),
        after_message_id,
        published_at: Utc.timestamp_opt(1_700_100_000 + id, 0).single().unwrap_or_default(),
    }
}

/// CLI envelope carrying a structured reply with only `message` set.
pub fn reply_json(message: &str) -> String {
    json!({"type": "result", "structured_output": {"message": message}}).to_string()
}

/// Assistant returning queued replies, then a default reply.
#[derive(Default)]
pub struct ScriptedAssistant {
    replies: Mutex<VecDeque<Result<String, AssistantError>>>,
    delay: Duration,
    calls: Mutex<Vec<TurnRequest>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedAssistant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every call for `delay` so overlapping calls would be observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_reply(&self, raw: impl Into<String>) {
        lock(&self.replies).push_back(Ok(raw.into()));
    }

    pub fn push_failure(&self, err: AssistantError) {
        lock(&self.replies).push_back(Err(err));
    }

    pub fn calls(&self) -> Vec<TurnRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Highest number of calls that were in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Assistant for ScriptedAssistant {
    fn send(&self, request: &TurnRequest, cancel: &CancelFlag) -> Result<String, AssistantError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        lock(&self.calls).push(request.clone());
        std::thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);

        if cancel.is_cancelled() {
            return Err(AssistantError::Cancelled);
        }
        lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| Ok(reply_json("ok")))
    }
}

/// Provisioner that records calls and marks repositories as cloned.
pub struct FakeProvisioner {
    root: PathBuf,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    provisioned: Mutex<HashSet<String>>,
    failures: Mutex<VecDeque<String>>,
    gate: (Mutex<bool>, Condvar),
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/nonexistent/prompter-cache"),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            provisioned: Mutex::new(HashSet::new()),
            failures: Mutex::new(VecDeque::new()),
            gate: (Mutex::new(true), Condvar::new()),
        }
    }
}

impl FakeProvisioner {
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Fail the next provisioning run with `message`.
    pub fn fail_next(&self, message: &str) {
        lock(&self.failures).push_back(message.to_string());
    }

    /// Block provisioning runs until [`Self::open_gate`].
    pub fn close_gate(&self) {
        *lock(&self.gate.0) = false;
    }

    pub fn open_gate(&self) {
        *lock(&self.gate.0) = true;
        self.gate.1.notify_all();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Provisioner for FakeProvisioner {
    fn local_path(&self, repo: &RepoRef) -> PathBuf {
        repo.local_path(&self.root)
    }

    fn is_provisioned(&self, repo: &RepoRef) -> bool {
        lock(&self.provisioned).contains(&repo.to_string())
    }

    fn provision(&self, repo: &RepoRef) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut open = lock(&self.gate.0);
        while !*open {
            open = self
                .gate
                .1
                .wait(open)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(open);

        let delay = *lock(&self.delay);
        std::thread::sleep(delay);
        if let Some(message) = lock(&self.failures).pop_front() {
            return Err(anyhow!(message));
        }
        lock(&self.provisioned).insert(repo.to_string());
        Ok(())
    }
}

/// An issue creation as the tracker saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIssue {
    pub repo: String,
    pub title: String,
    pub body: String,
}

/// Issue tracker numbering issues from 1.
#[derive(Default)]
pub struct FakeIssueTracker {
    created: Mutex<Vec<CreatedIssue>>,
    edited: Mutex<Vec<u64>>,
    failure: Mutex<Option<String>>,
    next_number: AtomicU64,
}

impl FakeIssueTracker {
    /// Fail every following request with `message`.
    pub fn fail_with(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }

    pub fn created(&self) -> Vec<CreatedIssue> {
        lock(&self.created).clone()
    }

    /// Numbers of edited issues, in call order.
    pub fn edited(&self) -> Vec<u64> {
        lock(&self.edited).clone()
    }

    fn check_failure(&self) -> Result<()> {
        match lock(&self.failure).as_ref() {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

impl IssueTracker for FakeIssueTracker {
    fn create_issue(&self, repo: &RepoRef, title: &str, body: &str) -> Result<Issue> {
        self.check_failure()?;
        let number = self.next_number.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.created).push(CreatedIssue {
            repo: repo.slug(),
            title: title.to_string(),
            body: body.to_string(),
        });
        Ok(Issue {
            number,
            url: format!("https://{repo}/issues/{number}"),
        })
    }

    fn edit_issue(&self, _repo: &RepoRef, number: u64, _body: &str) -> Result<()> {
        self.check_failure()?;
        lock(&self.edited).push(number);
        Ok(())
    }
}

/// A [`Prompter`] wired to scripted collaborators, with handles to each.
pub struct Harness {
    pub prompter: Prompter,
    pub store: Arc<JsonStore>,
    pub assistant: Arc<ScriptedAssistant>,
    pub provisioner: Arc<FakeProvisioner>,
    pub issues: Arc<FakeIssueTracker>,
    _data_dir: Option<TempDir>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_assistant(ScriptedAssistant::new())
    }

    pub fn with_assistant(assistant: ScriptedAssistant) -> Self {
        Self::build(Arc::new(JsonStore::in_memory()), assistant, None)
    }

    /// Harness whose store is a JSON file in a temporary directory.
    pub fn on_disk() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let store = JsonStore::open(dir.path().join("store.json"))?;
        Ok(Self::build(Arc::new(store), ScriptedAssistant::new(), Some(dir)))
    }

    fn build(store: Arc<JsonStore>, assistant: ScriptedAssistant, dir: Option<TempDir>) -> Self {
        let assistant = Arc::new(assistant);
        let provisioner = Arc::new(FakeProvisioner::default());
        let issues = Arc::new(FakeIssueTracker::default());
        let collab = Collaborators {
            store: store.clone(),
            assistant: assistant.clone(),
            provisioner: provisioner.clone(),
            issues: issues.clone(),
        };
        Self {
            prompter: Prompter::new(PrompterConfig::default(), collab),
            store,
            assistant,
            provisioner,
            issues,
            _data_dir: dir,
        }
    }

    /// Wait (up to 5 s) until the recorded entry of `id` has `status`.
    ///
    /// # Panics
    /// When the status is not reached in time.
    pub async fn wait_for_status(&self, id: i64, status: ProvisioningStatus) -> ProvisioningEntry {
        for _ in 0..500 {
            if let Some(entry) = self.prompter.provisioning_entry(id)
                && entry.status == status
            {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "conversation {id} never reached {status:?}; last entry {:?}",
            self.prompter.provisioning_entry(id)
        );
    }

    /// Create a conversation and wait until its working copy is ready.
    pub async fn ready_conversation(&self, repo_url: &str) -> Conversation {
        let conv = match self.prompter.create_conversation(repo_url) {
            Ok(conv) => conv,
            Err(err) => panic!("create conversation: {err:#}"),
        };
        self.wait_for_status(conv.id, ProvisioningStatus::Ready).await;
        conv
    }
}
