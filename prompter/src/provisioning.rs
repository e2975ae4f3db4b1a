//! Per-conversation provisioning state and the background clone/update worker.
//!
//! ```text
//! (new)            --not cloned-->       cloning
//! (new)            --already cloned-->   pulling
//! cloning/pulling  --success-->          ready
//! cloning/pulling  --failure-->          error
//! error            --retry-->            cloning|pulling
//! ready            --pending user msg--> processing   (see `dispatch`)
//! processing       --turn done-->        responded
//! responded        --consumed by poll--> (cleared)
//! ```
//!
//! The table is transient. A missing entry is re-derived from the working copy
//! marker: present means `ready`, absent starts a clone.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::repo_ref::RepoRef;
use crate::core::types::Conversation;
use crate::service::Prompter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningStatus {
    Cloning,
    Pulling,
    Ready,
    Processing,
    Responded,
    Error,
}

impl ProvisioningStatus {
    /// Whether a client should keep polling while in this state.
    pub fn keep_polling(self) -> bool {
        matches!(self, Self::Cloning | Self::Pulling | Self::Processing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningEntry {
    pub status: ProvisioningStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Assistant message stored by auto-dispatch, set while `responded`.
    #[serde(skip)]
    pub reply_id: Option<i64>,
}

impl ProvisioningEntry {
    pub fn new(status: ProvisioningStatus) -> Self {
        Self {
            status,
            error: None,
            reply_id: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ProvisioningStatus::Error,
            error: Some(error.into()),
            reply_id: None,
        }
    }

    pub fn responded(reply_id: i64) -> Self {
        Self {
            status: ProvisioningStatus::Responded,
            error: None,
            reply_id: Some(reply_id),
        }
    }
}

/// Conversation id -> provisioning entry. Every mutation is a single
/// check-and-set under the table lock.
#[derive(Debug, Default)]
pub struct ProvisioningTable {
    entries: Mutex<HashMap<i64, ProvisioningEntry>>,
}

impl ProvisioningTable {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ProvisioningEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: i64) -> Option<ProvisioningEntry> {
        self.entries().get(&id).cloned()
    }

    pub fn set(&self, id: i64, entry: ProvisioningEntry) {
        self.entries().insert(id, entry);
    }

    pub fn remove(&self, id: i64) -> Option<ProvisioningEntry> {
        self.entries().remove(&id)
    }

    /// Insert `entry` unless one exists. Returns the existing entry, if any.
    pub fn insert_if_absent(&self, id: i64, entry: ProvisioningEntry) -> Option<ProvisioningEntry> {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(&id) {
            return Some(existing.clone());
        }
        entries.insert(id, entry);
        None
    }

    /// Replace the entry if its status is one of `from`.
    pub fn transition(&self, id: i64, from: &[ProvisioningStatus], to: ProvisioningEntry) -> bool {
        let mut entries = self.entries();
        match entries.get_mut(&id) {
            Some(current) if from.contains(&current.status) => {
                *current = to;
                true
            }
            _ => false,
        }
    }

    pub fn compare_and_swap(
        &self,
        id: i64,
        expected: ProvisioningStatus,
        to: ProvisioningEntry,
    ) -> bool {
        self.transition(id, &[expected], to)
    }

    /// Remove the entry only if its status is `expected`.
    pub fn remove_if(&self, id: i64, expected: ProvisioningStatus) -> bool {
        let mut entries = self.entries();
        if entries.get(&id).is_some_and(|e| e.status == expected) {
            entries.remove(&id);
            return true;
        }
        false
    }

    /// Install `to` when the entry is absent or failed; otherwise return the
    /// current entry unchanged.
    pub fn restart_if_idle(&self, id: i64, to: ProvisioningEntry) -> Result<(), ProvisioningEntry> {
        let mut entries = self.entries();
        match entries.get(&id) {
            Some(current) if current.status != ProvisioningStatus::Error => Err(current.clone()),
            _ => {
                entries.insert(id, to);
                Ok(())
            }
        }
    }
}

/// Guarded by the per-repository lock.
#[derive(Debug, Default)]
pub struct RepoSlot {
    /// When the last successful clone/update of this repository finished.
    last_completed: Option<Instant>,
}

impl Prompter {
    /// Pick `cloning`/`pulling`, record it and spawn the worker.
    pub(crate) fn start_provisioning(&self, id: i64, repo: &RepoRef) -> ProvisioningStatus {
        let status = self.initial_status(repo);
        self.inner.provisioning.set(id, ProvisioningEntry::new(status));
        self.spawn_provisioner(id, repo.clone());
        status
    }

    fn initial_status(&self, repo: &RepoRef) -> ProvisioningStatus {
        if self.inner.collab.provisioner.is_provisioned(repo) {
            ProvisioningStatus::Pulling
        } else {
            ProvisioningStatus::Cloning
        }
    }

    fn spawn_provisioner(&self, id: i64, repo: RepoRef) {
        let requested_at = Instant::now();
        let this = self.clone();
        tokio::spawn(async move { this.provision(id, repo, requested_at).await });
    }

    /// Clone or update under the repository lock, then settle the entry.
    ///
    /// A request made before the last successful run finished is satisfied
    /// by that run.
    #[instrument(skip_all, fields(conversation_id = id, repo = %repo))]
    async fn provision(&self, id: i64, repo: RepoRef, requested_at: Instant) {
        let mut slot = self.inner.repos.acquire(&repo.to_string()).await;
        let outcome = if slot.last_completed.is_some_and(|done| done >= requested_at) {
            debug!("repository refreshed while waiting, skipping");
            Ok(())
        } else {
            let provisioner = self.inner.collab.provisioner.clone();
            let target = repo.clone();
            let result = tokio::task::spawn_blocking(move || provisioner.provision(&target))
                .await
                .context("provisioning task panicked")
                .and_then(|r| r);
            if result.is_ok() {
                slot.last_completed = Some(Instant::now());
            }
            result
        };
        drop(slot);

        let entry = match outcome {
            Ok(()) => {
                info!("working copy ready");
                ProvisioningEntry::new(ProvisioningStatus::Ready)
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "provisioning failed");
                ProvisioningEntry::failed(message)
            }
        };
        let settled = self.inner.provisioning.transition(
            id,
            &[ProvisioningStatus::Cloning, ProvisioningStatus::Pulling],
            entry,
        );
        if !settled {
            debug!("entry changed while provisioning, result dropped");
        }
    }

    /// Current entry, re-deriving it when absent (after a restart).
    pub(crate) fn current_status(&self, conversation: &Conversation) -> Result<ProvisioningEntry> {
        if let Some(entry) = self.inner.provisioning.get(conversation.id) {
            return Ok(entry);
        }
        let repo = RepoRef::parse(&conversation.repo_url)?;
        let derived = if self.inner.collab.provisioner.is_provisioned(&repo) {
            ProvisioningStatus::Ready
        } else {
            ProvisioningStatus::Cloning
        };
        let entry = ProvisioningEntry::new(derived);
        match self
            .inner
            .provisioning
            .insert_if_absent(conversation.id, entry.clone())
        {
            Some(existing) => Ok(existing),
            None => {
                info!(conversation_id = conversation.id, status = ?derived, "recovered provisioning state");
                if derived == ProvisioningStatus::Cloning {
                    self.spawn_provisioner(conversation.id, repo);
                }
                Ok(entry)
            }
        }
    }

    /// Like [`Self::current_status`] but without side effects.
    pub(crate) fn probe_status(&self, conversation: &Conversation) -> ProvisioningEntry {
        if let Some(entry) = self.inner.provisioning.get(conversation.id) {
            return entry;
        }
        let provisioned = RepoRef::parse(&conversation.repo_url)
            .is_ok_and(|repo| self.inner.collab.provisioner.is_provisioned(&repo));
        ProvisioningEntry::new(if provisioned {
            ProvisioningStatus::Ready
        } else {
            ProvisioningStatus::Cloning
        })
    }

    /// Entry as currently recorded, if any.
    pub fn provisioning_entry(&self, id: i64) -> Option<ProvisioningEntry> {
        self.inner.provisioning.get(id)
    }

    /// Restart provisioning after a failure. A no-op reporting the current
    /// state unless the entry is `error` or absent.
    #[instrument(skip_all, fields(conversation_id = id))]
    pub fn retry_provisioning(&self, id: i64) -> Result<ProvisioningEntry> {
        let conversation = self.conversation(id)?;
        let repo = RepoRef::parse(&conversation.repo_url)?;
        let entry = ProvisioningEntry::new(self.initial_status(&repo));
        match self.inner.provisioning.restart_if_idle(id, entry.clone()) {
            Ok(()) => {
                info!(status = ?entry.status, "retrying provisioning");
                self.spawn_provisioner(id, repo);
                Ok(entry)
            }
            Err(current) => {
                debug!(status = ?current.status, "retry ignored");
                Ok(current)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use std::time::Duration;

    use super::ProvisioningStatus::{Cloning, Error, Processing, Pulling, Ready, Responded};

    #[test]
    fn table_transitions_are_conditional() {
        let table = ProvisioningTable::default();
        assert!(!table.compare_and_swap(1, Ready, ProvisioningEntry::new(Processing)));

        table.set(1, ProvisioningEntry::new(Ready));
        assert!(table.compare_and_swap(1, Ready, ProvisioningEntry::new(Processing)));
        assert!(!table.compare_and_swap(1, Ready, ProvisioningEntry::new(Processing)));

        assert!(!table.transition(1, &[Cloning, Pulling], ProvisioningEntry::new(Ready)));
        assert!(table.transition(1, &[Processing], ProvisioningEntry::new(Responded)));

        assert!(!table.remove_if(1, Ready));
        assert!(table.remove_if(1, Responded));
        assert_eq!(table.get(1), None);

        assert_eq!(table.insert_if_absent(2, ProvisioningEntry::new(Ready)), None);
        assert_eq!(
            table.insert_if_absent(2, ProvisioningEntry::new(Cloning)),
            Some(ProvisioningEntry::new(Ready))
        );
    }

    #[test]
    fn restart_only_from_error_or_absent() {
        let table = ProvisioningTable::default();
        assert!(table.restart_if_idle(1, ProvisioningEntry::new(Cloning)).is_ok());
        assert_eq!(
            table.restart_if_idle(1, ProvisioningEntry::new(Pulling)),
            Err(ProvisioningEntry::new(Cloning))
        );
        table.set(1, ProvisioningEntry::failed("boom"));
        assert!(table.restart_if_idle(1, ProvisioningEntry::new(Pulling)).is_ok());
        assert_eq!(table.get(1).map(|e| e.status), Some(Pulling));
    }

    #[test]
    fn only_active_states_keep_polling() {
        for status in [Cloning, Pulling, Processing] {
            assert!(status.keep_polling());
        }
        for status in [Ready, Responded, Error] {
            assert!(!status.keep_polling());
        }
    }

    /// Many conversations on one repository share a single clone.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_for_one_repo_clone_once() {
        let h = Harness::new();
        h.provisioner.set_delay(Duration::from_millis(100));

        let mut ids = Vec::new();
        for _ in 0..8 {
            let conv = h
                .prompter
                .create_conversation("github.com/acme/widgets")
                .expect("create");
            ids.push(conv.id);
        }
        for id in &ids {
            h.wait_for_status(*id, Ready).await;
        }

        assert_eq!(h.provisioner.calls(), 1);
    }

    #[tokio::test]
    async fn failure_is_recorded_and_retry_recovers() {
        let h = Harness::new();
        h.provisioner.fail_next("cloning repository: remote hung up");
        let conv = h
            .prompter
            .create_conversation("github.com/acme/widgets")
            .expect("create");

        let failed = h.wait_for_status(conv.id, Error).await;
        assert_eq!(failed.error.as_deref(), Some("cloning repository: remote hung up"));

        let retried = h.prompter.retry_provisioning(conv.id).expect("retry");
        assert_eq!(retried.status, Cloning);
        h.wait_for_status(conv.id, Ready).await;

        let ignored = h.prompter.retry_provisioning(conv.id).expect("retry");
        assert_eq!(ignored.status, Ready, "retry from ready is a no-op");
        assert_eq!(h.provisioner.calls(), 2);
    }

    #[tokio::test]
    async fn missing_entry_is_recovered_from_marker() {
        let h = Harness::new();
        let conv = h.ready_conversation("github.com/acme/widgets").await;
        h.prompter.inner.provisioning.remove(conv.id);

        assert_eq!(h.prompter.probe_status(&conv).status, Ready);
        assert_eq!(h.prompter.provisioning_entry(conv.id), None, "probe has no side effects");
        assert_eq!(h.prompter.current_status(&conv).expect("status").status, Ready);
        assert_eq!(
            h.prompter.provisioning_entry(conv.id).map(|e| e.status),
            Some(Ready)
        );
    }

    #[tokio::test]
    async fn existing_clone_is_pulled_for_new_conversations() {
        let h = Harness::new();
        h.ready_conversation("github.com/acme/widgets").await;
        let conv = h
            .prompter
            .create_conversation("github.com/acme/widgets")
            .expect("create");
        assert_eq!(
            h.prompter.provisioning_entry(conv.id).map(|e| e.status),
            Some(Pulling)
        );
        h.wait_for_status(conv.id, Ready).await;
    }
}
