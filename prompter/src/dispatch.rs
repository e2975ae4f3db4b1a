//! Poll-driven auto-dispatch of messages sent before the working copy was ready.
//!
//! The first poll that sees `ready` with a trailing user message wins a
//! `ready -> processing` compare-and-swap and spawns the worker; every other
//! poller just reports `processing`. The worker leaves `responded`, and the
//! poll that removes that entry delivers the reply. Later polls rebuild their
//! answer from storage.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, instrument};

use crate::core::types::{Conversation, Role};
use crate::provisioning::{ProvisioningEntry, ProvisioningStatus};
use crate::service::Prompter;
use crate::turn::TurnReply;

/// Answer to one status poll.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: ProvisioningStatus,
    pub error: Option<String>,
    /// The auto-dispatched reply, present on exactly one poll.
    pub delivered: Option<TurnReply>,
    /// The only backpressure signal: stop polling when false.
    pub keep_polling: bool,
    /// Newest stored message; a client behind it should reload the conversation.
    pub last_message_id: Option<i64>,
}

impl StatusReport {
    fn from_entry(entry: ProvisioningEntry, last_message_id: Option<i64>) -> Self {
        Self {
            keep_polling: entry.status.keep_polling(),
            status: entry.status,
            error: entry.error,
            delivered: None,
            last_message_id,
        }
    }
}

impl Prompter {
    /// Report provisioning status, dispatching a pending user message once ready.
    #[instrument(skip_all, fields(conversation_id = id))]
    pub async fn poll_status(&self, id: i64) -> Result<StatusReport> {
        let conversation = self.conversation(id)?;
        let entry = self.current_status(&conversation)?;
        let last = self.store().last_message(id)?;
        let last_message_id = last.as_ref().map(|m| m.id);
        let table = &self.inner.provisioning;

        match entry.status {
            ProvisioningStatus::Ready if last.as_ref().is_some_and(|m| m.role == Role::User) => {
                let processing = ProvisioningEntry::new(ProvisioningStatus::Processing);
                if table.compare_and_swap(id, ProvisioningStatus::Ready, processing.clone()) {
                    info!("dispatching pending user message");
                    let this = self.clone();
                    tokio::spawn(async move { this.dispatch_pending(conversation).await });
                    return Ok(StatusReport::from_entry(processing, last_message_id));
                }
                let current = table.get(id).unwrap_or(processing);
                Ok(StatusReport::from_entry(current, last_message_id))
            }
            ProvisioningStatus::Responded => {
                if !table.remove_if(id, ProvisioningStatus::Responded) {
                    // Another poller delivered it first.
                    let current = self.current_status(&conversation)?;
                    return Ok(StatusReport::from_entry(current, last_message_id));
                }
                let delivered = match entry.reply_id {
                    Some(reply_id) => self.store().get_message(reply_id)?,
                    None => None,
                }
                .map(TurnReply::from_message);
                // A manual send may already be waiting for its own turn.
                let last = self.store().last_message(id)?;
                let unanswered = last.as_ref().is_some_and(|m| m.role == Role::User);
                debug!(delivered = delivered.is_some(), unanswered, "responded state consumed");
                Ok(StatusReport {
                    status: ProvisioningStatus::Ready,
                    error: None,
                    delivered,
                    keep_polling: unanswered,
                    last_message_id: last.map(|m| m.id),
                })
            }
            _ => Ok(StatusReport::from_entry(entry, last_message_id)),
        }
    }

    #[instrument(skip_all, fields(conversation_id = conversation.id))]
    async fn dispatch_pending(&self, conversation: Conversation) {
        let next = match self.answer_pending(&conversation).await {
            Ok(Some(reply_id)) => ProvisioningEntry::responded(reply_id),
            Ok(None) => ProvisioningEntry::new(ProvisioningStatus::Ready),
            Err(err) => {
                error!(err = %format!("{err:#}"), "auto-dispatch failed");
                ProvisioningEntry::failed(format!("failed to store reply: {err}"))
            }
        };
        self.inner.provisioning.transition(
            conversation.id,
            &[ProvisioningStatus::Processing],
            next,
        );
    }

    /// Answer the trailing user message; `None` when it was answered meanwhile.
    async fn answer_pending(&self, conversation: &Conversation) -> Result<Option<i64>> {
        let session = self
            .inner
            .sessions
            .acquire(&conversation.session_token)
            .await;
        let messages = self.store().list_messages(conversation.id)?;
        let Some((pending, earlier)) = messages.split_last() else {
            return Ok(None);
        };
        if pending.role != Role::User {
            debug!("pending message already answered");
            return Ok(None);
        }
        let resume = earlier.iter().any(|m| m.role == Role::Assistant);
        let reply = self
            .complete_turn(session, conversation, &pending.content, resume)
            .await?;
        Ok(Some(reply.message.id))
    }
}
