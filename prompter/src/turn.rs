//! One assistant turn: call the CLI, decode, persist, retitle.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::content::derive_title;
use crate::core::response::{NormalizedQuestion, extract_questions, parse_turn_output};
use crate::core::types::{Conversation, Message, Role};
use crate::io::assistant::{AssistantError, TurnRequest};
use crate::io::process::CancelFlag;
use crate::locks::KeyedGuard;
use crate::service::Prompter;

/// A stored assistant message with the questions it asks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnReply {
    pub message: Message,
    pub questions: Vec<NormalizedQuestion>,
    pub prompt_ready: bool,
}

impl TurnReply {
    pub fn from_message(message: Message) -> Self {
        let pending = message
            .raw_response
            .as_deref()
            .map(extract_questions)
            .unwrap_or_default();
        Self {
            message,
            questions: pending.questions,
            prompt_ready: pending.prompt_ready,
        }
    }
}

impl Prompter {
    /// Run one turn and store the assistant message.
    ///
    /// `session` is the caller's session lock. It travels with the CLI call,
    /// so dropping this future cancels the call but keeps the session locked
    /// until the subprocess has exited. Assistant failures are stored as an
    /// apology so the conversation stays usable; only storage errors are
    /// returned.
    #[instrument(skip_all, fields(conversation_id = conversation.id, resume = resume))]
    pub(crate) async fn complete_turn(
        &self,
        session: KeyedGuard,
        conversation: &Conversation,
        text: &str,
        resume: bool,
    ) -> Result<TurnReply> {
        let request = TurnRequest {
            session_token: conversation.session_token.clone(),
            workdir: PathBuf::from(&conversation.repo_local_path),
            message: text.to_string(),
            resume,
        };
        let assistant = self.inner.collab.assistant.clone();
        let cancel = CancelFlag::new();
        let cancel_guard = cancel.cancel_on_drop();
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = assistant.send(&request, &cancel);
            (outcome, session)
        })
        .await;
        cancel_guard.disarm();
        let (outcome, _session) = match joined {
            Ok((outcome, session)) => (outcome, Some(session)),
            Err(err) => (
                Err(AssistantError::Spawn(anyhow!("assistant task failed: {err}"))),
                None,
            ),
        };

        let store = self.store();
        let message = match outcome {
            Ok(raw) => {
                let parsed = parse_turn_output(&raw);
                if parsed.degraded {
                    warn!("assistant output did not decode, storing raw text");
                }
                let reply = parsed.response;
                let message =
                    store.create_message(conversation.id, Role::Assistant, &reply.message, Some(&raw))?;
                let current_title = store
                    .get_conversation(conversation.id)?
                    .map(|c| c.title)
                    .unwrap_or_default();
                if let Some(title) = derive_title(
                    &current_title,
                    &reply.generated_title,
                    &reply.message,
                    self.config().title_max_chars,
                ) && title != current_title
                {
                    store.update_title(conversation.id, &title)?;
                }
                info!(message_id = message.id, questions = reply.questions.len(), "turn completed");
                message
            }
            Err(err) => {
                warn!(err = %err, "assistant turn failed");
                let apology = format!("Sorry, I encountered an error: {err}");
                store.create_message(conversation.id, Role::Assistant, &apology, None)?
            }
        };
        Ok(TurnReply::from_message(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::store::Store;
    use crate::test_support::Harness;
    use serde_json::json;

    async fn run_turn(h: &Harness, conv: &Conversation, resume: bool) -> TurnReply {
        let session = h.prompter.inner.sessions.acquire(&conv.session_token).await;
        h.prompter
            .complete_turn(session, conv, "hi", resume)
            .await
            .expect("turn")
    }

    #[tokio::test]
    async fn degraded_output_is_stored_verbatim() {
        let h = Harness::new();
        let conv = h.ready_conversation("github.com/acme/widgets").await;
        h.assistant.push_reply("plain text, not json");

        let reply = run_turn(&h, &conv, false).await;
        assert_eq!(reply.message.content, "plain text, not json");
        assert_eq!(reply.message.raw_response.as_deref(), Some("plain text, not json"));
        assert!(reply.questions.is_empty());
    }

    #[tokio::test]
    async fn generated_title_replaces_earlier_title() {
        let h = Harness::new();
        let conv = h.ready_conversation("github.com/acme/widgets").await;
        h.store.update_title(conv.id, "first words").expect("title");
        h.assistant.push_reply(
            json!({"result": json!({"message": "ok", "generated_title": "Dark mode"}).to_string()})
                .to_string(),
        );

        run_turn(&h, &conv, true).await;
        let stored = h.store.get_conversation(conv.id).expect("get").expect("conv");
        assert_eq!(stored.title, "Dark mode");
    }

    #[tokio::test]
    async fn failed_turn_keeps_conversation_usable() {
        let h = Harness::new();
        let conv = h.ready_conversation("github.com/acme/widgets").await;
        h.assistant
            .push_failure(AssistantError::Failed("session is locked".to_string()));

        let reply = run_turn(&h, &conv, false).await;
        assert_eq!(
            reply.message.content,
            "Sorry, I encountered an error: claude error: session is locked"
        );
        let stored = h.store.get_conversation(conv.id).expect("get").expect("conv");
        assert_eq!(stored.title, "", "apologies do not title the conversation");
    }
}
