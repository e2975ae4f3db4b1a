//! Conversation titles and published issue content.

use crate::core::response::{GeneratedContent, extract_generated_content};
use crate::core::types::{Message, Role};

/// Title used when neither the reply nor the conversation provides one.
pub const FALLBACK_TITLE: &str = "Prompt Request";

/// Decide the conversation title after a reply.
///
/// A generated title always wins. Otherwise an untitled conversation takes the
/// reply text, truncated to `max_chars` characters plus `...`. Returns `None`
/// when the title should stay as it is.
pub fn derive_title(
    current: &str,
    generated_title: &str,
    reply: &str,
    max_chars: usize,
) -> Option<String> {
    if !generated_title.is_empty() {
        return Some(generated_title.to_string());
    }
    if !current.is_empty() || reply.is_empty() {
        return None;
    }
    Some(truncate_chars(reply, max_chars))
}

/// Issue body: motivation and prompt sections plus a copyable raw prompt.
pub fn compose_issue_body(content: &GeneratedContent) -> String {
    let copy_block = format!(
        "\n\n<details>\n<summary>Copy prompt</summary>\n\n```\n{}\n```\n\n</details>",
        content.prompt
    );
    if content.motivation.is_empty() {
        format!("{}{copy_block}", content.prompt)
    } else {
        format!(
            "## Why\n\n{}\n\n## Prompt\n\n{}{copy_block}",
            content.motivation, content.prompt
        )
    }
}

/// Generated content of the newest assistant message that carries any.
pub fn latest_generated_content(messages: &[Message]) -> Option<GeneratedContent> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .filter_map(|m| m.raw_response.as_deref())
        .find_map(extract_generated_content)
}

/// Title of the published issue, and the title the conversation should take.
pub fn publish_titles(conversation_title: &str, generated_title: &str) -> (String, String) {
    let title = if !generated_title.is_empty() {
        generated_title
    } else if !conversation_title.is_empty() {
        conversation_title
    } else {
        FALLBACK_TITLE
    };
    (format!("Prompt Request: {title}"), title.to_string())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
