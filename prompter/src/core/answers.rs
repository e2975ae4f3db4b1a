//! Assembly of structured question answers into one user message.

use serde::Deserialize;

/// Option value meaning "use the free-text answer instead".
pub const OTHER_SENTINEL: &str = "__other__";

/// The user's answer to one displayed question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QuestionAnswer {
    /// Header of the question being answered; may be empty.
    pub header: String,
    /// Selected option labels, possibly including [`OTHER_SENTINEL`].
    pub selected: Vec<String>,
    /// Free text entered for the "other" choice.
    pub other: String,
}

/// Join answers into the text sent to the assistant.
///
/// Questions without any usable selection are skipped. A single answer is
/// sent as-is; several answers are one per line, prefixed with the question
/// header or `Q<n>` (numbered among the answered questions). Returns `None`
/// when nothing was answered.
pub fn assemble_answers(answers: &[QuestionAnswer]) -> Option<String> {
    let mut answered: Vec<(&str, String)> = Vec::new();
    for answer in answers {
        let other = answer.other.trim();
        let parts: Vec<String> = answer
            .selected
            .iter()
            .filter_map(|value| {
                if value == OTHER_SENTINEL {
                    (!other.is_empty()).then(|| format!("Other: {other}"))
                } else if value.is_empty() {
                    None
                } else {
                    Some(value.clone())
                }
            })
            .collect();
        if !parts.is_empty() {
            answered.push((answer.header.as_str(), parts.join(", ")));
        }
    }

    match answered.as_slice() {
        [] => None,
        [(_, only)] => Some(only.clone()),
        many => Some(
            many.iter()
                .enumerate()
                .map(|(i, (header, text))| {
                    if header.is_empty() {
                        format!("Q{}: {text}", i + 1)
                    } else {
                        format!("{header}: {text}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    }
}
