//! Decoding of raw AI CLI output into the structured reply schema.
//!
//! `claude -p --output-format json` wraps the structured reply in an envelope:
//! `{"type":"result","structured_output":{...},"result":"..."}`. Depending on
//! the CLI version the payload lives in `structured_output`, in the `result`
//! string, or the raw text is the payload itself. Decoding tries these in
//! order and never fails: undecodable output becomes the message text.
//!
//! The reply schema changed from a single `question` object to a `questions`
//! array without a version marker. Serde ignores unknown fields, so an old
//! payload decodes with the current schema as "no questions". When the primary
//! pass yields no questions, the same raw text is decoded again with a
//! legacy-only schema that knows nothing but the old field.

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};

/// Structured reply produced by the AI CLI (current schema).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AssistantResponse {
    #[serde(deserialize_with = "nullable")]
    pub message: String,
    #[serde(deserialize_with = "nullable")]
    pub questions: Vec<Question>,
    #[serde(deserialize_with = "nullable")]
    pub prompt_ready: bool,
    #[serde(deserialize_with = "nullable")]
    pub generated_title: String,
    #[serde(deserialize_with = "nullable")]
    pub generated_motivation: String,
    #[serde(deserialize_with = "nullable")]
    pub generated_prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Question {
    #[serde(deserialize_with = "nullable")]
    pub header: String,
    #[serde(deserialize_with = "nullable")]
    pub text: String,
    #[serde(alias = "multiSelect", deserialize_with = "nullable")]
    pub multi_select: bool,
    #[serde(deserialize_with = "nullable")]
    pub options: Vec<QuestionOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestionOption {
    #[serde(deserialize_with = "nullable")]
    pub label: String,
    #[serde(deserialize_with = "nullable")]
    pub description: String,
}

/// A question ready for display, numbered by its position in the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedQuestion {
    pub index: usize,
    pub header: String,
    pub text: String,
    pub multi_select: bool,
    pub options: Vec<QuestionOption>,
}

/// Questions awaiting an answer plus the prompt-ready flag of the same reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingQuestions {
    pub questions: Vec<NormalizedQuestion>,
    pub prompt_ready: bool,
}

/// Generated issue content carried by a prompt-ready reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedContent {
    pub title: String,
    pub motivation: String,
    pub prompt: String,
}

/// Result of decoding one turn's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTurn {
    pub response: AssistantResponse,
    /// True when nothing decoded and the raw text became the message.
    pub degraded: bool,
}

#[derive(Deserialize)]
struct Envelope<T> {
    structured_output: Option<T>,
    result: Option<String>,
}

#[derive(Deserialize)]
struct LegacyPayload {
    #[serde(default)]
    question: Option<LegacyQuestion>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LegacyQuestion {
    #[serde(deserialize_with = "nullable")]
    text: String,
    #[serde(deserialize_with = "nullable")]
    options: Vec<QuestionOption>,
}

/// Decode the structured reply, or `None` if no variant of the output decodes.
pub fn parse_response(raw: &str) -> Option<AssistantResponse> {
    decode_payload::<AssistantResponse>(raw, |resp| !resp.message.is_empty())
}

/// Decode a turn's output, degrading to the envelope's `result` text or,
/// failing that, the raw text as the message.
pub fn parse_turn_output(raw: &str) -> ParsedTurn {
    match parse_response(raw) {
        Some(response) => ParsedTurn {
            response,
            degraded: false,
        },
        None => ParsedTurn {
            response: AssistantResponse {
                message: envelope_result(raw).unwrap_or_else(|| raw.to_string()),
                ..AssistantResponse::default()
            },
            degraded: true,
        },
    }
}

/// The non-empty `result` string of a CLI envelope.
fn envelope_result(raw: &str) -> Option<String> {
    serde_json::from_str::<Envelope<IgnoredAny>>(raw)
        .ok()?
        .result
        .filter(|r| !r.trim().is_empty())
}

/// Extract the pending questions from a stored raw reply.
///
/// Falls back to the legacy single-question schema only when the current
/// schema yields no questions. `prompt_ready` always comes from the current
/// schema.
pub fn extract_questions(raw: &str) -> PendingQuestions {
    let Some(response) = parse_response(raw) else {
        return PendingQuestions::default();
    };
    let questions = if response.questions.is_empty() {
        extract_legacy_question(raw).into_iter().collect()
    } else {
        normalize_questions(&response.questions)
    };
    PendingQuestions {
        questions,
        prompt_ready: response.prompt_ready,
    }
}

pub fn normalize_questions(questions: &[Question]) -> Vec<NormalizedQuestion> {
    questions
        .iter()
        .enumerate()
        .map(|(index, q)| NormalizedQuestion {
            index,
            header: q.header.clone(),
            text: q.text.clone(),
            multi_select: q.multi_select,
            options: q.options.clone(),
        })
        .collect()
}

/// Extract generated issue content; `None` unless `generated_prompt` is set.
pub fn extract_generated_content(raw: &str) -> Option<GeneratedContent> {
    let response = decode_payload::<AssistantResponse>(raw, |resp| {
        !resp.message.is_empty() || !resp.generated_prompt.is_empty()
    })?;
    if response.generated_prompt.is_empty() {
        return None;
    }
    Some(GeneratedContent {
        title: response.generated_title,
        motivation: response.generated_motivation,
        prompt: response.generated_prompt,
    })
}

fn extract_legacy_question(raw: &str) -> Option<NormalizedQuestion> {
    let payload = decode_payload::<LegacyPayload>(raw, |p| p.question.is_some())?;
    let question = payload.question?;
    Some(NormalizedQuestion {
        index: 0,
        header: String::new(),
        text: question.text,
        multi_select: false,
        options: question.options,
    })
}

/// Envelope `structured_output`, then envelope `result` string, then direct.
///
/// `accept` gates only the direct decode, where a lenient schema would
/// otherwise accept any JSON object.
fn decode_payload<T: DeserializeOwned>(raw: &str, accept: impl Fn(&T) -> bool) -> Option<T> {
    if let Ok(envelope) = serde_json::from_str::<Envelope<T>>(raw) {
        if let Some(payload) = envelope.structured_output {
            return Some(payload);
        }
        if let Some(result) = envelope.result.filter(|r| !r.trim().is_empty())
            && let Ok(payload) = serde_json::from_str::<T>(&result)
        {
            return Some(payload);
        }
    }
    serde_json::from_str::<T>(raw).ok().filter(|p| accept(p))
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enveloped(payload: serde_json::Value) -> String {
        json!({"type": "result", "subtype": "success", "structured_output": payload, "result": ""})
            .to_string()
    }

    #[test]
    fn uses_structured_output_from_envelope() {
        let raw = enveloped(json!({"message": "Let me look around.", "prompt_ready": false}));
        let resp = parse_response(&raw).expect("decoded");
        assert_eq!(resp.message, "Let me look around.");
        assert!(!resp.prompt_ready);
    }

    /// The `result` string envelope must decode to the same reply as the
    /// `structured_output` envelope.
    #[test]
    fn result_string_envelope_matches_structured_output() {
        let payload = json!({
            "message": "Two things first.",
            "questions": [
                {"header": "Scope", "text": "Which pages?", "multi_select": true,
                 "options": [{"label": "All", "description": "every page"}]}
            ],
            "prompt_ready": false
        });
        let structured = enveloped(payload.clone());
        let stringly = json!({"type": "result", "result": payload.to_string()}).to_string();

        assert_eq!(parse_response(&structured), parse_response(&stringly));
        assert_eq!(extract_questions(&structured), extract_questions(&stringly));
        assert_eq!(extract_questions(&stringly).questions.len(), 1);
    }

    #[test]
    fn decodes_bare_payload_with_message() {
        let raw = json!({"message": "hello", "prompt_ready": true}).to_string();
        let resp = parse_response(&raw).expect("decoded");
        assert_eq!(resp.message, "hello");
        assert!(resp.prompt_ready);
    }

    #[test]
    fn rejects_bare_payload_without_message() {
        let raw = json!({"prompt_ready": true}).to_string();
        assert!(parse_response(&raw).is_none());
    }

    #[test]
    fn malformed_output_degrades_to_raw_text() {
        let raw = "Error: rate limited, try later";
        let parsed = parse_turn_output(raw);
        assert!(parsed.degraded);
        assert_eq!(parsed.response.message, raw);
        assert!(parsed.response.questions.is_empty());
    }

    #[test]
    fn plain_text_result_string_becomes_the_message() {
        let raw = json!({
            "type": "result",
            "result": "Sure, which page?",
            "session_id": "abc",
            "total_cost_usd": 0.1
        })
        .to_string();
        let parsed = parse_turn_output(&raw);
        assert!(parsed.degraded);
        assert_eq!(parsed.response.message, "Sure, which page?");
    }

    #[test]
    fn envelope_without_result_degrades_to_whole_output() {
        let raw = json!({"type": "result", "result": "  ", "session_id": "abc"}).to_string();
        let parsed = parse_turn_output(&raw);
        assert!(parsed.degraded);
        assert_eq!(parsed.response.message, raw);
    }

    #[test]
    fn envelope_without_optional_fields_decodes() {
        let raw = json!({"type": "result", "subtype": "success"}).to_string();
        assert!(parse_response(&raw).is_none());
        let legacy = json!({"result": json!({"question": {"text": "Keep it?"}}).to_string()})
            .to_string();
        assert_eq!(extract_legacy_question(&legacy).map(|q| q.text).as_deref(), Some("Keep it?"));
    }

    #[test]
    fn legacy_question_yields_single_question_at_index_zero() {
        let raw = enveloped(json!({
            "message": "One question.",
            "question": {
                "text": "Should the old page stay?",
                "options": [
                    {"label": "Keep", "description": "leave it"},
                    {"label": "Remove", "description": "drop it"}
                ]
            },
            "prompt_ready": true
        }));

        let pending = extract_questions(&raw);
        assert_eq!(pending.questions.len(), 1);
        let q = &pending.questions[0];
        assert_eq!(q.index, 0);
        assert_eq!(q.text, "Should the old page stay?");
        assert_eq!(q.header, "");
        assert!(!q.multi_select);
        assert_eq!(q.options[1].label, "Remove");
        assert!(pending.prompt_ready, "flag comes from the primary pass");
    }

    #[test]
    fn questions_array_preserves_order_header_and_multi_select() {
        let raw = enveloped(json!({
            "message": "A few questions.",
            "questions": [
                {"header": "Audience", "text": "Who uses it?", "multi_select": false, "options": []},
                {"header": "Platforms", "text": "Where?", "multi_select": true,
                 "options": [{"label": "Web", "description": ""}, {"label": "CLI", "description": ""}]},
                {"header": "Timing", "text": "When?", "multi_select": false, "options": []}
            ]
        }));

        let pending = extract_questions(&raw);
        let headers: Vec<&str> = pending.questions.iter().map(|q| q.header.as_str()).collect();
        assert_eq!(headers, vec!["Audience", "Platforms", "Timing"]);
        let indexes: Vec<usize> = pending.questions.iter().map(|q| q.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(pending.questions[1].multi_select);
        assert!(!pending.questions[2].multi_select);
        assert_eq!(pending.questions[1].options.len(), 2);
    }

    #[test]
    fn empty_questions_array_yields_no_questions() {
        let raw = enveloped(json!({"message": "Done asking.", "questions": []}));
        let pending = extract_questions(&raw);
        assert!(pending.questions.is_empty());
        assert!(!pending.prompt_ready);
    }

    #[test]
    fn undecodable_raw_yields_no_questions() {
        assert_eq!(extract_questions("not json"), PendingQuestions::default());
    }

    #[test]
    fn null_fields_decode_as_defaults() {
        let raw = enveloped(json!({
            "message": "hi",
            "questions": null,
            "generated_title": null,
            "prompt_ready": null
        }));
        let resp = parse_response(&raw).expect("decoded");
        assert!(resp.questions.is_empty());
        assert_eq!(resp.generated_title, "");
        assert!(!resp.prompt_ready);
    }

    #[test]
    fn extracts_generated_content_only_when_prompt_present() {
        let ready = enveloped(json!({
            "message": "Here it is.",
            "prompt_ready": true,
            "generated_title": "Dark mode",
            "generated_motivation": "Eyes hurt at night.",
            "generated_prompt": "Add a dark theme toggle."
        }));
        let content = extract_generated_content(&ready).expect("content");
        assert_eq!(content.title, "Dark mode");
        assert_eq!(content.prompt, "Add a dark theme toggle.");

        let not_ready = enveloped(json!({"message": "Still asking."}));
        assert!(extract_generated_content(&not_ready).is_none());
    }
}
