//! AI CLI collaborator: one conversation turn per invocation.
//!
//! The [`Assistant`] trait decouples turn orchestration from the actual CLI
//! (`claude -p`). Tests use scripted assistants that return canned output
//! without spawning processes.

use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::config::AssistantConfig;
use crate::io::process::{CancelFlag, run_command_with_deadline};

/// JSON Schema constraining the structured reply.
pub const OUTPUT_SCHEMA: &str = include_str!("../../schemas/assistant_output.schema.json");

pub const SYSTEM_PROMPT: &str = include_str!("../../prompts/system.md");

/// Environment variable the CLI sets for its own children; a nested CLI
/// refuses to start while it is present.
const NESTED_SESSION_ENV: &str = "CLAUDECODE";

/// Parameters for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    /// CLI session token of the conversation.
    pub session_token: String,
    /// Working copy the CLI runs in.
    pub workdir: PathBuf,
    /// User text for this turn.
    pub message: String,
    /// Continue an existing CLI session instead of creating it.
    pub resume: bool,
}

/// Why a turn produced no output. The display text is shown to the user.
#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("AI is taking too long, please try again")]
    TimedOut,
    #[error("the request was cancelled")]
    Cancelled,
    #[error("claude error: {0}")]
    Failed(String),
    #[error("running claude: {0:#}")]
    Spawn(anyhow::Error),
}

/// Abstraction over AI CLI backends.
pub trait Assistant: Send + Sync {
    /// Run one turn and return the CLI's raw stdout.
    fn send(&self, request: &TurnRequest, cancel: &CancelFlag) -> Result<String, AssistantError>;
}

/// Assistant that spawns the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    config: AssistantConfig,
}

impl ClaudeCli {
    pub fn new(config: AssistantConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &TurnRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(claude_args(&self.config, request))
            .current_dir(&request.workdir)
            .env_remove(NESTED_SESSION_ENV);
        cmd
    }
}

impl Assistant for ClaudeCli {
    #[instrument(skip_all, fields(session = %request.session_token, resume = request.resume))]
    fn send(&self, request: &TurnRequest, cancel: &CancelFlag) -> Result<String, AssistantError> {
        info!(workdir = %request.workdir.display(), "starting claude turn");

        let output = run_command_with_deadline(
            self.command(request),
            self.config.timeout(),
            self.config.terminate_grace(),
            self.config.output_limit_bytes,
            cancel,
        )
        .map_err(AssistantError::Spawn)?;

        if output.timed_out() {
            warn!(timeout_secs = self.config.timeout_secs, "claude timed out");
            return Err(AssistantError::TimedOut);
        }
        if output.cancelled() {
            return Err(AssistantError::Cancelled);
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "claude failed");
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AssistantError::Failed(format!(
                "{}{}",
                stderr.trim(),
                output.stderr_truncated_notice("claude")
            )));
        }

        debug!(bytes = output.stdout.len(), "claude turn completed");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn claude_args(config: &AssistantConfig, request: &TurnRequest) -> Vec<String> {
    let session_flag = if request.resume {
        "--resume"
    } else {
        "--session-id"
    };
    vec![
        "-p".to_string(),
        session_flag.to_string(),
        request.session_token.clone(),
        "--output-format".to_string(),
        "json".to_string(),
        "--json-schema".to_string(),
        OUTPUT_SCHEMA.to_string(),
        "--system-prompt".to_string(),
        SYSTEM_PROMPT.to_string(),
        "--allowedTools".to_string(),
        config.allowed_tools.clone(),
        "--permission-mode".to_string(),
        config.permission_mode.clone(),
        request.message.clone(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonschema::Draft;
    use serde_json::{Value, json};

    fn request(resume: bool) -> TurnRequest {
        TurnRequest {
            session_token: "tok-1".to_string(),
            workdir: PathBuf::from("/tmp"),
            message: "add dark mode".to_string(),
            resume,
        }
    }

    #[test]
    fn first_turn_creates_session_and_later_turns_resume() {
        let cfg = AssistantConfig::default();
        let first = claude_args(&cfg, &request(false));
        assert_eq!(&first[..3], ["-p", "--session-id", "tok-1"]);
        assert_eq!(first.last().map(String::as_str), Some("add dark mode"));

        let later = claude_args(&cfg, &request(true));
        assert_eq!(&later[..3], ["-p", "--resume", "tok-1"]);
        assert!(later.windows(2).any(|w| w == ["--allowedTools", "Read,Glob,Grep"]));
    }

    #[test]
    fn nested_session_marker_is_removed_from_env() {
        let cli = ClaudeCli::new(AssistantConfig::default());
        let cmd = cli.command(&request(false));
        let removed = cmd
            .get_envs()
            .any(|(key, value)| key == NESTED_SESSION_ENV && value.is_none());
        assert!(removed);
    }

    fn compiled_schema() -> jsonschema::Validator {
        let schema: Value = serde_json::from_str(OUTPUT_SCHEMA).expect("schema json");
        jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .expect("compile schema")
    }

    #[test]
    fn bundled_schema_accepts_question_replies_and_requires_message() {
        let validator = compiled_schema();
        let reply = json!({
            "message": "A question first.",
            "questions": [{
                "header": "Scope",
                "text": "Which pages?",
                "multi_select": false,
                "options": [{"label": "All", "description": "every page"}]
            }],
            "prompt_ready": false
        });
        assert!(validator.is_valid(&reply));
        assert!(!validator.is_valid(&json!({"prompt_ready": true})));
    }

    #[cfg(unix)]
    mod fake_cli {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        fn write_script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-claude");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
            let mut perms = fs::metadata(&path).expect("metadata").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).expect("chmod");
            path
        }

        fn cli(script: PathBuf, timeout_secs: u64) -> ClaudeCli {
            ClaudeCli::new(AssistantConfig {
                command: script.display().to_string(),
                timeout_secs,
                terminate_grace_secs: 1,
                ..AssistantConfig::default()
            })
        }

        fn request_in(dir: &Path) -> TurnRequest {
            TurnRequest {
                workdir: dir.to_path_buf(),
                ..request(false)
            }
        }

        #[test]
        fn returns_stdout_of_successful_run() {
            let temp = tempfile::tempdir().expect("tempdir");
            let script = write_script(
                temp.path(),
                r#"echo '{"type":"result","structured_output":{"message":"hi"}}'"#,
            );
            let raw = cli(script, 5)
                .send(&request_in(temp.path()), &CancelFlag::new())
                .expect("send");
            assert!(raw.contains(r#""message":"hi""#));
        }

        #[test]
        fn non_zero_exit_reports_stderr() {
            let temp = tempfile::tempdir().expect("tempdir");
            let script = write_script(temp.path(), "echo 'session locked' >&2; exit 3");
            let err = cli(script, 5)
                .send(&request_in(temp.path()), &CancelFlag::new())
                .unwrap_err();
            assert!(matches!(err, AssistantError::Failed(ref s) if s == "session locked"));
        }

        #[test]
        fn slow_run_times_out() {
            let temp = tempfile::tempdir().expect("tempdir");
            let script = write_script(temp.path(), "exec sleep 10");
            let err = cli(script, 1)
                .send(&request_in(temp.path()), &CancelFlag::new())
                .unwrap_err();
            assert!(matches!(err, AssistantError::TimedOut));
            assert_eq!(err.to_string(), "AI is taking too long, please try again");
        }
    }
}
