//! Prompter configuration stored in `~/.prompter/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Prompter configuration (TOML).
///
/// Every table is optional; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrompterConfig {
    /// Untitled conversations take the first reply truncated to this many characters.
    pub title_max_chars: usize,

    /// Override for the working-copy cache (default `$XDG_CACHE_HOME/prompter`).
    pub cache_dir: Option<PathBuf>,

    /// Override for the data directory holding the store (default `~/.prompter`).
    pub data_dir: Option<PathBuf>,

    pub assistant: AssistantConfig,
    pub git: GitConfig,
    pub issues: IssueTrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssistantConfig {
    /// AI CLI executable.
    pub command: String,

    /// Deadline for one turn, in seconds.
    pub timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL once the deadline passes.
    pub terminate_grace_secs: u64,

    /// Tools the CLI may use inside the working copy.
    pub allowed_tools: String,

    pub permission_mode: String,

    /// Truncate captured CLI stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub command: String,

    /// Prefix joined with `<repo url>.git` to form the clone URL.
    pub remote_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IssueTrackerConfig {
    pub command: String,
}

impl Default for PrompterConfig {
    fn default() -> Self {
        Self {
            title_max_chars: 60,
            cache_dir: None,
            data_dir: None,
            assistant: AssistantConfig::default(),
            git: GitConfig::default(),
            issues: IssueTrackerConfig::default(),
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            timeout_secs: 120,
            terminate_grace_secs: 5,
            allowed_tools: "Read,Glob,Grep".to_string(),
            permission_mode: "bypassPermissions".to_string(),
            output_limit_bytes: 4_000_000,
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            command: "git".to_string(),
            remote_base: "https://".to_string(),
        }
    }
}

impl Default for IssueTrackerConfig {
    fn default() -> Self {
        Self {
            command: "gh".to_string(),
        }
    }
}

impl AssistantConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

impl PrompterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.title_max_chars == 0 {
            return Err(anyhow!("title_max_chars must be > 0"));
        }
        if self.assistant.timeout_secs == 0 {
            return Err(anyhow!("assistant.timeout_secs must be > 0"));
        }
        if self.assistant.output_limit_bytes == 0 {
            return Err(anyhow!("assistant.output_limit_bytes must be > 0"));
        }
        if self.assistant.command.trim().is_empty() {
            return Err(anyhow!("assistant.command must be non-empty"));
        }
        if self.git.command.trim().is_empty() {
            return Err(anyhow!("git.command must be non-empty"));
        }
        if self.issues.command.trim().is_empty() {
            return Err(anyhow!("issues.command must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PrompterConfig::default()`.
pub fn load_config(path: &Path) -> Result<PrompterConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = PrompterConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PrompterConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}
