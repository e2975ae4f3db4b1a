//! Default on-disk locations.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::io::config::PrompterConfig;

/// Working-copy cache: `$XDG_CACHE_HOME/prompter`, else `~/.cache/prompter`.
pub fn cache_dir(cfg: &PrompterConfig) -> Result<PathBuf> {
    if let Some(dir) = &cfg.cache_dir {
        return Ok(dir.clone());
    }
    let base = match std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        Some(base) => PathBuf::from(base),
        None => home_dir()?.join(".cache"),
    };
    Ok(base.join("prompter"))
}

/// Data directory holding the store: `~/.prompter`.
pub fn data_dir(cfg: &PrompterConfig) -> Result<PathBuf> {
    if let Some(dir) = &cfg.data_dir {
        return Ok(dir.clone());
    }
    Ok(home_dir()?.join(".prompter"))
}

/// Default config location: `~/.prompter/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(home_dir()?.join(".prompter").join("config.toml"))
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("resolve home directory")
}
