//! Working-copy provisioning through the `git` CLI.
//!
//! A repository is cloned on first use and fast-forwarded afterwards. The
//! working copy is never modified otherwise; the AI CLI only reads it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::repo_ref::RepoRef;
use crate::io::config::GitConfig;

/// Abstraction over how a local working copy is obtained.
pub trait Provisioner: Send + Sync {
    /// Where the working copy of `repo` lives.
    fn local_path(&self, repo: &RepoRef) -> PathBuf;

    /// True once a clone exists; used to pick "cloning" vs "pulling".
    fn is_provisioned(&self, repo: &RepoRef) -> bool {
        self.local_path(repo).join(".git").exists()
    }

    /// Clone `repo` if absent, otherwise fast-forward it. Blocking.
    fn provision(&self, repo: &RepoRef) -> Result<()>;
}

/// Provisioner backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitProvisioner {
    cache_dir: PathBuf,
    config: GitConfig,
}

impl GitProvisioner {
    pub fn new(cache_dir: impl Into<PathBuf>, config: GitConfig) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            config,
        }
    }

    fn clone_url(&self, repo: &RepoRef) -> String {
        format!("{}{repo}.git", self.config.remote_base)
    }

    #[instrument(skip_all, fields(repo = %repo))]
    fn clone_repo(&self, repo: &RepoRef, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let url = self.clone_url(repo);
        let target = path.display().to_string();
        info!(%url, "cloning repository");
        self.run_checked(None, &["clone", &url, &target])
            .context("cloning repository")?;
        Ok(())
    }

    #[instrument(skip_all, fields(repo = %repo))]
    fn pull_repo(&self, repo: &RepoRef, path: &Path) -> Result<()> {
        info!("pulling repository");
        self.run_checked(Some(path), &["pull", "--ff-only"])
            .with_context(|| {
                format!(
                    "pulling repository (try deleting {} and restarting)",
                    path.display()
                )
            })?;
        Ok(())
    }

    fn run_checked(&self, workdir: Option<&Path>, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(args);
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args[0], stderr.trim()));
        }
        debug!(args = args.join(" "), "git succeeded");
        Ok(output)
    }
}

impl Provisioner for GitProvisioner {
    fn local_path(&self, repo: &RepoRef) -> PathBuf {
        repo.local_path(&self.cache_dir)
    }

    fn provision(&self, repo: &RepoRef) -> Result<()> {
        let path = self.local_path(repo);
        if self.is_provisioned(repo) {
            self.pull_repo(repo, &path)
        } else {
            self.clone_repo(repo, &path)
        }
    }
}
