//! Repository identity (`github.com/<owner>/<repo>`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

static REPO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^github\.com/([\w.\-]+)/([\w.\-]+)$").expect("repository url pattern")
});

/// A validated repository identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    owner: String,
    name: String,
}

impl RepoRef {
    /// Parse `github.com/<owner>/<repo>`.
    pub fn parse(url: &str) -> Result<Self> {
        let caps = REPO_URL.captures(url).ok_or_else(|| {
            anyhow!("invalid repository URL {url:?}: expected format github.com/owner/repo")
        })?;
        Ok(Self {
            owner: caps[1].to_string(),
            name: caps[2].to_string(),
        })
    }

    /// `owner/repo`, as the `gh` CLI expects it.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Working copy location under `cache_dir`.
    pub fn local_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir
            .join("repos")
            .join("github.com")
            .join(&self.owner)
            .join(&self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "github.com/{}/{}", self.owner, self.name)
    }
}
