//! Issue tracker collaborator backed by the `gh` CLI.

use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::core::repo_ref::RepoRef;
use crate::io::config::IssueTrackerConfig;

/// A published issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub url: String,
}

/// Abstraction over where generated prompts are published.
pub trait IssueTracker: Send + Sync {
    fn create_issue(&self, repo: &RepoRef, title: &str, body: &str) -> Result<Issue>;

    /// Replace the body of an existing issue.
    fn edit_issue(&self, repo: &RepoRef, number: u64, body: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct GhCli {
    config: IssueTrackerConfig,
}

impl GhCli {
    pub fn new(config: IssueTrackerConfig) -> Self {
        Self { config }
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new(&self.config.command)
            .args(args)
            .output()
            .with_context(|| format!("spawn gh {}", args[..2].join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("gh {} failed: {}", args[..2].join(" "), stderr.trim()));
        }
        Ok(output)
    }
}

impl IssueTracker for GhCli {
    #[instrument(skip_all, fields(repo = %repo))]
    fn create_issue(&self, repo: &RepoRef, title: &str, body: &str) -> Result<Issue> {
        let slug = repo.slug();
        let output = self.run_checked(&[
            "issue", "create", "--repo", &slug, "--title", title, "--body", body,
        ])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let issue = parse_created_issue(&stdout)?;
        info!(number = issue.number, url = %issue.url, "issue created");
        Ok(issue)
    }

    #[instrument(skip_all, fields(repo = %repo, number = number))]
    fn edit_issue(&self, repo: &RepoRef, number: u64, body: &str) -> Result<()> {
        let slug = repo.slug();
        let number = number.to_string();
        self.run_checked(&["issue", "edit", &number, "--repo", &slug, "--body", body])?;
        info!("issue updated");
        Ok(())
    }
}

#[derive(Deserialize)]
struct CreatedIssue {
    number: u64,
    url: String,
}

/// `gh issue create` prints the issue URL; some versions print JSON instead.
fn parse_created_issue(stdout: &str) -> Result<Issue> {
    let trimmed = stdout.trim();
    if let Ok(created) = serde_json::from_str::<CreatedIssue>(trimmed) {
        return Ok(Issue {
            number: created.number,
            url: created.url,
        });
    }
    let url = trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("http"))
        .ok_or_else(|| anyhow!("gh issue create printed no issue url: {trimmed:?}"))?;
    let number = url
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse::<u64>().ok())
        .ok_or_else(|| anyhow!("cannot read issue number from {url:?}"))?;
    Ok(Issue {
        number,
        url: url.to_string(),
    })
}
