//! Git operations on the deployed checkout

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::deploy::command::{CommandRunner, CommandSpec};
use crate::errors::AgentError;

/// The working tree the agent deploys from
#[derive(Clone)]
pub struct GitRepo {
    runner: Arc<dyn CommandRunner>,
    path: PathBuf,
    branch: String,
    timeout: Duration,
}

impl GitRepo {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        path: impl Into<PathBuf>,
        branch: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            path: path.into(),
            branch: branch.to_string(),
            timeout,
        }
    }

    /// Tracked branch name
    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn git<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("git", args)
            .current_dir(&self.path)
            .timeout(self.timeout)
    }

    /// Revision currently checked out
    pub async fn current_revision(&self) -> Result<String, AgentError> {
        let output = self.runner.run_checked(&self.git(["rev-parse", "HEAD"])).await?;
        parse_revision(output.first_line())
    }

    /// Head of the tracked branch on the remote
    pub async fn remote_revision(&self) -> Result<String, AgentError> {
        let refname = format!("refs/heads/{}", self.branch);
        let output = self
            .runner
            .run_checked(&self.git(["ls-remote", "origin", refname.as_str()]))
            .await?;

        let line = output
            .stdout
            .lines()
            .find(|l| l.trim_end().ends_with(&refname))
            .ok_or_else(|| {
                AgentError::DeployError(format!("branch {} not found on origin", self.branch))
            })?;
        let revision = line.split_whitespace().next().unwrap_or_default();
        parse_revision(revision)
    }

    /// Merge the tracked branch into the working tree. Uncommitted local
    /// changes are stashed away first and not restored.
    pub async fn pull(&self) -> Result<String, AgentError> {
        info!("Pulling origin/{} into {}", self.branch, self.path.display());

        match self.runner.run(&self.git(["stash", "--include-untracked"])).await {
            Ok(output) if !output.success() => {
                debug!("git stash exited with {:?}, continuing", output.exit_code);
            }
            Ok(_) => {}
            Err(e) => warn!("git stash failed, continuing: {}", e),
        }

        self.runner
            .run_checked(&self.git(["pull", "origin", self.branch.as_str()]))
            .await?;

        self.current_revision().await
    }

    /// Discard everything after `revision` in the working tree
    pub async fn reset_hard(&self, revision: &str) -> Result<(), AgentError> {
        info!("Resetting {} to {}", self.path.display(), short(revision));
        self.runner
            .run_checked(&self.git(["reset", "--hard", revision]))
            .await?;
        Ok(())
    }
}

fn parse_revision(raw: &str) -> Result<String, AgentError> {
    let revision = raw.trim();
    if revision.len() < 7 || !revision.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AgentError::DeployError(format!(
            "unexpected revision output: {:?}",
            revision
        )));
    }
    Ok(revision.to_string())
}

/// Abbreviated revision for messages
pub fn short(revision: &str) -> &str {
    revision.get(..7).unwrap_or(revision)
}
