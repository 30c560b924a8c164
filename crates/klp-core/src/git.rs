//! Git integration: operator identity and the patch source tree.

use std::path::Path;
use std::process::Command;

use crate::error::{KlpError, Result};
use crate::tools::{path_arg, run_command};

/// Operator identity taken from git configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: &str, email: &str) -> Self {
        Identity {
            name: name.to_string(),
            email: email.to_string(),
        }
    }

    /// Read `user.name` and `user.email` from the global git configuration.
    pub fn from_global_config() -> Result<Self> {
        let dir = std::env::temp_dir();
        Ok(Identity {
            name: config_value(&dir, &["config", "--global", "user.name"])?,
            email: config_value(&dir, &["config", "--global", "user.email"])?,
        })
    }

    /// Read the identity effective inside `repo_dir`.
    pub fn from_repo(repo_dir: &Path) -> Result<Self> {
        Ok(Identity {
            name: config_value(repo_dir, &["config", "user.name"])?,
            email: config_value(repo_dir, &["config", "user.email"])?,
        })
    }

    /// Build service account: the local part of the email address.
    pub fn remote_user(&self) -> &str {
        self.email.split('@').next().unwrap_or(&self.email)
    }
}

fn config_value(dir: &Path, args: &[&str]) -> Result<String> {
    let key = args.last().copied().unwrap_or_default();
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| KlpError::Config(format!("failed to run git: {e}")))?;

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || value.is_empty() {
        return Err(KlpError::Config(format!("git {key} is not set")));
    }
    Ok(value)
}

/// Whether `repo_dir` has a local branch named `branch`.
pub async fn branch_exists(repo_dir: &Path, branch: &str) -> bool {
    let refname = format!("refs/heads/{branch}");
    run_command(
        "git",
        &["rev-parse", "--verify", "--quiet", refname.as_str()],
        repo_dir,
    )
    .await
    .is_ok()
}

/// Clone only `branch` of `source` into `dest`, which must not exist yet.
pub async fn clone_branch(source: &Path, branch: &str, dest: &Path) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let source = path_arg(source);
    let dest = path_arg(dest);
    run_command(
        "git",
        &["clone", "--quiet", "--single-branch", "-b", branch, source.as_str(), dest.as_str()],
        parent,
    )
    .await?;
    Ok(())
}
