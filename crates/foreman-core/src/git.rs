//! Shared async runner for git subprocess invocations.
//!
//! Every module that talks to the repository goes through [`run_git`] or
//! [`run_git_lenient`] so timeouts and error shapes are uniform.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured output of a finished git command.
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command timed out after {timeout_secs}s: {command}")]
    TimedOut { command: String, timeout_secs: u64 },

    #[error("git command failed with exit code {code:?}: {command}; stderr: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to execute git command: {0}")]
    Io(#[from] std::io::Error),
}

/// Run a git command in `cwd`, erroring on non-zero exit.
pub async fn run_git(args: &[&str], cwd: &Path) -> Result<GitOutput, GitError> {
    let output = run_git_lenient(args, cwd).await?;
    if !output.success {
        return Err(GitError::NonZeroExit {
            command: render_command(args),
            code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

/// Run a git command in `cwd`, returning the captured output regardless of
/// exit status. Only spawn/IO failures and timeouts are errors.
pub async fn run_git_lenient(args: &[&str], cwd: &Path) -> Result<GitOutput, GitError> {
    run_git_with_timeout(args, cwd, DEFAULT_GIT_COMMAND_TIMEOUT).await
}

pub async fn run_git_with_timeout(
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<GitOutput, GitError> {
    let command = render_command(args);
    debug!(cwd = %cwd.display(), %command, "running git command");

    let mut child = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout pipe missing"))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr pipe missing"))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await?;
        Ok::<Vec<u8>, std::io::Error>(buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await?;
        Ok::<Vec<u8>, std::io::Error>(buf)
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(GitError::Io(e)),
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            return Err(GitError::TimedOut {
                command,
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_task
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
    let stderr = stderr_task
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;

    Ok(GitOutput {
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        exit_code: status.code(),
        success: status.success(),
    })
}

/// Name of the currently checked-out branch, or `None` when HEAD is detached.
pub async fn current_branch(repo: &Path) -> Result<Option<String>, GitError> {
    let output = run_git_lenient(&["symbolic-ref", "--short", "-q", "HEAD"], repo).await?;
    if output.success {
        Ok(Some(output.stdout.trim().to_string()))
    } else {
        Ok(None)
    }
}

/// Commit hash of HEAD. Used to restore a detached checkout.
pub async fn head_commit(repo: &Path) -> Result<String, GitError> {
    let output = run_git(&["rev-parse", "HEAD"], repo).await?;
    Ok(output.stdout.trim().to_string())
}

/// True when `ancestor` is an ancestor of `descendant`.
pub async fn is_ancestor(repo: &Path, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
    let output = run_git_lenient(
        &["merge-base", "--is-ancestor", ancestor, descendant],
        repo,
    )
    .await?;
    Ok(output.success)
}

/// True when the local branch exists.
pub async fn branch_exists(repo: &Path, branch: &str) -> Result<bool, GitError> {
    let ref_name = format!("refs/heads/{branch}");
    let output = run_git_lenient(&["show-ref", "--verify", "--quiet", &ref_name], repo).await?;
    Ok(output.success)
}

/// True when the working tree has staged or unstaged changes.
pub async fn is_dirty(repo: &Path) -> Result<bool, GitError> {
    let output = run_git(&["status", "--porcelain"], repo).await?;
    Ok(!output.stdout.trim().is_empty())
}

/// Paths currently in an unmerged (conflicted) state.
pub async fn unmerged_paths(repo: &Path) -> Result<Vec<String>, GitError> {
    let output = run_git(&["diff", "--name-only", "--diff-filter=U"], repo).await?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn render_command(args: &[&str]) -> String {
    if args.is_empty() {
        return "git".to_string();
    }
    format!("git {}", args.join(" "))
}
