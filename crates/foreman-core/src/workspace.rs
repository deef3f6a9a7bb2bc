//! Git worktree lifecycle management for attempt isolation.
//!
//! Each attempt gets its own worktree under `<tempdir>/foreman-worktrees/`
//! on a branch named `foreman-<pid>-<issue>-<slug>-<attempt>-<seq>`. The pid
//! and the monotonic suffix keep parallel processes and retried attempts
//! from ever colliding, even after incomplete cleanup.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::git::{self, run_git, run_git_lenient};
use crate::{ForemanError, Result, PRODUCT_PREFIX};

/// An isolated checkout owned by exactly one slot.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub branch: String,
    pub path: PathBuf,
    pub issue: u64,
}

/// Identity encoded in a foreman branch name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchParts {
    pub pid: u32,
    pub issue: u64,
}

/// Map every character outside `[A-Za-z0-9_-]` to `-`.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Deterministic branch name for one attempt. Pure in its inputs.
pub fn branch_name(pid: u32, issue: u64, slug: &str, attempt: u32, seq: u64) -> String {
    let slug = sanitize_component(slug);
    format!("{PRODUCT_PREFIX}-{pid}-{issue}-{slug}-{attempt}-{seq}")
}

/// Parse `(pid, issue)` back out of a foreman branch name.
pub fn parse_branch(branch: &str) -> Option<BranchParts> {
    let rest = branch.strip_prefix(PRODUCT_PREFIX)?.strip_prefix('-')?;
    let mut parts = rest.splitn(3, '-');
    let pid: u32 = parts.next()?.parse().ok()?;
    let issue: u64 = parts.next()?.parse().ok()?;
    parts.next()?;
    Some(BranchParts { pid, issue })
}

/// Service for creating, listing and tearing down attempt worktrees.
pub struct WorkspaceManager {
    repo_root: PathBuf,
    temp_root: PathBuf,
    pid: u32,
    seq: AtomicU64,
}

impl WorkspaceManager {
    /// Manager rooted at `repo_root`, with worktrees under the system tempdir.
    pub fn new(repo_root: PathBuf) -> Self {
        let temp_root = std::env::temp_dir().join(format!("{PRODUCT_PREFIX}-worktrees"));
        Self::with_temp_root(repo_root, temp_root)
    }

    /// Manager with an explicit worktree root. Used by tests and tooling.
    pub fn with_temp_root(repo_root: PathBuf, temp_root: PathBuf) -> Self {
        Self {
            repo_root,
            temp_root,
            pid: std::process::id(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    fn workspace_path(&self, branch: &str) -> PathBuf {
        let repo = self
            .repo_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        let dir = format!(
            "{}-{}-{}",
            sanitize_component(&repo),
            self.pid,
            sanitize_component(branch)
        );
        self.temp_root.join(dir)
    }

    /// Create a branch-plus-worktree for one attempt.
    ///
    /// Atomic from the caller's perspective: on any failure neither the
    /// branch nor the directory remain.
    pub async fn create(
        &self,
        base_branch: &str,
        issue: u64,
        slug: &str,
        attempt: u32,
    ) -> Result<Workspace> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let branch = branch_name(self.pid, issue, slug, attempt, seq);
        let path = self.workspace_path(&branch);

        // Defensive pre-cleanup: stale metadata from a crashed run may still
        // reference the exact branch or path we are about to create.
        self.prune_metadata().await;
        if self.reference_exists(&branch).await? {
            warn!(%branch, "stale workspace reference found before create; cleaning");
            self.cleanup_for_retry(Some(&path), &branch).await;
        }

        tokio::fs::create_dir_all(&self.temp_root)
            .await
            .map_err(|e| ForemanError::Workspace(format!("failed to create temp root: {e}")))?;

        info!(issue, %branch, path = %path.display(), "creating workspace");

        let path_str = path
            .to_str()
            .ok_or_else(|| ForemanError::Workspace("workspace path is not valid UTF-8".into()))?;
        let added = run_git(
            &["worktree", "add", "-b", &branch, path_str, base_branch],
            &self.repo_root,
        )
        .await;

        if let Err(e) = added {
            // Rollback: neither directory nor branch may survive a failure.
            if path.exists() {
                let _ = tokio::fs::remove_dir_all(&path).await;
            }
            let _ = run_git_lenient(&["branch", "-D", &branch], &self.repo_root).await;
            self.prune_metadata().await;
            return Err(ForemanError::Workspace(format!(
                "failed to create workspace for issue {issue}: {e}"
            )));
        }

        Ok(Workspace { branch, path, issue })
    }

    /// Idempotent cleanup used between attempts.
    ///
    /// Safe against a repo that never had the workspace or branch; every
    /// step swallows "not found" and logs anything else without failing.
    /// Returns true once the working directory is confirmed gone.
    pub async fn cleanup_for_retry(&self, path: Option<&Path>, branch: &str) -> bool {
        self.prune_metadata().await;

        match self.reference_exists(branch).await {
            Ok(true) => {
                warn!(%branch, "workspace reference still listed after prune");
                if let Some(p) = path {
                    if let Some(p) = p.to_str() {
                        let _ = run_git_lenient(
                            &["worktree", "remove", "--force", p],
                            &self.repo_root,
                        )
                        .await;
                    }
                }
            }
            Ok(false) => {}
            Err(e) => debug!(%branch, error = %e, "reference check failed during cleanup"),
        }

        let _ = run_git_lenient(&["branch", "-D", branch], &self.repo_root).await;

        let mut removed = true;
        if let Some(p) = path {
            if p.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(p).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %p.display(), error = %e, "failed to remove workspace dir");
                    }
                }
            }
            removed = !p.exists();
        }
        removed
    }

    /// Standard end-of-life cleanup. Returns true once the directory is gone.
    pub async fn remove(&self, path: &Path, branch: &str, delete_branch: bool) -> bool {
        debug!(%branch, path = %path.display(), "removing workspace");
        if let Some(p) = path.to_str() {
            let _ = run_git_lenient(&["worktree", "remove", "--force", p], &self.repo_root).await;
        }
        if path.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove workspace dir");
                }
            }
        }
        self.prune_metadata().await;
        if delete_branch {
            let _ = run_git_lenient(&["branch", "-D", branch], &self.repo_root).await;
        }
        !path.exists()
    }

    /// All worktrees matching the foreman branch shape, any owning pid.
    pub async fn list(&self) -> Result<Vec<Workspace>> {
        let output = run_git(&["worktree", "list", "--porcelain"], &self.repo_root).await?;
        let mut result = Vec::new();
        let mut current_path: Option<PathBuf> = None;

        for line in output.stdout.lines() {
            if let Some(path_str) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path_str));
            } else if let Some(branch_ref) = line.strip_prefix("branch ") {
                if let Some(path) = current_path.take() {
                    let branch = branch_ref
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch_ref)
                        .to_string();
                    if let Some(parts) = parse_branch(&branch) {
                        result.push(Workspace {
                            branch,
                            path,
                            issue: parts.issue,
                        });
                    }
                }
            } else if line.is_empty() {
                current_path = None;
            }
        }

        Ok(result)
    }

    /// Prune stale worktree metadata. Idempotent; returns success.
    pub async fn prune_metadata(&self) -> bool {
        match run_git_lenient(&["worktree", "prune"], &self.repo_root).await {
            Ok(output) => output.success,
            Err(e) => {
                debug!(error = %e, "worktree prune failed");
                false
            }
        }
    }

    /// Whether the given workspace has any observable change vs the base
    /// branch: uncommitted edits in the worktree, or commits ahead of base.
    pub async fn has_changes(&self, workspace_path: &Path, base_branch: &str) -> Result<bool> {
        if git::is_dirty(workspace_path).await? {
            return Ok(true);
        }
        let range = format!("{base_branch}...HEAD");
        let output = run_git(&["diff", "--name-only", &range], workspace_path).await?;
        Ok(!output.stdout.trim().is_empty())
    }

    async fn reference_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|w| w.branch == branch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testutil;

    fn manager(root: &Path, tmp: &Path) -> WorkspaceManager {
        WorkspaceManager::with_temp_root(root.to_path_buf(), tmp.join("wt"))
    }

    #[tokio::test]
    async fn create_list_remove_lifecycle() {
        let (tmp, root) = testutil::init_repo().await;
        let mgr = manager(&root, tmp.path());

        let ws = mgr.create("main", 100, "add-index", 0).await.unwrap();
        assert!(ws.path.exists());
        assert!(ws.branch.starts_with("foreman-"));
        assert_eq!(ws.issue, 100);

        let listed = mgr.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].issue, 100);

        assert!(mgr.remove(&ws.path, &ws.branch, true).await);
        assert!(!ws.path.exists());
        assert!(!git::branch_exists(&root, &ws.branch).await.unwrap());
        assert!(mgr.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_rolls_back_on_failure() {
        let (tmp, root) = testutil::init_repo().await;
        let mgr = manager(&root, tmp.path());

        let err = mgr.create("no-such-base", 101, "slug", 0).await;
        assert!(err.is_err());

        // Neither a branch nor a directory may remain.
        assert!(mgr.list().await.unwrap().is_empty());
        let branches = run_git(&["branch", "--list", "foreman-*"], &root)
            .await
            .unwrap();
        assert!(branches.stdout.trim().is_empty());
    }

    #[tokio::test]
    async fn retries_get_distinct_branches() {
        let (tmp, root) = testutil::init_repo().await;
        let mgr = manager(&root, tmp.path());

        let first = mgr.create("main", 102, "slug", 0).await.unwrap();
        mgr.cleanup_for_retry(Some(&first.path), &first.branch).await;
        let second = mgr.create("main", 102, "slug", 1).await.unwrap();

        assert_ne!(first.branch, second.branch);
        assert!(mgr.remove(&second.path, &second.branch, true).await);
    }

    #[tokio::test]
    async fn cleanup_for_retry_is_idempotent() {
        let (tmp, root) = testutil::init_repo().await;
        let mgr = manager(&root, tmp.path());

        let ws = mgr.create("main", 103, "slug", 0).await.unwrap();
        assert!(mgr.cleanup_for_retry(Some(&ws.path), &ws.branch).await);

        // Repeat calls against a repo with no such workspace or branch.
        assert!(mgr.cleanup_for_retry(Some(&ws.path), &ws.branch).await);
        assert!(mgr.cleanup_for_retry(None, &ws.branch).await);
        assert!(mgr.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_metadata_is_cleared_before_create() {
        let (tmp, root) = testutil::init_repo().await;
        let mgr = manager(&root, tmp.path());

        // Simulate a crashed run: the worktree directory vanishes but git
        // still holds metadata for it.
        let ws = mgr.create("main", 104, "slug", 0).await.unwrap();
        tokio::fs::remove_dir_all(&ws.path).await.unwrap();

        let again = mgr.create("main", 104, "slug", 0).await.unwrap();
        assert!(again.path.exists());
        assert!(mgr.remove(&again.path, &again.branch, true).await);
    }

    #[tokio::test]
    async fn has_changes_reflects_workspace_state() {
        let (tmp, root) = testutil::init_repo().await;
        let mgr = manager(&root, tmp.path());
        let ws = mgr.create("main", 105, "slug", 0).await.unwrap();

        assert!(!mgr.has_changes(&ws.path, "main").await.unwrap());

        tokio::fs::write(ws.path.join("new.txt"), "x\n").await.unwrap();
        assert!(mgr.has_changes(&ws.path, "main").await.unwrap());

        testutil::commit_all(&ws.path, "work").await;
        assert!(mgr.has_changes(&ws.path, "main").await.unwrap());

        mgr.remove(&ws.path, &ws.branch, true).await;
    }

    #[test]
    fn branch_name_is_pure() {
        let a = branch_name(42, 7, "fix it", 1, 9);
        let b = branch_name(42, 7, "fix it", 1, 9);
        assert_eq!(a, b);
        assert_eq!(a, "foreman-42-7-fix-it-1-9");
    }

    #[test]
    fn branch_parses_back_to_pid_and_issue() {
        let branch = branch_name(42, 7, "slug", 0, 3);
        let parts = parse_branch(&branch).unwrap();
        assert_eq!(parts.pid, 42);
        assert_eq!(parts.issue, 7);

        assert!(parse_branch("main").is_none());
        assert!(parse_branch("foreman-notapid-7-slug-0-0").is_none());
    }

    #[test]
    fn sanitization_rejects_everything_outside_the_whitelist() {
        assert_eq!(sanitize_component("a/b..c d"), "a-b--c-d");
        assert_eq!(sanitize_component("ok_name-1"), "ok_name-1");
    }
}
