//! Pre-flight checks and the post-run audit.
//!
//! Pre-flight failures abort the run before any lock or workspace is taken;
//! the audit runs after everything else and only reports.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::git::{self, run_git_lenient, run_git_with_timeout};
use crate::workspace::{parse_branch, WorkspaceManager};
use crate::{ForemanError, Result, PRODUCT_PREFIX};

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Successful pre-flight findings worth surfacing.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub base_branch: String,
    pub dirty_tree: bool,
    pub fetched: bool,
}

/// Verify the repository is fit to run against.
///
/// Fatal: not a git checkout, or the base branch is missing. A failed fetch
/// and a dirty tree only warn.
pub async fn preflight(repo_root: &Path, base_branch: &str) -> Result<PreflightReport> {
    let checkout = run_git_lenient(&["rev-parse", "--git-dir"], repo_root)
        .await
        .map_err(|e| ForemanError::Preflight(format!("cannot inspect {}: {e}", repo_root.display())))?;
    if !checkout.success {
        return Err(ForemanError::Preflight(format!(
            "{} is not a git checkout",
            repo_root.display()
        )));
    }

    if !git::branch_exists(repo_root, base_branch)
        .await
        .map_err(|e| ForemanError::Preflight(e.to_string()))?
    {
        return Err(ForemanError::Preflight(format!(
            "base branch '{base_branch}' does not exist"
        )));
    }

    let fetched = match run_git_with_timeout(&["fetch", "--quiet"], repo_root, FETCH_TIMEOUT).await {
        Ok(output) if output.success => true,
        Ok(output) => {
            warn!(stderr = %output.stderr.trim(), "pre-flight fetch failed; continuing");
            false
        }
        Err(e) => {
            warn!(error = %e, "pre-flight fetch failed; continuing");
            false
        }
    };

    let dirty_tree = git::is_dirty(repo_root)
        .await
        .map_err(|e| ForemanError::Preflight(e.to_string()))?;
    if dirty_tree {
        warn!("working tree is dirty; integration will stash around it");
    }

    info!(base_branch, dirty_tree, fetched, "pre-flight passed");
    Ok(PreflightReport {
        base_branch: base_branch.to_string(),
        dirty_tree,
        fetched,
    })
}

/// Findings of the post-run audit.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    /// Branches of foreman workspaces this process left behind.
    pub orphan_workspaces: Vec<String>,
    /// `(expected, actual)` when the checkout drifted during the run.
    pub branch_drift: Option<(String, String)>,
    /// Foreman-tagged stash entries that were never popped.
    pub leftover_stashes: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_workspaces.is_empty()
            && self.branch_drift.is_none()
            && self.leftover_stashes.is_empty()
    }
}

/// Audit the repository after a run: no leftover workspaces from this
/// process, the checkout is back where it started, no tagged stashes remain.
pub async fn post_run_audit(
    repo_root: &Path,
    started_branch: &str,
    workspaces: &WorkspaceManager,
) -> Result<AuditReport> {
    let own_pid = std::process::id();
    let orphan_workspaces = workspaces
        .list()
        .await?
        .into_iter()
        .filter(|ws| parse_branch(&ws.branch).is_some_and(|p| p.pid == own_pid))
        .map(|ws| ws.branch)
        .collect::<Vec<_>>();

    let current = git::current_branch(repo_root)
        .await?
        .unwrap_or_else(|| "(detached)".to_string());
    let branch_drift = if current == started_branch {
        None
    } else {
        Some((started_branch.to_string(), current))
    };

    let stash_tag = format!("{PRODUCT_PREFIX}-pre-merge");
    let stashes = crate::git::run_git(&["stash", "list"], repo_root).await?;
    let leftover_stashes = stashes
        .stdout
        .lines()
        .filter(|l| l.contains(&stash_tag))
        .map(String::from)
        .collect::<Vec<_>>();

    let report = AuditReport {
        orphan_workspaces,
        branch_drift,
        leftover_stashes,
    };
    if report.is_clean() {
        info!("post-run audit clean");
    } else {
        warn!(?report, "post-run audit found leftovers");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testutil;

    #[tokio::test]
    async fn preflight_passes_on_clean_repo() {
        let (_tmp, root) = testutil::init_repo().await;
        let report = preflight(&root, "main").await.unwrap();
        assert!(!report.dirty_tree);
    }

    #[tokio::test]
    async fn preflight_rejects_non_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let err = preflight(tmp.path(), "main").await.unwrap_err();
        assert!(err.to_string().contains("not a git checkout"));
    }

    #[tokio::test]
    async fn preflight_rejects_missing_base_branch() {
        let (_tmp, root) = testutil::init_repo().await;
        let err = preflight(&root, "release").await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn preflight_tolerates_dirty_tree() {
        let (_tmp, root) = testutil::init_repo().await;
        tokio::fs::write(root.join("wip.txt"), "x\n").await.unwrap();
        let report = preflight(&root, "main").await.unwrap();
        assert!(report.dirty_tree);
    }

    #[tokio::test]
    async fn audit_clean_after_untouched_run() {
        let (tmp, root) = testutil::init_repo().await;
        let mgr = WorkspaceManager::with_temp_root(root.clone(), tmp.path().join("wt"));
        let report = post_run_audit(&root, "main", &mgr).await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn audit_flags_leftover_workspace() {
        let (tmp, root) = testutil::init_repo().await;
        let mgr = WorkspaceManager::with_temp_root(root.clone(), tmp.path().join("wt"));
        let ws = mgr.create("main", 200, "left-behind", 0).await.unwrap();

        let report = post_run_audit(&root, "main", &mgr).await.unwrap();
        assert_eq!(report.orphan_workspaces, vec![ws.branch.clone()]);

        mgr.remove(&ws.path, &ws.branch, true).await;
    }

    #[tokio::test]
    async fn audit_flags_branch_drift() {
        let (tmp, root) = testutil::init_repo().await;
        let mgr = WorkspaceManager::with_temp_root(root.clone(), tmp.path().join("wt"));
        crate::git::run_git(&["checkout", "-b", "sidetrack"], &root)
            .await
            .unwrap();

        let report = post_run_audit(&root, "main", &mgr).await.unwrap();
        assert_eq!(
            report.branch_drift,
            Some(("main".to_string(), "sidetrack".to_string()))
        );
    }

    #[tokio::test]
    async fn audit_flags_tagged_stash() {
        let (tmp, root) = testutil::init_repo().await;
        let mgr = WorkspaceManager::with_temp_root(root.clone(), tmp.path().join("wt"));

        tokio::fs::write(root.join("wip.txt"), "x\n").await.unwrap();
        crate::git::run_git(
            &["stash", "push", "-u", "-m", "foreman-pre-merge-1-2-3"],
            &root,
        )
        .await
        .unwrap();

        let report = post_run_audit(&root, "main", &mgr).await.unwrap();
        assert_eq!(report.leftover_stashes.len(), 1);
    }
}
