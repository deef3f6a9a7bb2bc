//! Serialized integration of feature branches into the base branch.
//!
//! One integration at a time per process: the internal mutex guards the
//! mainline working tree's HEAD and stash state for the whole
//! stash-checkout-merge-restore sequence. The rebase step runs in the
//! feature's own workspace and deliberately stays outside the mutex.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::git::{self, run_git, run_git_lenient};
use crate::{Result, PRODUCT_PREFIX};

/// Outcome of one integration attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub conflict_files: Vec<String>,
}

impl MergeOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
            conflict_files: Vec::new(),
        }
    }

    fn failed(error: impl Into<String>, conflict_files: Vec<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            conflict_files,
        }
    }
}

/// Where the mainline checkout was before integration.
enum OriginalRef {
    Branch(String),
    Detached(String),
}

/// Service performing verified, serialized merges into the base branch.
pub struct Integrator {
    repo_root: PathBuf,
    mutex: Mutex<()>,
}

impl Integrator {
    pub fn new(repo_root: PathBuf) -> Self {
        Self {
            repo_root,
            mutex: Mutex::new(()),
        }
    }

    /// Integrate `feature_branch` into `base_branch`.
    ///
    /// `feature_workspace` is the feature's checkout, used as the rebase
    /// location when the base has advanced; the mainline tree is never
    /// rebased.
    pub async fn integrate(
        &self,
        feature_branch: &str,
        base_branch: &str,
        issue: u64,
        feature_workspace: Option<&Path>,
    ) -> Result<MergeOutcome> {
        info!(issue, feature_branch, base_branch, "integrating branch");

        // Engines are expected to commit; checkpoint anything they left
        // uncommitted so the merge sees it.
        if let Some(ws) = feature_workspace {
            if git::is_dirty(ws).await? {
                debug!(issue, "committing leftover engine output before integration");
                run_git(&["add", "-A"], ws).await?;
                let message = format!("{PRODUCT_PREFIX}: checkpoint engine output (#{issue})");
                run_git(&["commit", "-m", &message], ws).await?;
            }
        }

        // Ancestry: rebase the feature onto base when base has advanced.
        if !git::is_ancestor(&self.repo_root, base_branch, feature_branch).await? {
            let Some(ws) = feature_workspace else {
                return Ok(MergeOutcome::failed(
                    format!("base branch '{base_branch}' advanced and no workspace is available for rebase"),
                    Vec::new(),
                ));
            };
            debug!(issue, feature_branch, "base advanced; rebasing in feature workspace");
            let rebased = run_git_lenient(&["rebase", base_branch], ws).await?;
            if !rebased.success {
                // Conflicting paths are lost once the rebase is aborted.
                let conflicts = git::unmerged_paths(ws).await.unwrap_or_default();
                let _ = run_git_lenient(&["rebase", "--abort"], ws).await;
                return Ok(MergeOutcome::failed(
                    format!("rebase onto '{base_branch}' conflicted: {}", rebased.stderr.trim()),
                    conflicts,
                ));
            }
        }

        // No diff against base: nothing to merge.
        let range = format!("{base_branch}...{feature_branch}");
        let diff = run_git(&["diff", "--name-only", &range], &self.repo_root).await?;
        if diff.stdout.trim().is_empty() {
            info!(issue, feature_branch, "no diff against base; integration is a no-op");
            return Ok(MergeOutcome::ok());
        }

        // Everything below mutates the mainline working tree.
        let _guard = self.mutex.lock().await;

        let stash_tag = self.stash_if_dirty(issue).await?;
        let original = self.current_ref().await?;

        let result = self
            .checkout_and_merge(feature_branch, base_branch, issue)
            .await;

        // Guaranteed restore: checkout the original ref and pop our stash,
        // whatever the merge did. Failures are logged, never masking the
        // merge outcome.
        self.restore(&original, base_branch, stash_tag.as_deref())
            .await;

        result
    }

    /// Cheap post-integration predicate: the feature is now contained in base.
    pub async fn verify_merged(&self, feature_branch: &str, base_branch: &str) -> Result<bool> {
        Ok(git::is_ancestor(&self.repo_root, feature_branch, base_branch).await?)
    }

    async fn checkout_and_merge(
        &self,
        feature_branch: &str,
        base_branch: &str,
        issue: u64,
    ) -> Result<MergeOutcome> {
        run_git(&["checkout", base_branch], &self.repo_root).await?;

        let message = format!("{PRODUCT_PREFIX}: merge {feature_branch} (#{issue})");
        let merged = run_git_lenient(
            &["merge", "--no-ff", "-m", &message, feature_branch],
            &self.repo_root,
        )
        .await?;

        if merged.success {
            info!(issue, feature_branch, "merge succeeded");
            return Ok(MergeOutcome::ok());
        }

        // Collect conflicting paths before aborting; the aborted state
        // loses them.
        let conflicts = git::unmerged_paths(&self.repo_root).await.unwrap_or_default();
        let _ = run_git_lenient(&["merge", "--abort"], &self.repo_root).await;

        warn!(issue, feature_branch, conflict_count = conflicts.len(), "merge conflicted");
        Ok(MergeOutcome::failed(
            format!("merge of '{feature_branch}' conflicted: {}", merged.stdout.trim()),
            conflicts,
        ))
    }

    /// Stash a dirty mainline tree under a unique tag; returns the tag used.
    async fn stash_if_dirty(&self, issue: u64) -> Result<Option<String>> {
        if !git::is_dirty(&self.repo_root).await? {
            return Ok(None);
        }
        let tag = format!(
            "{PRODUCT_PREFIX}-pre-merge-{issue}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        );
        debug!(issue, %tag, "stashing dirty mainline tree");
        run_git(&["stash", "push", "-u", "-m", &tag], &self.repo_root).await?;
        Ok(Some(tag))
    }

    async fn current_ref(&self) -> Result<OriginalRef> {
        match git::current_branch(&self.repo_root).await? {
            Some(branch) => Ok(OriginalRef::Branch(branch)),
            None => Ok(OriginalRef::Detached(
                git::head_commit(&self.repo_root).await?,
            )),
        }
    }

    async fn restore(&self, original: &OriginalRef, base_branch: &str, stash_tag: Option<&str>) {
        let target = match original {
            OriginalRef::Branch(b) => {
                if b != base_branch {
                    Some(b.as_str())
                } else {
                    None
                }
            }
            OriginalRef::Detached(commit) => Some(commit.as_str()),
        };
        if let Some(target) = target {
            if let Err(e) = run_git(&["checkout", target], &self.repo_root).await {
                warn!(target, error = %e, "failed to restore original checkout");
            }
        }

        let Some(tag) = stash_tag else { return };
        // Locate the stash by its unique message; numeric indices shift as
        // other stashes come and go.
        match self.find_stash_ref(tag).await {
            Some(stash_ref) => {
                if let Err(e) = run_git(&["stash", "pop", &stash_ref], &self.repo_root).await {
                    warn!(%tag, error = %e, "failed to pop pre-merge stash");
                }
            }
            None => warn!(%tag, "pre-merge stash not found during restore"),
        }
    }

    async fn find_stash_ref(&self, tag: &str) -> Option<String> {
        let output = run_git(&["stash", "list"], &self.repo_root).await.ok()?;
        for line in output.stdout.lines() {
            if line.contains(tag) {
                return line.split(':').next().map(str::trim).map(String::from);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testutil;

    /// Add a worktree for `branch` cut from `base`, rooted under `dir`.
    async fn add_feature_worktree(repo: &Path, dir: &Path, branch: &str, base: &str) -> PathBuf {
        let path = dir.join(branch);
        run_git(
            &[
                "worktree",
                "add",
                "-b",
                branch,
                path.to_str().unwrap(),
                base,
            ],
            repo,
        )
        .await
        .unwrap();
        path
    }

    #[tokio::test]
    async fn clean_merge_lands_in_base() {
        let (tmp, root) = testutil::init_repo().await;
        let ws = add_feature_worktree(&root, tmp.path(), "feat-a", "main").await;

        tokio::fs::write(ws.join("feature.txt"), "work\n").await.unwrap();
        testutil::commit_all(&ws, "feature work").await;

        let integrator = Integrator::new(root.clone());
        let outcome = integrator
            .integrate("feat-a", "main", 100, Some(&ws))
            .await
            .unwrap();

        assert!(outcome.success, "outcome: {outcome:?}");
        assert!(integrator.verify_merged("feat-a", "main").await.unwrap());
        assert!(root.join("feature.txt").exists());
    }

    #[tokio::test]
    async fn zero_diff_is_a_no_op_success() {
        let (tmp, root) = testutil::init_repo().await;
        let ws = add_feature_worktree(&root, tmp.path(), "feat-empty", "main").await;

        let integrator = Integrator::new(root.clone());
        let outcome = integrator
            .integrate("feat-empty", "main", 101, Some(&ws))
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.conflict_files.is_empty());
    }

    #[tokio::test]
    async fn conflict_is_reported_and_tree_left_clean() {
        let (tmp, root) = testutil::init_repo().await;
        let ws = add_feature_worktree(&root, tmp.path(), "feat-conflict", "main").await;

        tokio::fs::write(ws.join("README.md"), "# feature version\n")
            .await
            .unwrap();
        testutil::commit_all(&ws, "feature edit").await;

        tokio::fs::write(root.join("README.md"), "# mainline version\n")
            .await
            .unwrap();
        testutil::commit_all(&root, "mainline edit").await;

        let integrator = Integrator::new(root.clone());
        let outcome = integrator
            .integrate("feat-conflict", "main", 102, Some(&ws))
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome
            .conflict_files
            .iter()
            .any(|f| f.contains("README.md")));

        // No merge or rebase left in progress anywhere.
        assert!(!git::is_dirty(&root).await.unwrap());
        let abort = run_git_lenient(&["merge", "--abort"], &root).await.unwrap();
        assert!(!abort.success, "no merge should be in progress");
        let rebase_abort = run_git_lenient(&["rebase", "--abort"], &ws).await.unwrap();
        assert!(!rebase_abort.success, "no rebase should be in progress");
    }

    #[tokio::test]
    async fn advanced_base_triggers_rebase_then_merge() {
        let (tmp, root) = testutil::init_repo().await;
        let ws = add_feature_worktree(&root, tmp.path(), "feat-rebase", "main").await;

        tokio::fs::write(ws.join("feature.txt"), "work\n").await.unwrap();
        testutil::commit_all(&ws, "feature work").await;

        // Base advances with a non-conflicting commit after the cut.
        tokio::fs::write(root.join("base.txt"), "base\n").await.unwrap();
        testutil::commit_all(&root, "base advance").await;

        let integrator = Integrator::new(root.clone());
        let outcome = integrator
            .integrate("feat-rebase", "main", 103, Some(&ws))
            .await
            .unwrap();

        assert!(outcome.success, "outcome: {outcome:?}");
        assert!(root.join("feature.txt").exists());
        assert!(root.join("base.txt").exists());
    }

    #[tokio::test]
    async fn dirty_mainline_is_stashed_and_restored() {
        let (tmp, root) = testutil::init_repo().await;
        let ws = add_feature_worktree(&root, tmp.path(), "feat-stash", "main").await;

        tokio::fs::write(ws.join("feature.txt"), "work\n").await.unwrap();
        testutil::commit_all(&ws, "feature work").await;

        // Uncommitted local edit in the mainline tree.
        tokio::fs::write(root.join("scratch.txt"), "wip\n").await.unwrap();

        let integrator = Integrator::new(root.clone());
        let outcome = integrator
            .integrate("feat-stash", "main", 104, Some(&ws))
            .await
            .unwrap();
        assert!(outcome.success);

        // The edit survived and no tagged stash lingers.
        assert_eq!(
            tokio::fs::read_to_string(root.join("scratch.txt")).await.unwrap(),
            "wip\n"
        );
        let stashes = run_git(&["stash", "list"], &root).await.unwrap();
        assert!(!stashes.stdout.contains("foreman-pre-merge"));
    }

    #[tokio::test]
    async fn concurrent_integrations_serialize() {
        let (tmp, root) = testutil::init_repo().await;
        let ws_a = add_feature_worktree(&root, tmp.path(), "feat-one", "main").await;
        let ws_b = add_feature_worktree(&root, tmp.path(), "feat-two", "main").await;

        tokio::fs::write(ws_a.join("one.txt"), "1\n").await.unwrap();
        testutil::commit_all(&ws_a, "one").await;
        tokio::fs::write(ws_b.join("two.txt"), "2\n").await.unwrap();
        testutil::commit_all(&ws_b, "two").await;

        let integrator = std::sync::Arc::new(Integrator::new(root.clone()));
        let a = {
            let i = integrator.clone();
            let ws = ws_a.clone();
            tokio::spawn(async move { i.integrate("feat-one", "main", 1, Some(&ws)).await })
        };
        let b = {
            let i = integrator.clone();
            let ws = ws_b.clone();
            tokio::spawn(async move { i.integrate("feat-two", "main", 2, Some(&ws)).await })
        };

        assert!(a.await.unwrap().unwrap().success);
        assert!(b.await.unwrap().unwrap().success);
        assert!(root.join("one.txt").exists());
        assert!(root.join("two.txt").exists());
    }

    #[tokio::test]
    async fn uncommitted_engine_output_is_checkpointed() {
        let (tmp, root) = testutil::init_repo().await;
        let ws = add_feature_worktree(&root, tmp.path(), "feat-loose", "main").await;

        // Engine wrote a file but never committed.
        tokio::fs::write(ws.join("loose.txt"), "loose\n").await.unwrap();

        let integrator = Integrator::new(root.clone());
        let outcome = integrator
            .integrate("feat-loose", "main", 105, Some(&ws))
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(root.join("loose.txt").exists());
    }
}
