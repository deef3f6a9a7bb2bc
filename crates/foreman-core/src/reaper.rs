//! Detection and cleanup of resources stranded by dead runs.
//!
//! Two sweeps: worktrees/branches whose encoded owner pid is gone, and
//! engine-spawned child processes (watchers and the like) still parked under
//! the foreman temp root. Both sweeps tolerate permission errors.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coordinator::pid_alive;
use crate::workspace::{parse_branch, WorkspaceManager};

/// Summary of one reaper pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReapReport {
    pub workspaces_removed: u32,
    pub branches_deleted: u32,
    pub processes_killed: u32,
    pub errors: Vec<String>,
}

/// Sweeps stranded workspaces, branches and processes from prior runs.
pub struct Reaper {
    workspaces: WorkspaceManager,
    temp_root: PathBuf,
    orphan_patterns: Vec<String>,
}

impl Reaper {
    pub fn new(repo_root: PathBuf, temp_root: PathBuf, orphan_patterns: Vec<String>) -> Self {
        Self {
            workspaces: WorkspaceManager::with_temp_root(repo_root, temp_root.clone()),
            temp_root,
            orphan_patterns,
        }
    }

    /// Run both sweeps. Individual failures land in the report, never abort
    /// the pass.
    pub async fn reap(&self) -> ReapReport {
        let mut report = ReapReport::default();
        self.sweep_workspaces(&mut report).await;
        self.sweep_processes(&mut report).await;
        info!(
            workspaces = report.workspaces_removed,
            processes = report.processes_killed,
            errors = report.errors.len(),
            "orphan reap complete"
        );
        report
    }

    /// Remove every foreman workspace whose encoded pid is no longer alive.
    async fn sweep_workspaces(&self, report: &mut ReapReport) {
        let listed = match self.workspaces.list().await {
            Ok(listed) => listed,
            Err(e) => {
                report.errors.push(format!("workspace listing failed: {e}"));
                return;
            }
        };

        for ws in listed {
            let Some(parts) = parse_branch(&ws.branch) else {
                continue;
            };
            if pid_alive(parts.pid) {
                debug!(branch = %ws.branch, pid = parts.pid, "owner still alive; keeping");
                continue;
            }
            warn!(branch = %ws.branch, pid = parts.pid, "reaping orphaned workspace");
            if self.workspaces.remove(&ws.path, &ws.branch, true).await {
                report.workspaces_removed += 1;
                report.branches_deleted += 1;
            } else {
                report
                    .errors
                    .push(format!("failed to remove orphaned workspace {}", ws.path.display()));
            }
        }
    }

    /// Terminate likely-orphan child processes working under our temp root.
    ///
    /// A process qualifies only when its command matches a configured
    /// pattern, its cwd is under the temp root, and its parent is init or
    /// this process. Self and init are never touched.
    #[cfg(target_os = "linux")]
    async fn sweep_processes(&self, report: &mut ReapReport) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let listing = match tokio::process::Command::new("ps")
            .args(["-eo", "pid=,ppid=,args="])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).to_string()
            }
            Ok(output) => {
                report.errors.push(format!(
                    "ps failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ));
                return;
            }
            Err(e) => {
                report.errors.push(format!("failed to run ps: {e}"));
                return;
            }
        };

        let self_pid = std::process::id();
        let mut victims = Vec::new();

        for line in listing.lines() {
            let mut fields = line.split_whitespace();
            let Some(pid) = fields.next().and_then(|f| f.parse::<u32>().ok()) else {
                continue;
            };
            let Some(ppid) = fields.next().and_then(|f| f.parse::<u32>().ok()) else {
                continue;
            };
            let args = fields.collect::<Vec<_>>().join(" ");
            let args = args.as_str();

            if pid == self_pid || pid == 1 {
                continue;
            }
            if ppid != 1 && ppid != self_pid {
                continue;
            }
            if !self.orphan_patterns.iter().any(|p| args.contains(p.as_str())) {
                continue;
            }
            // cwd must be under our temp root; unreadable cwd means skip.
            let cwd = match tokio::fs::read_link(format!("/proc/{pid}/cwd")).await {
                Ok(cwd) => cwd,
                Err(e) => {
                    debug!(pid, error = %e, "cannot read process cwd; skipping");
                    continue;
                }
            };
            if !cwd.starts_with(&self.temp_root) {
                continue;
            }
            victims.push((pid, args.to_string()));
        }

        if victims.is_empty() {
            return;
        }

        for (pid, args) in &victims {
            warn!(pid, command = %args, "terminating likely-orphan process");
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGTERM);
        }

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        for (pid, _) in &victims {
            if pid_alive(*pid) {
                let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
            }
            report.processes_killed += 1;
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn sweep_processes(&self, _report: &mut ReapReport) {
        debug!("process sweep is only implemented on linux; skipping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{run_git, testutil};
    use crate::workspace::branch_name;

    /// Pid of a process that has already exited.
    async fn dead_pid() -> u32 {
        let mut child = tokio::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id().expect("child pid");
        let _ = child.wait().await;
        pid
    }

    #[tokio::test]
    async fn dead_owner_workspace_is_reaped() {
        let (tmp, root) = testutil::init_repo().await;
        let temp_root = tmp.path().join("wt");
        tokio::fs::create_dir_all(&temp_root).await.unwrap();

        // Fabricate a workspace whose branch encodes a dead pid.
        let branch = branch_name(dead_pid().await, 55, "stranded", 0, 0);
        let path = temp_root.join("stranded-ws");
        run_git(
            &[
                "worktree",
                "add",
                "-b",
                &branch,
                path.to_str().unwrap(),
                "main",
            ],
            &root,
        )
        .await
        .unwrap();

        let reaper = Reaper::new(root.clone(), temp_root, vec![]);
        let report = reaper.reap().await;

        assert_eq!(report.workspaces_removed, 1);
        assert!(!path.exists());
        assert!(!crate::git::branch_exists(&root, &branch).await.unwrap());
    }

    #[tokio::test]
    async fn live_owner_workspace_survives() {
        let (tmp, root) = testutil::init_repo().await;
        let temp_root = tmp.path().join("wt");

        let mgr = WorkspaceManager::with_temp_root(root.clone(), temp_root.clone());
        let ws = mgr.create("main", 56, "mine", 0).await.unwrap();

        let reaper = Reaper::new(root.clone(), temp_root, vec![]);
        let report = reaper.reap().await;

        assert_eq!(report.workspaces_removed, 0);
        assert!(ws.path.exists());
        mgr.remove(&ws.path, &ws.branch, true).await;
    }

    #[tokio::test]
    async fn non_foreman_worktrees_are_ignored() {
        let (tmp, root) = testutil::init_repo().await;
        let temp_root = tmp.path().join("wt");
        tokio::fs::create_dir_all(&temp_root).await.unwrap();

        let path = temp_root.join("user-worktree");
        run_git(
            &[
                "worktree",
                "add",
                "-b",
                "user/topic",
                path.to_str().unwrap(),
                "main",
            ],
            &root,
        )
        .await
        .unwrap();

        let reaper = Reaper::new(root.clone(), temp_root, vec![]);
        let report = reaper.reap().await;

        assert_eq!(report.workspaces_removed, 0);
        assert!(path.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn matching_child_process_under_temp_root_is_killed() {
        let (tmp, root) = testutil::init_repo().await;
        let temp_root = tmp.path().join("wt");
        tokio::fs::create_dir_all(&temp_root).await.unwrap();

        let mut child = tokio::process::Command::new("sleep")
            .arg("300")
            .current_dir(&temp_root)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let reaper = Reaper::new(root.clone(), temp_root, vec!["sleep 300".into()]);
        let report = reaper.reap().await;

        assert_eq!(report.processes_killed, 1);
        let _ = child.wait().await;
        assert!(!pid_alive(pid));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn process_outside_temp_root_is_spared() {
        let (tmp, root) = testutil::init_repo().await;
        let temp_root = tmp.path().join("wt");
        tokio::fs::create_dir_all(&temp_root).await.unwrap();
        let elsewhere = tmp.path().join("elsewhere");
        tokio::fs::create_dir_all(&elsewhere).await.unwrap();

        let mut child = tokio::process::Command::new("sleep")
            .arg("301")
            .current_dir(&elsewhere)
            .spawn()
            .unwrap();

        let reaper = Reaper::new(root.clone(), temp_root, vec!["sleep 301".into()]);
        let report = reaper.reap().await;

        assert_eq!(report.processes_killed, 0);
        child.kill().await.unwrap();
        let _ = child.wait().await;
    }
}
