//! The `foreman run` entry point: lock, pre-flight, reap, schedule, audit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use foreman_core::config::ForemanConfig;
use foreman_core::coordinator::{Coordinator, ACQUIRE_RECHECK_DELAY};
use foreman_core::guardrails;
use foreman_core::prompt::FileLessons;
use foreman_core::reaper::Reaper;
use foreman_core::scheduler::{Scheduler, SchedulerDeps};
use foreman_core::tracker::{GhTracker, Tracker};
use foreman_core::workspace::WorkspaceManager;
use foreman_core::PRODUCT_PREFIX;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURES: i32 = 1;
pub const EXIT_PREFLIGHT: i32 = 2;
pub const EXIT_LOCK_LOST: i32 = 3;

pub async fn execute(
    label: &str,
    max_parallel: Option<usize>,
    config_path: Option<&Path>,
) -> Result<i32> {
    let mut config = match config_path {
        Some(path) => ForemanConfig::load(path).context("failed to load config")?,
        None => ForemanConfig::load_or_default(),
    };
    if let Some(n) = max_parallel {
        config.general.window_size = n;
    }
    config.validate().context("invalid config")?;

    let repo_root = discover_repo_root()?;

    // One process per label: acquire optimistically, then let the earlier
    // starter win after the documented recheck delay.
    let coordinator = Arc::new(Coordinator::new(label));
    coordinator.acquire_run_lock().await?;
    tokio::time::sleep(ACQUIRE_RECHECK_DELAY).await;
    if let Some(other) = coordinator.has_conflicting_instance().await? {
        eprintln!(
            "another foreman instance (pid {}) already owns label '{label}'",
            other.pid
        );
        coordinator.release_run_lock().await;
        return Ok(EXIT_LOCK_LOST);
    }

    let base_branch = config.general.base_branch.clone();
    if let Err(e) = guardrails::preflight(&repo_root, &base_branch).await {
        eprintln!("pre-flight failed: {e}");
        coordinator.release_run_lock().await;
        return Ok(EXIT_PREFLIGHT);
    }
    let started_branch = foreman_core::git::current_branch(&repo_root)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| "(detached)".to_string());

    // Clear the wreckage of prior runs before creating anything new.
    let temp_root = std::env::temp_dir().join(format!("{PRODUCT_PREFIX}-worktrees"));
    let reaper = Reaper::new(
        repo_root.clone(),
        temp_root,
        config.reaper.orphan_patterns.clone(),
    );
    let reap_report = reaper.reap().await;
    if reap_report.workspaces_removed > 0 || reap_report.processes_killed > 0 {
        info!(?reap_report, "reaped orphans from prior runs");
    }

    let tracker: Arc<dyn Tracker> = Arc::new(GhTracker::new(repo_root.clone()));
    let items = tracker
        .list_open_items(label)
        .await
        .context("failed to list work items")?;
    if items.is_empty() {
        println!("no open items with label '{label}'");
        coordinator.release_run_lock().await;
        return Ok(EXIT_OK);
    }
    info!(count = items.len(), label, "fetched work items");

    let scheduler = Scheduler::new(
        repo_root.clone(),
        label,
        config,
        items,
        SchedulerDeps {
            coordinator: coordinator.clone(),
            tracker,
            lessons: Arc::new(FileLessons),
            workspace_root: None,
        },
    );

    let signal_target = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; shutting down run");
            signal_target.kill().await;
        }
    });

    let summary = scheduler.run().await?;

    let workspaces = WorkspaceManager::new(repo_root.clone());
    match guardrails::post_run_audit(&repo_root, &started_branch, &workspaces).await {
        Ok(report) if !report.is_clean() => warn!(?report, "post-run audit found leftovers"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "post-run audit failed"),
    }

    coordinator.release_run_lock().await;

    println!(
        "{} done, {} failed, {} blocked (of {} items)",
        summary.done, summary.failed, summary.blocked, summary.total
    );
    Ok(if summary.all_succeeded() {
        EXIT_OK
    } else {
        EXIT_FAILURES
    })
}

/// Standalone orphan sweep: `foreman reap`.
pub async fn execute_reap() -> Result<i32> {
    let config = ForemanConfig::load_or_default();
    let repo_root = discover_repo_root()?;
    let temp_root = std::env::temp_dir().join(format!("{PRODUCT_PREFIX}-worktrees"));

    let reaper = Reaper::new(repo_root, temp_root, config.reaper.orphan_patterns);
    let report = reaper.reap().await;

    println!(
        "removed {} workspaces, deleted {} branches, killed {} processes",
        report.workspaces_removed, report.branches_deleted, report.processes_killed
    );
    for error in &report.errors {
        eprintln!("warning: {error}");
    }
    Ok(EXIT_OK)
}

fn discover_repo_root() -> Result<PathBuf> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .context("failed to run git rev-parse")?;

    if !output.status.success() {
        bail!("not inside a git repository");
    }

    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(PathBuf::from(root))
}
