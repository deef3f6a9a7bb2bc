//! Sliding-window scheduler: the part that has to get concurrency, failure
//! handling, cleanup and ordering right.
//!
//! One dedicated fill worker drains a signal channel; slot completions and
//! supervisor ticks send to it. This replaces any "if already filling,
//! return" guard, which would drop completion-driven fills.

pub mod slot;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ForemanConfig;
use crate::coordinator::Coordinator;
use crate::domain::{self, Domain};
use crate::engine::runner::EngineHandle;
use crate::engine::{EngineErrorKind, FallbackChain};
use crate::events::{EventBus, SchedulerEvent};
use crate::integrate::{Integrator, MergeOutcome};
use crate::prompt::{build_prompt, LessonStore};
use crate::tracker::{Tracker, WorkItem, BLOCKED_LABEL};
use crate::workspace::WorkspaceManager;
use crate::{ForemanError, Result};

use slot::{RunState, Slot, SlotStatus};

/// Margin added to the slot timeout for the outer task deadline, so a hung
/// slot can never retain its task handle forever.
const OUTER_DEADLINE_MARGIN: Duration = Duration::from_secs(10);

/// How often a still-overdue slot re-warns after the first warning.
const REWARN_INTERVAL_SECS: i64 = 60;

/// External collaborators injected into the scheduler.
pub struct SchedulerDeps {
    pub coordinator: Arc<Coordinator>,
    pub tracker: Arc<dyn Tracker>,
    pub lessons: Arc<dyn LessonStore>,
    /// Override for the worktree root; defaults to the system tempdir.
    pub workspace_root: Option<PathBuf>,
}

/// Final tally of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.blocked == 0
    }
}

enum AttemptOutcome {
    /// Integration landed; the slot is done.
    Done,
    /// Attempt failed but more remain.
    Retry {
        backoff: Option<Duration>,
        error: String,
    },
    /// Last attempt failed; comment/block and mark the slot failed.
    Terminal {
        error: String,
        comment: Option<String>,
        block: bool,
    },
    /// Shutdown observed mid-attempt.
    Shutdown(String),
}

/// The sliding-window scheduler for one run.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    run_id: Uuid,
    label: String,
    repo_root: PathBuf,
    config: ForemanConfig,
    workspaces: WorkspaceManager,
    integrator: Integrator,
    coordinator: Arc<Coordinator>,
    tracker: Arc<dyn Tracker>,
    lessons: Arc<dyn LessonStore>,
    bus: EventBus,
    queue: Mutex<VecDeque<WorkItem>>,
    slots: Mutex<Vec<Slot>>,
    engines: Mutex<HashMap<u64, EngineHandle>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    fill_tx: mpsc::UnboundedSender<()>,
    fill_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    next_slot_id: AtomicU64,
    total_items: usize,
    started_at: DateTime<Utc>,
}

impl Scheduler {
    pub fn new(
        repo_root: PathBuf,
        label: &str,
        config: ForemanConfig,
        items: Vec<WorkItem>,
        deps: SchedulerDeps,
    ) -> Self {
        let workspaces = match deps.workspace_root {
            Some(root) => WorkspaceManager::with_temp_root(repo_root.clone(), root),
            None => WorkspaceManager::new(repo_root.clone()),
        };
        let (shutdown_tx, _) = watch::channel(false);
        let (fill_tx, fill_rx) = mpsc::unbounded_channel();
        let total_items = items.len();

        Self {
            inner: Arc::new(Inner {
                run_id: Uuid::new_v4(),
                label: label.to_string(),
                repo_root: repo_root.clone(),
                config,
                workspaces,
                integrator: Integrator::new(repo_root),
                coordinator: deps.coordinator,
                tracker: deps.tracker,
                lessons: deps.lessons,
                bus: EventBus::default(),
                queue: Mutex::new(items.into()),
                slots: Mutex::new(Vec::new()),
                engines: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                shutdown_tx,
                fill_tx,
                fill_rx: Mutex::new(Some(fill_rx)),
                next_slot_id: AtomicU64::new(0),
                total_items,
                started_at: Utc::now(),
            }),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// Attach an event observer.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SchedulerEvent> {
        self.inner.bus.subscribe()
    }

    /// Snapshot of the current run state.
    pub fn state(&self) -> RunState {
        self.inner.state()
    }

    /// Drive the whole run to completion. Callable once.
    pub async fn run(&self) -> Result<RunSummary> {
        let inner = self.inner.clone();
        let mut fill_rx = inner
            .fill_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| ForemanError::Config("scheduler run() called twice".into()))?;

        inner.running.store(true, Ordering::SeqCst);
        info!(run_id = %inner.run_id, label = %inner.label, total = inner.total_items, "run starting");

        let tick_task = tokio::spawn(tick_loop(inner.clone()));

        let mut slot_tasks: JoinSet<()> = JoinSet::new();
        let _ = inner.fill_tx.send(());

        loop {
            tokio::select! {
                maybe = fill_rx.recv() => {
                    match maybe {
                        Some(()) => {
                            // Coalesce queued signals into one fill pass.
                            while fill_rx.try_recv().is_ok() {}
                            fill_slots(&inner, &mut slot_tasks).await;
                        }
                        None => break,
                    }
                }
                Some(res) = slot_tasks.join_next(), if !slot_tasks.is_empty() => {
                    if let Err(e) = res {
                        warn!(error = %e, "slot task panicked");
                    }
                }
            }

            let queue_empty = inner.queue.lock().unwrap_or_else(|p| p.into_inner()).is_empty();
            let stopping = !inner.running.load(Ordering::SeqCst);
            if (queue_empty || stopping) && slot_tasks.is_empty() {
                break;
            }
        }

        while slot_tasks.join_next().await.is_some() {}
        tick_task.abort();

        let state = inner.state();
        let summary = RunSummary {
            total: inner.total_items,
            done: state.completed_count,
            failed: state.failed_count,
            blocked: state.blocked_count,
        };
        inner.bus.publish(SchedulerEvent::BatchComplete {
            total: summary.total,
            done: summary.done,
            failed: summary.failed,
            blocked: summary.blocked,
            at: Utc::now(),
        });
        info!(run_id = %inner.run_id, ?summary, "run complete");
        Ok(summary)
    }

    /// Shut the run down: stop filling, kill every registered engine, let
    /// in-flight slots observe the flag and clean up.
    pub async fn kill(&self) {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);
        let _ = inner.shutdown_tx.send(true);

        let handles: Vec<(u64, EngineHandle)> = {
            let mut engines = inner.engines.lock().unwrap_or_else(|p| p.into_inner());
            engines.drain().collect()
        };
        for (slot_id, handle) in handles {
            inner.bus.publish(SchedulerEvent::EngineKill {
                slot_id,
                issue: handle.issue(),
                engine: handle.engine().to_string(),
                reason: "scheduler shutdown".into(),
                at: Utc::now(),
            });
            handle.kill().await;
        }
        let _ = inner.fill_tx.send(());
        info!(run_id = %inner.run_id, "scheduler shutdown requested");
    }
}

impl Inner {
    fn state(&self) -> RunState {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner()).clone();
        RunState::new(
            self.config.general.window_size,
            slots,
            self.total_items,
            self.started_at,
        )
    }

    fn update_slot<F: FnOnce(&mut Slot)>(&self, slot_id: u64, f: F) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = slots.iter_mut().find(|s| s.id == slot_id) {
            f(slot);
        }
    }

    fn read_slot<T, F: FnOnce(&Slot) -> T>(&self, slot_id: u64, f: F) -> Option<T> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.iter().find(|s| s.id == slot_id).map(f)
    }

    fn publish_dashboard(&self) {
        self.bus.publish(SchedulerEvent::Dashboard {
            state: self.state(),
            at: Utc::now(),
        });
    }

    fn slot_window_view(&self) -> (usize, Vec<Domain>) {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        let occupied = slots.iter().filter(|s| !s.status.is_terminal()).count();
        let domains = slots
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.domain)
            .collect::<Vec<_>>();
        (occupied, domains)
    }

    /// One slot from claim to terminal status. The tail of this function is
    /// the guaranteed-execute block: claim release, terminal event, refill.
    async fn run_slot(self: Arc<Self>, slot_id: u64, item: WorkItem, item_domain: Domain) {
        let issue = item.number;
        self.attempt_loop(slot_id, &item, item_domain).await;

        self.engines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&slot_id);
        self.coordinator.release_item(issue).await;

        let (status, attempts, error) = self
            .read_slot(slot_id, |s| (s.status, s.attempt + 1, s.last_error.clone()))
            .unwrap_or((SlotStatus::Failed, 0, None));
        self.bus.publish(SchedulerEvent::SlotDone {
            slot_id,
            issue,
            status,
            attempts,
            error,
            at: Utc::now(),
        });
        let _ = self.fill_tx.send(());
    }

    async fn attempt_loop(&self, slot_id: u64, item: &WorkItem, item_domain: Domain) {
        let issue = item.number;
        let slug = domain::slugify(&item.title);
        let max_attempts = self.config.general.max_attempts;
        let mut attempt: u32 = 0;

        while attempt < max_attempts {
            if !self.running.load(Ordering::SeqCst) {
                self.cleanup_slot_workspace(slot_id, true).await;
                self.finish_slot(slot_id, SlotStatus::Failed, Some("scheduler shutdown".into()));
                return;
            }

            self.update_slot(slot_id, |s| s.attempt = attempt);
            let last_attempt = attempt + 1 >= max_attempts;
            let outcome = self
                .run_attempt(slot_id, item, item_domain, &slug, attempt, last_attempt)
                .await;

            // Guaranteed per-attempt cleanup: the engine registration never
            // outlives the attempt that created it.
            self.engines
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&slot_id);

            match outcome {
                AttemptOutcome::Done => {
                    self.cleanup_slot_workspace(slot_id, true).await;
                    self.finish_slot(slot_id, SlotStatus::Done, None);
                    return;
                }
                AttemptOutcome::Shutdown(reason) => {
                    self.cleanup_slot_workspace(slot_id, true).await;
                    self.finish_slot(slot_id, SlotStatus::Failed, Some(reason));
                    return;
                }
                AttemptOutcome::Terminal {
                    error,
                    comment,
                    block,
                } => {
                    if let Some(text) = comment {
                        let text = truncate_comment(&text, self.config.general.comment_width);
                        if let Err(e) = self.tracker.comment(issue, &text).await {
                            warn!(issue, error = %e, "failed to comment on failed item");
                        }
                    }
                    if block {
                        if let Err(e) = self.tracker.add_label(issue, BLOCKED_LABEL).await {
                            warn!(issue, error = %e, "failed to label blocked item");
                        }
                    }
                    self.cleanup_slot_workspace(slot_id, true).await;
                    self.finish_slot(slot_id, SlotStatus::Failed, Some(error));
                    return;
                }
                AttemptOutcome::Retry { backoff, error } => {
                    debug!(issue, attempt, %error, "attempt failed; retrying");
                    self.update_slot(slot_id, |s| {
                        s.last_error = Some(error);
                        s.status = SlotStatus::Pending;
                    });
                    self.cleanup_slot_workspace(slot_id, false).await;
                    if let Some(backoff) = backoff {
                        // Cancellable: shutdown must not wait out the backoff.
                        let mut shutdown_rx = self.shutdown_tx.subscribe();
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown_rx.wait_for(|stop| *stop) => {}
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        slot_id: u64,
        item: &WorkItem,
        item_domain: Domain,
        slug: &str,
        attempt: u32,
        last_attempt: bool,
    ) -> AttemptOutcome {
        let issue = item.number;
        let base = self.config.general.base_branch.clone();
        let max_attempts = self.config.general.max_attempts;

        let ws = match self.workspaces.create(&base, issue, slug, attempt).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(issue, attempt, error = %e, "workspace creation failed");
                let error = format!("workspace creation failed: {e}");
                return if last_attempt {
                    AttemptOutcome::Terminal {
                        comment: Some(format!(
                            "Automated run failed after {max_attempts} attempts. Last error: {error}"
                        )),
                        error,
                        block: false,
                    }
                } else {
                    AttemptOutcome::Retry {
                        backoff: None,
                        error,
                    }
                };
            }
        };

        self.update_slot(slot_id, |s| {
            s.branch = Some(ws.branch.clone());
            s.workspace_path = Some(ws.path.clone());
            s.status = SlotStatus::Running;
        });
        self.publish_dashboard();
        if let Err(e) = self.tracker.set_board_branch(issue, &ws.branch).await {
            debug!(issue, error = %e, "board branch update failed");
        }

        let lessons_text = match self.lessons.propagate(&self.repo_root, &ws.path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(issue, error = %e, "lessons propagation failed; continuing without");
                None
            }
        };
        let prompt = build_prompt(
            item,
            item_domain,
            &self.config.general.prompt_preamble,
            lessons_text.as_deref(),
        );

        let chain = FallbackChain::new(
            self.config.engine_order(),
            Duration::from_secs(self.config.general.engine_timeout_seconds),
        );
        let result = chain
            .run(&prompt, &ws.path, issue, slot_id, &self.bus, |handle| {
                self.engines
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(slot_id, handle);
            })
            .await;
        self.engines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&slot_id);
        self.update_slot(slot_id, |s| s.engine = Some(result.engine.clone()));

        if !self.running.load(Ordering::SeqCst) {
            return AttemptOutcome::Shutdown("scheduler shutdown".into());
        }

        // A successful engine claim is only real when the tree agrees.
        let has_changes = if result.success {
            self.workspaces
                .has_changes(&ws.path, &base)
                .await
                .unwrap_or(!result.no_changes)
        } else {
            false
        };
        let stuck = result.success && !has_changes;

        if has_changes {
            self.update_slot(slot_id, |s| s.status = SlotStatus::Merging);
            self.publish_dashboard();

            let outcome = match self
                .integrator
                .integrate(&ws.branch, &base, issue, Some(&ws.path))
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => MergeOutcome {
                    success: false,
                    error: Some(e.to_string()),
                    conflict_files: Vec::new(),
                },
            };
            self.bus.publish(SchedulerEvent::MergeResult {
                slot_id,
                issue,
                branch: ws.branch.clone(),
                attempt,
                success: outcome.success,
                error: outcome.error.clone(),
                conflict_files: outcome.conflict_files.clone(),
                at: Utc::now(),
            });

            if outcome.success {
                // Tracker updates are per-item; they stay outside the
                // integration mutex by construction.
                if let Err(e) = self.tracker.close(issue).await {
                    warn!(issue, error = %e, "failed to close integrated item");
                }
                if let Err(e) = self.lessons.merge_back(&self.repo_root, &ws.path).await {
                    warn!(issue, error = %e, "lessons merge-back failed");
                }
                self.update_slot(slot_id, |s| s.merged = true);
                return AttemptOutcome::Done;
            }

            let detail = outcome
                .error
                .unwrap_or_else(|| "integration failed".to_string());
            let error = format!("Merge failed: {detail}");
            return if last_attempt {
                let mut comment = format!("Merge failed: {detail}");
                if !outcome.conflict_files.is_empty() {
                    comment.push_str(&format!(
                        "\n\nConflicting files:\n{}",
                        outcome
                            .conflict_files
                            .iter()
                            .map(|f| format!("- {f}"))
                            .collect::<Vec<_>>()
                            .join("\n")
                    ));
                }
                AttemptOutcome::Terminal {
                    error,
                    comment: Some(comment),
                    block: true,
                }
            } else {
                AttemptOutcome::Retry {
                    backoff: None,
                    error,
                }
            };
        }

        if result.error_kind == Some(EngineErrorKind::RateLimit) {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "engine rate limited".to_string());
            return if last_attempt {
                AttemptOutcome::Terminal {
                    comment: Some(format!(
                        "Rate limited on every attempt; giving up after {max_attempts} attempts."
                    )),
                    error,
                    block: false,
                }
            } else {
                AttemptOutcome::Retry {
                    backoff: Some(Duration::from_secs(
                        self.config.general.rate_limit_backoff_seconds,
                    )),
                    error,
                }
            };
        }

        if stuck {
            let error = "engine reported success but produced no changes".to_string();
            return if last_attempt {
                AttemptOutcome::Terminal {
                    comment: Some(format!(
                        "Engine reported success but produced no changes in any of \
                         {max_attempts} attempts."
                    )),
                    error,
                    block: false,
                }
            } else {
                AttemptOutcome::Retry {
                    backoff: None,
                    error,
                }
            };
        }

        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "engine failed".to_string());
        if last_attempt {
            AttemptOutcome::Terminal {
                comment: Some(format!(
                    "Automated run failed after {max_attempts} attempts. Last error: {error}"
                )),
                error,
                block: false,
            }
        } else {
            AttemptOutcome::Retry {
                backoff: None,
                error,
            }
        }
    }

    /// Remove the slot's workspace. The path is only nulled once removal is
    /// confirmed, so a failed cleanup leaves the orphan findable.
    async fn cleanup_slot_workspace(&self, slot_id: u64, terminal: bool) {
        let Some((branch, path)) = self.read_slot(slot_id, |s| {
            (s.branch.clone(), s.workspace_path.clone())
        }) else {
            return;
        };
        let Some(branch) = branch else { return };

        let removed = match path {
            Some(path) => {
                if terminal {
                    self.workspaces.remove(&path, &branch, true).await
                } else {
                    self.workspaces.cleanup_for_retry(Some(&path), &branch).await
                }
            }
            None => self.workspaces.cleanup_for_retry(None, &branch).await,
        };

        if removed {
            self.update_slot(slot_id, |s| s.workspace_path = None);
        } else {
            warn!(slot_id, %branch, "workspace cleanup incomplete; path retained for reaping");
        }
    }

    fn finish_slot(&self, slot_id: u64, status: SlotStatus, error: Option<String>) {
        self.update_slot(slot_id, |s| {
            if s.status.is_terminal() {
                return;
            }
            s.status = status;
            s.finished_at = Some(Utc::now());
            if error.is_some() {
                s.last_error = error;
            }
        });
    }

    fn add_blocked_slot(&self, item: &WorkItem, item_domain: Domain, reason: &str) {
        let slot_id = self.next_slot_id.fetch_add(1, Ordering::SeqCst);
        let mut blocked = Slot::new(slot_id, item, item_domain, self.config.general.max_attempts);
        blocked.status = SlotStatus::Blocked;
        blocked.finished_at = Some(Utc::now());
        blocked.last_error = Some(reason.to_string());
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(blocked);
        self.bus.publish(SchedulerEvent::SlotDone {
            slot_id,
            issue: item.number,
            status: SlotStatus::Blocked,
            attempts: 0,
            error: Some(reason.to_string()),
            at: Utc::now(),
        });
    }

    /// Last-resort bookkeeping when a slot task blew through its outer
    /// deadline and was dropped mid-flight.
    async fn force_abandon_slot(&self, slot_id: u64, issue: u64) {
        let handle = self
            .engines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&slot_id);
        if let Some(handle) = handle {
            self.bus.publish(SchedulerEvent::EngineKill {
                slot_id,
                issue,
                engine: handle.engine().to_string(),
                reason: "slot outer deadline".into(),
                at: Utc::now(),
            });
            handle.kill().await;
        }
        self.cleanup_slot_workspace(slot_id, true).await;
        self.finish_slot(
            slot_id,
            SlotStatus::Failed,
            Some("slot exceeded its hard deadline".into()),
        );
        self.coordinator.release_item(issue).await;
        let (status, attempts, error) = self
            .read_slot(slot_id, |s| (s.status, s.attempt + 1, s.last_error.clone()))
            .unwrap_or((SlotStatus::Failed, 0, None));
        self.bus.publish(SchedulerEvent::SlotDone {
            slot_id,
            issue,
            status,
            attempts,
            error,
            at: Utc::now(),
        });
        let _ = self.fill_tx.send(());
    }
}

/// Pull compatible items from the queue until the window is full. Runs only
/// on the dedicated fill worker inside [`Scheduler::run`].
async fn fill_slots(inner: &Arc<Inner>, slot_tasks: &mut JoinSet<()>) {
    loop {
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }

        let window = inner.config.general.window_size;
        let (occupied, active_domains) = inner.slot_window_view();
        if occupied >= window {
            return;
        }

        let picked = {
            let mut queue = inner.queue.lock().unwrap_or_else(|p| p.into_inner());
            pick_next(&mut queue, &active_domains)
        };
        let Some((item, item_domain)) = picked else {
            return;
        };
        let issue = item.number;

        // Someone upstream may already be on it.
        match inner.tracker.is_claimed_upstream(issue).await {
            Ok(true) => {
                info!(issue, "item already assigned or in progress upstream; skipping");
                continue;
            }
            Ok(false) => {}
            Err(e) => warn!(issue, error = %e, "upstream claim check failed; proceeding"),
        }

        // Reopen loops mean the work keeps bouncing; block instead of
        // burning attempts forever.
        match inner.tracker.reopen_count(issue).await {
            Ok(n) if n > inner.config.general.max_reopen_cycles => {
                warn!(issue, cycles = n, "reopen loop detected; blocking item");
                let _ = inner
                    .tracker
                    .comment(
                        issue,
                        &format!(
                            "Blocked: this issue has been closed and reopened {n} times; \
                             it needs manual triage."
                        ),
                    )
                    .await;
                let _ = inner.tracker.add_label(issue, BLOCKED_LABEL).await;
                inner.add_blocked_slot(&item, item_domain, "reopen loop detected");
                continue;
            }
            Ok(_) => {}
            Err(e) => warn!(issue, error = %e, "reopen check failed; proceeding"),
        }

        // Cross-process claim.
        match inner.coordinator.claim_item(issue).await {
            Ok(true) => {}
            Ok(false) => {
                info!(issue, "item claimed by another process; skipping");
                continue;
            }
            Err(e) => {
                warn!(issue, error = %e, "item claim failed; skipping");
                continue;
            }
        }

        let slot_id = inner.next_slot_id.fetch_add(1, Ordering::SeqCst);
        let slot = Slot::new(slot_id, &item, item_domain, inner.config.general.max_attempts);
        inner
            .slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(slot);
        inner.bus.publish(SchedulerEvent::SlotFill {
            slot_id,
            issue,
            title: item.title.clone(),
            domain: item_domain,
            at: Utc::now(),
        });
        debug!(slot_id, issue, domain = %item_domain, "slot filled");

        let task_inner = inner.clone();
        let outer_deadline =
            Duration::from_secs(inner.config.general.slot_timeout_seconds) + OUTER_DEADLINE_MARGIN;
        slot_tasks.spawn(async move {
            let slot_fut = task_inner.clone().run_slot(slot_id, item, item_domain);
            if tokio::time::timeout(outer_deadline, slot_fut).await.is_err() {
                warn!(slot_id, issue, "slot exceeded its outer deadline; abandoning");
                task_inner.force_abandon_slot(slot_id, issue).await;
            }
        });
    }
}

/// Periodic supervision: kill engines of slots past the hard timeout, warn
/// about long runners, and nudge the fill worker.
async fn tick_loop(inner: Arc<Inner>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_warned: HashMap<u64, DateTime<Utc>> = HashMap::new();

    let hard = chrono::Duration::seconds(inner.config.general.slot_timeout_seconds as i64);
    let warn_after = chrono::Duration::seconds(inner.config.general.slot_warn_seconds as i64);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_rx.wait_for(|stop| *stop) => return,
        }

        let now = Utc::now();
        let running: Vec<(u64, u64, chrono::Duration)> = {
            let slots = inner.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots
                .iter()
                .filter(|s| s.status == SlotStatus::Running)
                .map(|s| (s.id, s.issue, now.signed_duration_since(s.started_at)))
                .collect()
        };

        for (slot_id, issue, elapsed) in running {
            if elapsed > hard {
                let handle = inner
                    .engines
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&slot_id);
                if let Some(handle) = handle {
                    warn!(slot_id, issue, elapsed_secs = elapsed.num_seconds(), "slot hard timeout; killing engine");
                    inner.bus.publish(SchedulerEvent::EngineKill {
                        slot_id,
                        issue,
                        engine: handle.engine().to_string(),
                        reason: "slot timeout".into(),
                        at: Utc::now(),
                    });
                    // Kill in the background; the grace period must not
                    // stall the tick.
                    tokio::spawn(async move { handle.kill().await });
                }
            } else if elapsed > warn_after {
                let rewarn_due = last_warned
                    .get(&slot_id)
                    .map(|t| now.signed_duration_since(*t).num_seconds() >= REWARN_INTERVAL_SECS)
                    .unwrap_or(true);
                if rewarn_due {
                    warn!(slot_id, issue, elapsed_secs = elapsed.num_seconds(), "slot running long");
                    last_warned.insert(slot_id, now);
                }
            }
        }

        let _ = inner.fill_tx.send(());
    }
}

/// Select the next runnable item: first queue entry whose domain is
/// compatible with every active slot. When nothing is compatible but the
/// window is idle, the head runs anyway; it only ever waits on itself.
fn pick_next(queue: &mut VecDeque<WorkItem>, active: &[Domain]) -> Option<(WorkItem, Domain)> {
    let mut found: Option<(usize, Domain)> = None;
    for (i, item) in queue.iter().enumerate() {
        let d = domain::classify(&item.labels, &item.title);
        if active.iter().all(|a| domain::can_run_parallel(d, *a)) {
            found = Some((i, d));
            break;
        }
    }

    match found {
        Some((i, d)) => queue.remove(i).map(|item| (item, d)),
        None if active.is_empty() => queue.pop_front().map(|item| {
            let d = domain::classify(&item.labels, &item.title);
            (item, d)
        }),
        None => None,
    }
}

fn truncate_comment(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let truncated: String = text.chars().take(width).collect();
    format!("{truncated}…")
}
