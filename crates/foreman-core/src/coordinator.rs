//! Cross-process coordination via filesystem locks.
//!
//! Two lock kinds live in `<tempdir>/foreman-locks/`: run locks (one per
//! scheduler process, keyed by run label) and item claims (one per issue).
//! Both persist the owner pid so a later process can reap them once the
//! owner is gone.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::workspace::sanitize_component;
use crate::{ForemanError, Result, PRODUCT_PREFIX};

/// Interval callers MUST sleep after [`Coordinator::acquire_run_lock`]
/// before calling [`Coordinator::has_conflicting_instance`], so concurrent
/// lockers are guaranteed to see each other's records.
pub const ACQUIRE_RECHECK_DELAY: Duration = Duration::from_millis(250);

/// On-disk body of a run lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLockRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub label: String,
}

/// On-disk body of an item claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemLockRecord {
    pub pid: u32,
    pub issue: u64,
    pub claimed_at: DateTime<Utc>,
}

/// Coordinator for one run label.
pub struct Coordinator {
    locks_dir: PathBuf,
    label: String,
    pid: u32,
    own: OnceLock<RunLockRecord>,
}

impl Coordinator {
    /// Coordinator using the default locks directory under the system tempdir.
    pub fn new(label: &str) -> Self {
        let locks_dir = std::env::temp_dir().join(format!("{PRODUCT_PREFIX}-locks"));
        Self::with_locks_dir(label, locks_dir)
    }

    pub fn with_locks_dir(label: &str, locks_dir: PathBuf) -> Self {
        Self {
            locks_dir,
            label: label.to_string(),
            pid: std::process::id(),
            own: OnceLock::new(),
        }
    }

    /// Override the owner pid recorded in lock files. Exists so cross-process
    /// races can be exercised from a single test process.
    pub fn with_owner_pid(label: &str, locks_dir: PathBuf, pid: u32) -> Self {
        Self {
            locks_dir,
            label: label.to_string(),
            pid,
            own: OnceLock::new(),
        }
    }

    fn run_lock_path(&self) -> PathBuf {
        let label = sanitize_component(&self.label);
        self.locks_dir.join(format!("{label}-{}.lock", self.pid))
    }

    fn item_lock_path(&self, issue: u64) -> PathBuf {
        self.locks_dir.join(format!("issue-{issue}.lock"))
    }

    // -----------------------------------------------------------------------
    // Run lock
    // -----------------------------------------------------------------------

    /// Write this process's run-lock record.
    ///
    /// Acquisition is optimistic: after calling this, sleep
    /// [`ACQUIRE_RECHECK_DELAY`] and then call
    /// [`Self::has_conflicting_instance`]; the earlier starter (pid as
    /// tie-break) wins and the loser must release and exit.
    pub async fn acquire_run_lock(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.locks_dir)
            .await
            .map_err(|e| ForemanError::Lock(format!("failed to create locks dir: {e}")))?;

        let record = RunLockRecord {
            pid: self.pid,
            started_at: Utc::now(),
            label: self.label.clone(),
        };
        let body = serde_json::to_string_pretty(&record)
            .map_err(|e| ForemanError::Lock(format!("failed to serialize run lock: {e}")))?;
        tokio::fs::write(self.run_lock_path(), body)
            .await
            .map_err(|e| ForemanError::Lock(format!("failed to write run lock: {e}")))?;

        info!(label = %self.label, pid = self.pid, "run lock acquired");
        let _ = self.own.set(record);
        Ok(())
    }

    /// First live run-lock record that outranks ours for this label, if any.
    ///
    /// Records whose owning pid no longer exists are stale: they are deleted
    /// and ignored. Ranking is `(started_at, pid)` ascending, so of two
    /// simultaneous starters the lower pid wins.
    pub async fn has_conflicting_instance(&self) -> Result<Option<RunLockRecord>> {
        let own = self
            .own
            .get()
            .ok_or_else(|| ForemanError::Lock("run lock not acquired".into()))?;

        let mut conflicts = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.locks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ForemanError::Lock(format!("failed to read locks dir: {e}"))),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ForemanError::Lock(format!("failed to read locks dir entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            let Ok(body) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            // Item claims live in the same directory; their body shape
            // does not parse as a run-lock record.
            let Ok(record) = serde_json::from_str::<RunLockRecord>(&body) else {
                continue;
            };
            if record.label != self.label || record.pid == own.pid {
                continue;
            }
            if !pid_alive(record.pid) {
                warn!(pid = record.pid, path = %path.display(), "reaping stale run lock");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            conflicts.push(record);
        }

        conflicts.sort_by_key(|r| (r.started_at, r.pid));
        Ok(conflicts
            .into_iter()
            .find(|r| (r.started_at, r.pid) < (own.started_at, own.pid)))
    }

    /// Remove this process's run-lock record. Safe to call twice.
    pub async fn release_run_lock(&self) {
        match tokio::fs::remove_file(self.run_lock_path()).await {
            Ok(()) => debug!(label = %self.label, "run lock released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(label = %self.label, error = %e, "failed to release run lock"),
        }
    }

    // -----------------------------------------------------------------------
    // Item claims
    // -----------------------------------------------------------------------

    /// Atomically claim one issue. Returns false when another live process
    /// holds it; a claim whose owner died is reaped and re-taken.
    pub async fn claim_item(&self, issue: u64) -> Result<bool> {
        tokio::fs::create_dir_all(&self.locks_dir)
            .await
            .map_err(|e| ForemanError::Lock(format!("failed to create locks dir: {e}")))?;

        if self.try_create_item_lock(issue).await? {
            return Ok(true);
        }

        // Existing claim: reap it if the owner is gone, then retry once.
        let path = self.item_lock_path(issue);
        let stale = match tokio::fs::read_to_string(&path).await {
            Ok(body) => serde_json::from_str::<ItemLockRecord>(&body)
                .map(|r| !pid_alive(r.pid))
                .unwrap_or(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(_) => false,
        };
        if !stale {
            return Ok(false);
        }
        warn!(issue, "reaping orphaned item claim");
        let _ = tokio::fs::remove_file(&path).await;
        self.try_create_item_lock(issue).await
    }

    /// Unconditionally release an item claim.
    pub async fn release_item(&self, issue: u64) {
        match tokio::fs::remove_file(self.item_lock_path(issue)).await {
            Ok(()) => debug!(issue, "item claim released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(issue, error = %e, "failed to release item claim"),
        }
    }

    async fn try_create_item_lock(&self, issue: u64) -> Result<bool> {
        let record = ItemLockRecord {
            pid: self.pid,
            issue,
            claimed_at: Utc::now(),
        };
        let body = serde_json::to_string(&record)
            .map_err(|e| ForemanError::Lock(format!("failed to serialize item claim: {e}")))?;

        let path = self.item_lock_path(issue);
        // create_new gives the atomic create-if-absent semantics both
        // processes rely on.
        let open = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match open {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(body.as_bytes())
                    .await
                    .map_err(|e| ForemanError::Lock(format!("failed to write item claim: {e}")))?;
                debug!(issue, "item claimed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(ForemanError::Lock(format!("failed to create item claim: {e}"))),
        }
    }
}

/// Whether a pid refers to a live process. On unix EPERM still means alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Without a cheap probe, assume alive: never reaping beats reaping a
    // live owner's locks.
    true
}
