//! Scheduler bookkeeping: slot records and run-state snapshots.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::Domain;
use crate::tracker::WorkItem;

/// Lifecycle of one slot.
///
/// `pending → running → (merging → done) | failed | blocked`; `running` and
/// `merging` both count as active for window sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Pending,
    Running,
    Merging,
    Done,
    Failed,
    Blocked,
}

impl SlotStatus {
    pub fn is_active(self) -> bool {
        matches!(self, SlotStatus::Running | SlotStatus::Merging)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SlotStatus::Done | SlotStatus::Failed | SlotStatus::Blocked)
    }
}

/// Bookkeeping record for one work item's attempt pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Slot {
    pub id: u64,
    pub issue: u64,
    pub title: String,
    #[serde(skip)]
    pub body: String,
    pub labels: Vec<String>,
    pub domain: Domain,
    pub branch: Option<String>,
    pub workspace_path: Option<PathBuf>,
    pub engine: Option<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: SlotStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub merged: bool,
}

impl Slot {
    pub fn new(id: u64, item: &WorkItem, domain: Domain, max_attempts: u32) -> Self {
        Self {
            id,
            issue: item.number,
            title: item.title.clone(),
            body: item.body.clone(),
            labels: item.labels.clone(),
            domain,
            branch: None,
            workspace_path: None,
            engine: None,
            attempt: 0,
            max_attempts,
            status: SlotStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            last_error: None,
            merged: false,
        }
    }
}

/// Snapshot of a whole run, cheap to clone into events.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub window_size: usize,
    pub slots: Vec<Slot>,
    pub active_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub blocked_count: usize,
    pub total_items: usize,
    pub started_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(
        window_size: usize,
        slots: Vec<Slot>,
        total_items: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        let active_count = slots.iter().filter(|s| s.status.is_active()).count();
        let completed_count = slots.iter().filter(|s| s.status == SlotStatus::Done).count();
        let failed_count = slots.iter().filter(|s| s.status == SlotStatus::Failed).count();
        let blocked_count = slots.iter().filter(|s| s.status == SlotStatus::Blocked).count();
        Self {
            window_size,
            slots,
            active_count,
            completed_count,
            failed_count,
            blocked_count,
            total_items,
            started_at,
        }
    }
}
