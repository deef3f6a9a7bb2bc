//! Typed fan-out of scheduler events to observers.
//!
//! One canonical emitter, many observers, per-emitter FIFO, best-effort
//! delivery. A slow observer lags and drops; it can never block or fail the
//! scheduler.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::Domain;
use crate::scheduler::slot::{RunState, SlotStatus};

/// Events emitted by the scheduler over one run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A queue item was claimed into a slot.
    SlotFill {
        slot_id: u64,
        issue: u64,
        title: String,
        domain: Domain,
        at: DateTime<Utc>,
    },
    /// A slot reached a terminal status.
    SlotDone {
        slot_id: u64,
        issue: u64,
        status: SlotStatus,
        attempts: u32,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    /// The fallback chain moved from one engine to another.
    EngineSwitch {
        slot_id: u64,
        issue: u64,
        from: String,
        to: String,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Outcome of one integration attempt.
    MergeResult {
        slot_id: u64,
        issue: u64,
        branch: String,
        attempt: u32,
        success: bool,
        error: Option<String>,
        conflict_files: Vec<String>,
        at: DateTime<Utc>,
    },
    /// All queued items reached terminal slots.
    BatchComplete {
        total: usize,
        done: usize,
        failed: usize,
        blocked: usize,
        at: DateTime<Utc>,
    },
    /// Periodic snapshot of the whole run.
    Dashboard { state: RunState, at: DateTime<Utc> },
    /// A registered engine subprocess was killed.
    EngineKill {
        slot_id: u64,
        issue: u64,
        engine: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

const DEFAULT_BUS_CAPACITY: usize = 256;

/// Broadcast bus carrying [`SchedulerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach a new observer. Events published before the call are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current observers. Never blocks; publishing
    /// with no observers is a no-op.
    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }
}
