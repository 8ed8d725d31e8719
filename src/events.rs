//! Daemon event stream.
//!
//! All interesting state changes are published on a single
//! `tokio::sync::broadcast` channel. Subscribers (the log sink, IPC
//! status followers) each get an independent receiver, so a slow
//! consumer lags on its own without blocking publishers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::confidence::ConfidenceScore;
use crate::queue::ProjectId;
use crate::task::TaskId;

const EVENT_CAPACITY: usize = 256;

/// Everything the daemon announces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MidnightEvent {
    ProjectStarted {
        project_id: ProjectId,
        name: String,
    },
    ProjectCompleted {
        project_id: ProjectId,
    },
    ProjectFailed {
        project_id: ProjectId,
        reason: String,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
    },
    /// A judge verdict landed for an attempt.
    SentinelVerdict {
        task_id: TaskId,
        attempt: u32,
        quality_score: u8,
        passed: bool,
    },
    /// A deterministic veto fired; the judge was never consulted.
    SentinelVeto {
        task_id: TaskId,
        attempt: u32,
        message: String,
    },
    TaskCompleted {
        task_id: TaskId,
        attempts: u32,
    },
    /// Emitted exactly once, when the retry budget is exhausted.
    TaskLocked {
        task_id: TaskId,
        attempts: u32,
    },
    ConfidenceUpdate {
        confidence: ConfidenceScore,
    },
    CooldownEntered {
        provider: String,
        resume_at: DateTime<Utc>,
    },
    /// Confidence hit Error; a human should look at the log.
    HandoffTriggered {
        reason: String,
    },
    Paused,
    Resumed,
    ShuttingDown,
}

/// Fan-out hub. Cheap to clone; every clone publishes to the same
/// channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MidnightEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: MidnightEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MidnightEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
