//! Worker lifecycle state machine
//!
//! ```text
//!            start                 pause
//!   IDLE ───────────► RUNNING ───────────► PAUSED
//!    ▲  ▲               │  ▲                  │
//!    │  └──── stop ─────┘  └────── start ─────┘
//!    │                     ▲
//!    └────── stop ──── ERROR (local fault)
//!
//!   shutdown from any state: terminate after in-flight work drains
//! ```

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::control::{ControlAction, ResourceUsage, StatusSnapshot};
use crate::models::WorkerStatus;

/// What applying a command did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEffect {
    Transitioned { from: WorkerStatus, to: WorkerStatus },
    /// The command does not apply in the current state
    Ignored { status: WorkerStatus },
    Terminate,
    ReportStatus,
}

/// Mutable runtime state of one worker process
#[derive(Debug)]
pub struct WorkerState {
    status: WorkerStatus,
    terminated: bool,
    worker_id: Option<Uuid>,
    in_flight: BTreeSet<Uuid>,
    processed_count: i64,
    error_message: Option<String>,
    started: Instant,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            status: WorkerStatus::Idle,
            terminated: false,
            worker_id: None,
            in_flight: BTreeSet::new(),
            processed_count: 0,
            error_message: None,
            started: Instant::now(),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn worker_id(&self) -> Option<Uuid> {
        self.worker_id
    }

    pub fn set_worker_id(&mut self, id: Uuid) {
        self.worker_id = Some(id);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn processed_count(&self) -> i64 {
        self.processed_count
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Polling happens only while RUNNING
    pub fn is_polling(&self) -> bool {
        self.status == WorkerStatus::Running && !self.terminated
    }

    /// Apply a control command
    pub fn apply(&mut self, action: ControlAction) -> CommandEffect {
        let from = self.status;
        match action {
            ControlAction::Start => match from {
                WorkerStatus::Idle | WorkerStatus::Paused | WorkerStatus::Error => {
                    self.error_message = None;
                    self.transition(WorkerStatus::Running)
                }
                WorkerStatus::Running => CommandEffect::Ignored { status: from },
            },
            ControlAction::Pause => match from {
                WorkerStatus::Running => self.transition(WorkerStatus::Paused),
                _ => CommandEffect::Ignored { status: from },
            },
            ControlAction::Stop => match from {
                WorkerStatus::Idle => CommandEffect::Ignored { status: from },
                _ => {
                    self.error_message = None;
                    self.transition(WorkerStatus::Idle)
                }
            },
            ControlAction::Shutdown => {
                self.terminated = true;
                CommandEffect::Terminate
            }
            ControlAction::Status => CommandEffect::ReportStatus,
        }
    }

    fn transition(&mut self, to: WorkerStatus) -> CommandEffect {
        let from = self.status;
        self.status = to;
        CommandEffect::Transitioned { from, to }
    }

    /// Local fault (e.g. scraper binary missing): stop polling until restarted
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = WorkerStatus::Error;
        self.error_message = Some(message.into());
    }

    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    pub fn begin_task(&mut self, task_id: Uuid) {
        self.in_flight.insert(task_id);
    }

    pub fn finish_task(&mut self, task_id: Uuid) {
        if self.in_flight.remove(&task_id) {
            self.processed_count += 1;
        }
    }

    pub fn snapshot(&self, name: &str, host: &str, rss_bytes: Option<u64>) -> StatusSnapshot {
        StatusSnapshot {
            worker_id: self.worker_id,
            name: name.to_string(),
            host: host.to_string(),
            status: self.status,
            in_flight: self.in_flight.iter().copied().collect(),
            processed_count: self.processed_count,
            uptime_secs: self.started.elapsed().as_secs(),
            resources: ResourceUsage {
                rss_bytes,
                active_scrapers: self.in_flight.len(),
            },
            error_message: self.error_message.clone(),
            timestamp: Utc::now(),
        }
    }
}
