//! 🚦 Job phases and cooperative cancellation.
//!
//! Every running job owns one [`JobControl`]: an atomic phase, a cancellation
//! token shared with every worker and every in-flight request, and the phase
//! listeners. Transitions only move forward:
//!
//! ```text
//! Initializing -> Running -> Completed
//!                    \-> Interrupting -> Interrupted
//! ```
//!
//! Completed is earned: the work ran dry and nothing failed. A job whose
//! `wait()` reports an error ends Interrupted, same as a cancelled one.
//!
//! Cancelling twice is fine. Cancelling after completion is fine too, it just
//! does nothing. Like closing a door that is already closed. 🚪

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_channel::Sender;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::listeners::Listeners;

/// 🚦 Where a job is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum WorkPhase {
    Initializing = 0,
    Running = 1,
    Interrupting = 2,
    Interrupted = 3,
    Completed = 4,
}

impl WorkPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Initializing,
            1 => Self::Running,
            2 => Self::Interrupting,
            3 => Self::Interrupted,
            _ => Self::Completed,
        }
    }

    /// 🏁 Interrupted or Completed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Interrupted | Self::Completed)
    }
}

impl std::fmt::Display for WorkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Interrupting => "INTERRUPTING",
            Self::Interrupted => "INTERRUPTED",
            Self::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}

/// 🎛️ Phase, token and phase listeners for one job.
#[derive(Debug)]
pub(crate) struct JobControl {
    job: &'static str,
    phase: AtomicU8,
    token: CancellationToken,
    listeners: Listeners<WorkPhase>,
}

impl JobControl {
    pub(crate) fn new(job: &'static str, phase_listeners: Vec<Sender<WorkPhase>>) -> Self {
        let listeners = Listeners::new();
        for sender in phase_listeners {
            listeners.add(sender);
        }
        Self {
            job,
            phase: AtomicU8::new(WorkPhase::Initializing as u8),
            token: CancellationToken::new(),
            listeners,
        }
    }

    pub(crate) fn phase(&self) -> WorkPhase {
        WorkPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn is_interrupting(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn listeners(&self) -> &Listeners<WorkPhase> {
        &self.listeners
    }

    fn transition(&self, from: WorkPhase, to: WorkPhase) -> bool {
        let moved = self
            .phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            debug!("🚦 {} {} -> {}", self.job, from, to);
            // phase listeners are told without blocking, a stuck listener must not stall cancel()
            self.listeners.try_broadcast(to);
        }
        moved
    }

    /// 🟢 Initializing -> Running.
    pub(crate) fn start(&self) {
        self.transition(WorkPhase::Initializing, WorkPhase::Running);
    }

    /// 🛑 Ask everything to stop. Idempotent. Returns true only for the call that did it.
    pub(crate) fn interrupt(&self) -> bool {
        let moved = self.transition(WorkPhase::Running, WorkPhase::Interrupting)
            || self.transition(WorkPhase::Initializing, WorkPhase::Interrupting);
        if moved {
            info!("🛑 {} interrupted, workers are winding down", self.job);
        }
        self.token.cancel();
        moved
    }

    /// 🏁 Every worker is done. Settle on the terminal phase and return it.
    ///
    /// With `failed` set the job goes Running -> Interrupting -> Interrupted
    /// instead of Completed, and the token is cancelled for anything still listening.
    pub(crate) fn finish(&self, failed: bool) -> WorkPhase {
        if failed && self.transition(WorkPhase::Running, WorkPhase::Interrupting) {
            info!("💀 {} failed, it will not be reported as completed", self.job);
            self.token.cancel();
        }
        if !self.transition(WorkPhase::Interrupting, WorkPhase::Interrupted) {
            self.transition(WorkPhase::Running, WorkPhase::Completed);
        }
        self.phase()
    }
}

/// 🛑 A cloneable remote control for a running job: check the phase, pull the plug.
#[derive(Debug, Clone)]
pub struct JobCanceller {
    control: Arc<JobControl>,
}

impl JobCanceller {
    pub(crate) fn new(control: Arc<JobControl>) -> Self {
        Self { control }
    }

    /// 🛑 Interrupt the job. Safe to call any number of times, from anywhere.
    pub fn cancel(&self) {
        self.control.interrupt();
    }

    pub fn phase(&self) -> WorkPhase {
        self.control.phase()
    }
}
