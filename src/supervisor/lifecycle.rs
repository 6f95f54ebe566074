//! Backend lifecycle state, cooperative cancellation, and exit notification.
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Cooperative cancellation shared by the output readers of one backend run.
/// Cancelling is idempotent; the first call wins.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that performed the transition.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One-shot exit notification for a spawned backend, published by its waiter thread.
#[derive(Debug, Default)]
pub struct ExitWatch {
    status: Mutex<Option<ExitOutcome>>,
    cond: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub success: bool,
}

impl From<ExitStatus> for ExitOutcome {
    fn from(s: ExitStatus) -> Self {
        ExitOutcome {
            code: s.code(),
            success: s.success(),
        }
    }
}

impl ExitWatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, outcome: ExitOutcome) {
        let mut g = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if g.is_none() {
            *g = Some(outcome);
        }
        self.cond.notify_all();
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the process exits or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitOutcome> {
        let g = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let (g, _) = self
            .cond
            .wait_timeout_while(g, timeout, |s| s.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *g
    }

    /// Block until the process exits.
    pub fn wait(&self) -> ExitOutcome {
        let g = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let g = self
            .cond
            .wait_while(g, |s| s.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        g.unwrap_or(ExitOutcome {
            code: None,
            success: false,
        })
    }
}

/// Handles for the one backend that may exist at a time.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub generation: u64,
    pub pid: u32,
    pub exit: Arc<ExitWatch>,
    pub cancel: CancelToken,
}

/// Idle → Starting → Running → Stopping → Stopped (→ Starting again).
#[derive(Debug, Clone, Default)]
pub enum BackendState {
    #[default]
    Idle,
    Starting,
    Running(RunHandle),
    Stopping(RunHandle),
    Stopped { code: Option<i32> },
}

impl BackendState {
    pub fn is_running(&self) -> bool {
        matches!(self, BackendState::Running(_))
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            BackendState::Running(h) | BackendState::Stopping(h) => Some(h.pid),
            _ => None,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            BackendState::Running(h) | BackendState::Stopping(h) => Some(h.generation),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendState::Idle => "idle",
            BackendState::Starting => "starting",
            BackendState::Running(_) => "running",
            BackendState::Stopping(_) => "stopping",
            BackendState::Stopped { .. } => "stopped",
        }
    }
}
