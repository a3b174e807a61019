//! Run/pause/stop lifecycle of one macro invocation.
//!
//! [`transition`] is the whole state machine; [`ControlHandle`] shares one
//! lifecycle between the fiber executing the macro and whoever controls it.
//! Every state change goes through the watch channel, so the fiber observes
//! requests at its next suspension point.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::error::Interrupted;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Running,
    PausedNow,
    PausedAtNextLoop,
    StoppedAtNextLoop,
    Stopped,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Running => "running",
            ExecutionState::PausedNow => "paused",
            ExecutionState::PausedAtNextLoop => "pausing at next loop",
            ExecutionState::StoppedAtNextLoop => "stopping at next loop",
            ExecutionState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Start,
    Pause,
    PauseAtLoop,
    Resume,
    Stop,
    StopAtLoop,
    /// Execute exactly one step, then pause again.
    Step,
    /// The fiber crossed a `/loop` or `/craft`.
    LoopBoundary,
    /// The fiber ran out of steps.
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {request:?} while {state:?}")]
pub struct TransitionError {
    pub state: ExecutionState,
    pub request: ControlRequest,
}

pub fn transition(
    state: ExecutionState,
    request: ControlRequest,
) -> Result<ExecutionState, TransitionError> {
    use ControlRequest as R;
    use ExecutionState as S;

    let next = match (state, request) {
        (S::Stopped, R::Stop | R::Finish) => S::Stopped,
        (S::Stopped, _) => return Err(TransitionError { state, request }),
        (_, R::Stop | R::Finish) => S::Stopped,

        (S::Idle, R::Start) => S::Running,

        (S::Running | S::PausedAtNextLoop, R::Pause) => S::PausedNow,
        (S::Running, R::PauseAtLoop) => S::PausedAtNextLoop,
        (S::Running | S::PausedAtNextLoop, R::StopAtLoop) => S::StoppedAtNextLoop,
        (S::PausedNow | S::PausedAtNextLoop, R::Resume) => S::Running,
        (S::PausedNow, R::Step) => S::Running,

        (S::Running, R::LoopBoundary) => S::Running,
        (S::PausedAtNextLoop, R::LoopBoundary) => S::PausedNow,
        (S::StoppedAtNextLoop, R::LoopBoundary) => S::Stopped,

        _ => return Err(TransitionError { state, request }),
    };
    Ok(next)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lifecycle {
    state: ExecutionState,
    /// Set by `Step`; the next completed step re-enters `PausedNow`.
    single_step: bool,
}

#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: Arc<watch::Sender<Lifecycle>>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Lifecycle {
            state: ExecutionState::Idle,
            single_step: false,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ExecutionState {
        self.tx.borrow().state
    }

    /// True when both handles control the same invocation.
    pub fn same(&self, other: &ControlHandle) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    pub fn request(&self, request: ControlRequest) -> Result<ExecutionState, TransitionError> {
        let mut result = Ok(ExecutionState::Idle);
        self.tx.send_if_modified(|lc| match transition(lc.state, request) {
            Ok(next) => {
                let before = *lc;
                lc.state = next;
                if request != ControlRequest::LoopBoundary {
                    lc.single_step = request == ControlRequest::Step;
                }
                result = Ok(next);
                *lc != before
            }
            Err(e) => {
                result = Err(e);
                false
            }
        });
        if let Ok(next) = result {
            tracing::debug!(?request, state = next.as_str(), "control transition");
        }
        result
    }

    /// Suspension point: waits out `PausedNow`, fails once stopped.
    pub async fn checkpoint(&self) -> Result<(), Interrupted> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|lc| lc.state != ExecutionState::PausedNow)
            .await
            .map_err(|_| Interrupted)?
            .state;
        if state == ExecutionState::Stopped {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Called after each completed step; ends a single-step advance.
    pub fn after_step(&self) {
        self.tx.send_if_modified(|lc| {
            if lc.single_step && lc.state == ExecutionState::Running {
                lc.state = ExecutionState::PausedNow;
                lc.single_step = false;
                true
            } else {
                false
            }
        });
    }

    /// Converts a pending at-next-loop request; returns the resulting state.
    pub fn loop_boundary(&self) -> ExecutionState {
        self.request(ControlRequest::LoopBoundary)
            .unwrap_or_else(|e| e.state)
    }

    pub fn finish(&self) {
        let _ = self.request(ControlRequest::Finish);
    }
}
