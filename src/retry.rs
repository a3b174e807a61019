//! Bounded retry for state-changing actions.
//!
//! An action counts as done once the client acknowledges it. Without an
//! acknowledgement inside `ack_timeout` the action is issued again, up to
//! `max_retries` more times. `<unsafe>` actions are fire-and-forget.

use std::time::Duration;

use thiserror::Error;

use crate::capability::{GameError, GameState};
use crate::config::{EngineConfig, MAX_TIMEOUT_RETRIES};
use crate::error::Interrupted;
use crate::evaluator::{Evaluator, WaitOutcome};

/// Attempt bookkeeping for one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts_used: u32,
    pub max_attempts: u32,
}

impl RetryState {
    pub fn new(max_retries: u8) -> Self {
        Self {
            attempts_used: 0,
            max_attempts: u32::from(max_retries.min(MAX_TIMEOUT_RETRIES)) + 1,
        }
    }

    pub fn can_attempt(&self) -> bool {
        self.attempts_used < self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Success { attempts: u32 },
    Exhausted { attempts: u32, last_error: GameError },
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    /// The client refused the action outright; retrying cannot help.
    #[error(transparent)]
    Game(GameError),
}

#[derive(Debug, Clone)]
pub struct RetryController {
    max_retries: u8,
    ack_timeout: Duration,
}

impl RetryController {
    pub fn new(max_retries: u8, ack_timeout: Duration) -> Self {
        Self {
            max_retries: max_retries.min(MAX_TIMEOUT_RETRIES),
            ack_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_timeout_retries, config.ack_timeout())
    }

    pub async fn execute_with_retry(
        &self,
        game: &dyn GameState,
        evaluator: &Evaluator,
        action: &str,
        unsafe_action: bool,
    ) -> Result<RetryOutcome, RetryError> {
        if unsafe_action {
            game.send_action(action).map_err(RetryError::Game)?;
            return Ok(RetryOutcome::Success { attempts: 1 });
        }

        let mut state = RetryState::new(self.max_retries);
        while state.can_attempt() {
            state.attempts_used += 1;
            if state.attempts_used > 1 {
                tracing::warn!(action, attempt = state.attempts_used, "no acknowledgement, retrying");
            }
            let ticket = game.send_action(action).map_err(RetryError::Game)?;
            let outcome = evaluator
                .until(|| game.is_acknowledged(ticket), self.ack_timeout)
                .await?;
            if outcome == WaitOutcome::Satisfied {
                return Ok(RetryOutcome::Success {
                    attempts: state.attempts_used,
                });
            }
        }

        Ok(RetryOutcome::Exhausted {
            attempts: state.attempts_used,
            last_error: GameError::Timeout(format!("no acknowledgement for {action}")),
        })
    }
}
