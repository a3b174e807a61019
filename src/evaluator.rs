//! Condition and wait evaluation.
//!
//! Every suspension a step can make goes through [`Evaluator`]: fixed sleeps,
//! polled predicates and acknowledgement waits. Each poll tick is a control
//! checkpoint, so pause and stop take effect within one poll interval.
//! Deadlines are captured once at the start and never re-armed.

use std::time::Duration;

use tokio::time::{self, Instant};

use crate::error::Interrupted;
use crate::scheduler::ControlHandle;

/// About thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
}

/// A suspension in progress.
#[derive(Debug, Clone, Copy)]
pub struct PendingWait {
    started: Instant,
    deadline: Instant,
}

impl PendingWait {
    /// Deadlines past what `Instant` can hold are clamped to `FAR_FUTURE` from now.
    pub fn new(max_wait: Duration) -> Self {
        let started = Instant::now();
        let deadline = started
            .checked_add(max_wait)
            .unwrap_or_else(|| started + FAR_FUTURE);
        Self { started, deadline }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    poll_interval: Duration,
    control: ControlHandle,
}

impl Evaluator {
    pub fn new(poll_interval: Duration, control: ControlHandle) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            control,
        }
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Suspend for exactly `duration`, honouring pause and stop.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let wait = PendingWait::new(duration);
        loop {
            self.control.checkpoint().await?;
            let left = wait.remaining();
            if left.is_zero() {
                return Ok(());
            }
            time::sleep(left.min(self.poll_interval)).await;
        }
    }

    /// Poll `predicate` until it holds or `max_wait` elapses.
    ///
    /// The predicate is checked once more when the deadline is reached, so a
    /// zero `max_wait` still looks at the current state.
    pub async fn until<F>(&self, mut predicate: F, max_wait: Duration) -> Result<WaitOutcome, Interrupted>
    where
        F: FnMut() -> bool,
    {
        let wait = PendingWait::new(max_wait);
        loop {
            self.control.checkpoint().await?;
            if predicate() {
                return Ok(WaitOutcome::Satisfied);
            }
            let left = wait.remaining();
            if left.is_zero() {
                tracing::debug!(waited = ?wait.elapsed(), "wait timed out");
                return Ok(WaitOutcome::TimedOut);
            }
            time::sleep(left.min(self.poll_interval)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ControlRequest;

    fn running() -> ControlHandle {
        let control = ControlHandle::new();
        control.request(ControlRequest::Start).unwrap();
        control
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_lasts_exactly_the_duration() {
        let ev = Evaluator::new(Duration::from_millis(100), running());
        let start = Instant::now();
        ev.sleep(Duration::from_millis(1250)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(1250));
    }

    #[tokio::test(start_paused = true)]
    async fn until_times_out_at_the_deadline() {
        let ev = Evaluator::new(Duration::from_millis(100), running());
        let start = Instant::now();
        let outcome = ev.until(|| false, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn until_returns_when_the_predicate_holds() {
        let ev = Evaluator::new(Duration::from_millis(100), running());
        let start = Instant::now();
        let mut polls = 0;
        let outcome = ev
            .until(
                || {
                    polls += 1;
                    polls == 4
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Satisfied);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_sleep_at_the_next_tick() {
        let control = running();
        let ev = Evaluator::new(Duration::from_millis(100), control.clone());
        let stopper = control.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(250)).await;
            stopper.request(ControlRequest::Stop).unwrap();
        });
        let start = Instant::now();
        assert_eq!(ev.sleep(Duration::from_secs(10)).await, Err(Interrupted));
        assert!(start.elapsed() <= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_deadlines_do_not_overflow() {
        let wait = PendingWait::new(Duration::MAX);
        assert!(wait.remaining() > Duration::from_secs(86_400 * 365));

        let control = running();
        let ev = Evaluator::new(Duration::from_millis(100), control.clone());
        let stopper = control.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(1)).await;
            stopper.request(ControlRequest::Stop).unwrap();
        });
        assert_eq!(ev.until(|| false, Duration::MAX).await, Err(Interrupted));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_blocks_until_resume() {
        let control = running();
        let ev = Evaluator::new(Duration::from_millis(100), control.clone());
        control.request(ControlRequest::Pause).unwrap();
        let resumer = control.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(3)).await;
            resumer.request(ControlRequest::Resume).unwrap();
        });
        let start = Instant::now();
        ev.sleep(Duration::from_millis(500)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
