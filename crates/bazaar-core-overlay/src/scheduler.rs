//! Delayed scheduling onto the peer group's single logical executor.
//!
//! All core state lives on one event loop; timers therefore never run work
//! themselves. They post an event back onto the loop's queue after a fixed or
//! uniformly drawn delay, so timer firings interleave with other events only
//! at the loop's receive points.

use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// A closed interval of delays, sampled uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Draw a delay uniformly from the range.
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

/// Handle to a scheduled task. Dropping the handle does not cancel the task;
/// call [`TimerHandle::cancel`].
#[derive(Debug)]
pub struct TimerHandle {
    task: AbortHandle,
}

impl TimerHandle {
    /// Cancel the pending firing. A no-op if the timer already fired.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// Posts events onto an executor queue after a delay.
pub struct Scheduler<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for Scheduler<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Send + 'static> Scheduler<E> {
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self { tx }
    }

    /// Enqueue `event` after `delay`. The send is dropped silently if the
    /// executor has shut down in the meantime.
    pub fn run_after_delay(&self, event: E, delay: Duration) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
        TimerHandle {
            task: task.abort_handle(),
        }
    }

    /// Enqueue `event` after a delay drawn uniformly from `range`.
    pub fn run_after_random_delay(&self, event: E, range: DelayRange) -> TimerHandle {
        self.run_after_delay(event, range.sample())
    }
}
