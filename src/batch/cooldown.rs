//! Cancellable countdown for the refresh cooldown display.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const TICK: Duration = Duration::from_secs(1);

/// Owned countdown timer. Dropping it cancels the countdown.
///
/// The countdown publishes the remaining whole seconds, ticking down to 0.
#[derive(Debug)]
pub struct CooldownTimer {
    deadline: Instant,
    remaining: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl CooldownTimer {
    pub fn start(duration: Duration) -> Self {
        let deadline = Instant::now() + duration;
        let (tx, remaining) = watch::channel(ceil_secs(duration));

        let task = tokio::spawn(async move {
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    let _ = tx.send(0);
                    break;
                }
                if tx.send(ceil_secs(left)).is_err() {
                    break;
                }
                tokio::time::sleep(left.min(TICK)).await;
            }
        });

        Self {
            deadline,
            remaining,
            task,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Last published countdown value.
    pub fn remaining_secs(&self) -> u64 {
        *self.remaining.borrow()
    }

    pub fn is_active(&self) -> bool {
        !self.remaining().is_zero()
    }
}

impl Drop for CooldownTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
