//! Reconnection timer: maps a 1-based attempt count to a delay.
//!
//! The default schedule is 1s, 2s, 5s, 10s, clamped at 10s for later
//! attempts. A user-supplied function overrides the schedule. The same
//! stepped timer drives both link reconnection and channel rejoin.

use std::sync::Arc;
use std::time::Duration;

pub type ReconnectSchedule = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

const DEFAULT_STEPS: [u64; 4] = [1, 2, 5, 10];

pub fn default_schedule() -> ReconnectSchedule {
    Arc::new(|attempt: u32| {
        let idx = (attempt.max(1) as usize - 1).min(DEFAULT_STEPS.len() - 1);
        Duration::from_secs(DEFAULT_STEPS[idx])
    })
}

pub(crate) struct ReconnectTimer {
    attempts: u32,
    schedule: ReconnectSchedule,
}

impl ReconnectTimer {
    pub fn new(schedule: ReconnectSchedule) -> Self {
        Self {
            attempts: 0,
            schedule,
        }
    }

    /// Advance the attempt counter and return the delay for this attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        (self.schedule)(self.attempts)
    }

    /// A successful connection resets the counter to zero.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
