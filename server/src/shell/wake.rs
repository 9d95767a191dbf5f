//! First-prompt wake-up for silent shells.
//!
//! Some servers (and some login shells behind `sudo`/`su` wrappers) print no
//! prompt until they see input. If a fresh channel stays silent past a grace
//! period we send one newline, then one more after a further delay. The
//! schedule is cancelled for good as soon as any output arrives.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct WakeSchedule {
    deadlines: VecDeque<Instant>,
}

impl WakeSchedule {
    pub fn new(start: Instant, grace: Duration, retry: Duration) -> Self {
        let first = start + grace;
        Self {
            deadlines: VecDeque::from([first, first + retry]),
        }
    }

    /// When the next newline is due, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.front().copied()
    }

    /// Consume the current deadline. Returns whether a newline should be sent.
    pub fn fire(&mut self) -> bool {
        self.deadlines.pop_front().is_some()
    }

    pub fn output_seen(&mut self) {
        self.deadlines.clear();
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
