//! Process-wide session counters.
//!
//! Three states — `RUN`, `DONE`, `FAIL` — move only along the two
//! transitions a session can actually make: `RUN -> DONE` on clean
//! completion, `RUN -> FAIL` on an unrecoverable error. Starting a session
//! always enters `RUN`. Any other (from, to) pairing is a logged no-op: it
//! would only happen from a bug in the caller, and a stats counter
//! shouldn't be the thing that panics the run.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Run,
    Done,
    Fail,
}

#[derive(Default)]
pub struct Stats {
    running: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session entering `RUN` for the first time in its lifecycle.
    pub fn start(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    /// Moves a session from `from` to `to`. Only `Run -> Done` and
    /// `Run -> Fail` have any effect; anything else is a no-op (logged at
    /// `warn!` since it indicates a caller bug).
    pub fn transition(&self, from: SessionState, to: SessionState) {
        match (from, to) {
            (SessionState::Run, SessionState::Done) => {
                self.running.fetch_sub(1, Ordering::Relaxed);
                self.done.fetch_add(1, Ordering::Relaxed);
            }
            (SessionState::Run, SessionState::Fail) => {
                self.running.fetch_sub(1, Ordering::Relaxed);
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                tracing::warn!(?from, ?to, "ignoring no-op stats transition");
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            running: self.running.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Running: {}, Failed: {}, Done: {}",
            self.running, self.failed, self.done
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_increments_running() {
        let stats = Stats::new();
        stats.start();
        stats.start();
        assert_eq!(stats.snapshot().running, 2);
    }

    #[test]
    fn run_to_done_moves_the_counter() {
        let stats = Stats::new();
        stats.start();
        stats.transition(SessionState::Run, SessionState::Done);
        let snap = stats.snapshot();
        assert_eq!((snap.running, snap.done, snap.failed), (0, 1, 0));
    }

    #[test]
    fn run_to_fail_moves_the_counter() {
        let stats = Stats::new();
        stats.start();
        stats.transition(SessionState::Run, SessionState::Fail);
        let snap = stats.snapshot();
        assert_eq!((snap.running, snap.done, snap.failed), (0, 0, 1));
    }

    #[test]
    fn unrelated_transition_is_a_no_op() {
        let stats = Stats::new();
        stats.start();
        stats.transition(SessionState::Done, SessionState::Fail);
        let snap = stats.snapshot();
        assert_eq!((snap.running, snap.done, snap.failed), (1, 0, 0));
    }
}
