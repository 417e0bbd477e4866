//! Adaptive scheduler: picks the next reconcile-loop interval from recent
//! activity. Bursty periods get a tight poll interval; idle periods back off
//! exponentially so a quiet datasite doesn't spin the CPU or hammer the API.
//!
//! No direct teacher equivalent exists; this follows the shape of
//! `telemetry::LatencyStats` (a `Mutex`-guarded bounded window read through
//! `Instant`) since that is the closest pattern the teacher uses for rolling
//! time-windowed state.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const BURST_INTERVAL: Duration = Duration::from_millis(100);
const MODERATE_INTERVAL: Duration = Duration::from_millis(500);
const IDLE_BACKOFF_STEPS: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// A reconcile pass counts as "active" if it touched at least this many
/// paths, and "moderate" activity if it touched at least one.
const ACTIVE_PATH_THRESHOLD: usize = 5;

/// How long a burst of activity keeps the scheduler in the fast tier after
/// the last busy pass.
const ACTIVITY_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Burst,
    Moderate,
    Idle(usize),
}

struct State {
    tier: Tier,
    last_activity: Option<Instant>,
}

/// Tracks recent reconcile-pass activity and exposes the interval the engine
/// should sleep for before the next pass.
pub struct AdaptiveScheduler {
    state: Mutex<State>,
}

impl Default for AdaptiveScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tier: Tier::Idle(0),
                last_activity: None,
            }),
        }
    }

    /// Record the outcome of a reconcile pass: the number of paths that
    /// required an operation (upload, download, delete, conflict — not
    /// `unchanged`/`ignored`).
    pub fn record_pass(&self, changed_paths: usize) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if changed_paths >= ACTIVE_PATH_THRESHOLD {
            state.tier = Tier::Burst;
            state.last_activity = Some(now);
        } else if changed_paths > 0 {
            state.tier = Tier::Moderate;
            state.last_activity = Some(now);
        } else {
            state.tier = match state.tier {
                Tier::Burst | Tier::Moderate => {
                    let still_recent = state
                        .last_activity
                        .is_some_and(|t| now.duration_since(t) < ACTIVITY_WINDOW);
                    if still_recent {
                        state.tier
                    } else {
                        Tier::Idle(0)
                    }
                }
                Tier::Idle(step) => Tier::Idle((step + 1).min(IDLE_BACKOFF_STEPS.len() - 1)),
            };
        }
    }

    /// Interval to wait before the next reconcile pass.
    pub fn next_interval(&self) -> Duration {
        match self.state.lock().unwrap().tier {
            Tier::Burst => BURST_INTERVAL,
            Tier::Moderate => MODERATE_INTERVAL,
            Tier::Idle(step) => IDLE_BACKOFF_STEPS[step],
        }
    }

    /// A priority-path event (RPC file write, ACL manifest) always collapses
    /// the scheduler back to the burst tier regardless of the last reconcile
    /// pass's outcome.
    pub fn note_priority_activity(&self) {
        let mut state = self.state.lock().unwrap();
        state.tier = Tier::Burst;
        state.last_activity = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_pass_selects_burst_interval() {
        let s = AdaptiveScheduler::new();
        s.record_pass(10);
        assert_eq!(s.next_interval(), BURST_INTERVAL);
    }

    #[test]
    fn light_pass_selects_moderate_interval() {
        let s = AdaptiveScheduler::new();
        s.record_pass(1);
        assert_eq!(s.next_interval(), MODERATE_INTERVAL);
    }

    #[test]
    fn repeated_idle_passes_back_off_exponentially() {
        let s = AdaptiveScheduler::new();
        assert_eq!(s.next_interval(), IDLE_BACKOFF_STEPS[0]);
        for expected in &IDLE_BACKOFF_STEPS[1..] {
            s.record_pass(0);
            assert_eq!(s.next_interval(), *expected);
        }
        // Further idle passes stay at the max step.
        s.record_pass(0);
        assert_eq!(s.next_interval(), *IDLE_BACKOFF_STEPS.last().unwrap());
    }

    #[test]
    fn priority_activity_forces_burst_tier() {
        let s = AdaptiveScheduler::new();
        s.record_pass(0);
        s.record_pass(0);
        s.note_priority_activity();
        assert_eq!(s.next_interval(), BURST_INTERVAL);
    }
}
