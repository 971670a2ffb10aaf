//! Polling state machine
//!
//! ```text
//!            idle timeout                hidden
//!   Active ──────────────► Inactive ──────────────► Background
//!     ▲  ◄──────────────────  │                        │
//!     │      any input        │ hidden                 │ visible again:
//!     │                       ▼                        │ Active if input within
//!     └──────────────────── Background ◄───────────────┘ the idle timeout,
//!                                                       else Inactive
//!   any state ── teardown ──► Stopped (terminal)
//! ```
//!
//! Pure: every method takes `now`, nothing here sleeps or spawns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::PollingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Active,
    Inactive,
    Background,
    Stopped,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Active => "active",
            SchedulerState::Inactive => "inactive",
            SchedulerState::Background => "background",
            SchedulerState::Stopped => "stopped",
        }
    }
}

/// `(from, to)` of a state change
pub type Transition = (SchedulerState, SchedulerState);

/// Polling state of one tracked root
#[derive(Debug, Clone)]
pub struct PollingState {
    state: SchedulerState,
    last_activity_at: Instant,
    visible: bool,
    intervals: PollingConfig,
    /// Reconnect attempts since the live channel last connected
    pub stream_retry_count: u32,
    /// Live channel gave up; interval polling only
    pub stream_degraded: bool,
}

impl PollingState {
    pub fn new(intervals: PollingConfig, now: Instant) -> Self {
        Self {
            state: SchedulerState::Active,
            last_activity_at: now,
            visible: true,
            intervals,
            stream_retry_count: 0,
            stream_degraded: false,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn intervals(&self) -> &PollingConfig {
        &self.intervals
    }

    pub fn set_intervals(&mut self, intervals: PollingConfig) {
        self.intervals = intervals;
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    /// User input. Inactive returns to Active at once; a hidden view stays in
    /// Background but remembers the input for when it becomes visible.
    pub fn on_activity(&mut self, now: Instant) -> Option<Transition> {
        if self.state == SchedulerState::Stopped {
            return None;
        }
        self.last_activity_at = now;
        if self.visible {
            self.set(SchedulerState::Active)
        } else {
            None
        }
    }

    pub fn on_visibility(&mut self, visible: bool, now: Instant) -> Option<Transition> {
        if self.state == SchedulerState::Stopped {
            return None;
        }
        self.visible = visible;
        if !visible {
            return self.set(SchedulerState::Background);
        }
        if self.state == SchedulerState::Background {
            let next = if self.idle(now) {
                SchedulerState::Inactive
            } else {
                SchedulerState::Active
            };
            return self.set(next);
        }
        None
    }

    /// Apply the idle timeout; called on every tick
    pub fn evaluate(&mut self, now: Instant) -> Option<Transition> {
        if self.state == SchedulerState::Active && self.idle(now) {
            return self.set(SchedulerState::Inactive);
        }
        None
    }

    pub fn stop(&mut self) -> Option<Transition> {
        self.set(SchedulerState::Stopped)
    }

    /// Interval for the current state; `None` once stopped
    pub fn interval(&self) -> Option<Duration> {
        match self.state {
            SchedulerState::Active => Some(self.intervals.active_interval()),
            SchedulerState::Inactive => Some(self.intervals.inactive_interval()),
            SchedulerState::Background => Some(self.intervals.background_interval()),
            SchedulerState::Stopped => None,
        }
    }

    fn idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity_at) >= self.intervals.idle_timeout()
    }

    fn set(&mut self, next: SchedulerState) -> Option<Transition> {
        if self.state == next {
            return None;
        }
        let from = self.state;
        self.state = next;
        Some((from, next))
    }
}

/// Polling state shared by a root's scheduler task, its stream listener and
/// the engine. Only held for short, non-async sections.
#[derive(Debug, Clone)]
pub struct SharedPollingState(Arc<Mutex<PollingState>>);

impl SharedPollingState {
    pub fn new(state: PollingState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn lock(&self) -> MutexGuard<'_, PollingState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(now: Instant) -> PollingState {
        PollingState::new(PollingConfig::default(), now)
    }

    #[test]
    fn test_idle_timeout_moves_to_inactive() {
        let t0 = Instant::now();
        let mut s = state_at(t0);
        assert_eq!(s.evaluate(t0 + Duration::from_secs(59)), None);
        assert_eq!(
            s.evaluate(t0 + Duration::from_secs(60)),
            Some((SchedulerState::Active, SchedulerState::Inactive))
        );
        assert_eq!(s.interval(), Some(Duration::from_secs(30)));

        assert_eq!(
            s.on_activity(t0 + Duration::from_secs(61)),
            Some((SchedulerState::Inactive, SchedulerState::Active))
        );
        assert_eq!(s.interval(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_visibility_round_trip_reevaluates_idle() {
        let t0 = Instant::now();
        let mut s = state_at(t0);
        s.on_visibility(false, t0);
        assert_eq!(s.state(), SchedulerState::Background);
        assert_eq!(s.interval(), Some(Duration::from_secs(60)));

        // input while hidden does not leave Background
        assert_eq!(s.on_activity(t0 + Duration::from_secs(10)), None);
        assert_eq!(s.state(), SchedulerState::Background);

        s.on_visibility(true, t0 + Duration::from_secs(20));
        assert_eq!(s.state(), SchedulerState::Active);

        s.on_visibility(false, t0 + Duration::from_secs(21));
        s.on_visibility(true, t0 + Duration::from_secs(200));
        assert_eq!(s.state(), SchedulerState::Inactive);
    }

    #[test]
    fn test_stopped_is_terminal() {
        let t0 = Instant::now();
        let mut s = state_at(t0);
        s.stop();
        assert_eq!(s.interval(), None);
        assert_eq!(s.on_activity(t0), None);
        assert_eq!(s.on_visibility(true, t0), None);
        assert_eq!(s.evaluate(t0 + Duration::from_secs(600)), None);
        assert_eq!(s.state(), SchedulerState::Stopped);
    }
}
