//! Shared runtime state of the scaler
//!
//! Exactly one scaling operation may be in flight; `is_scaling` is flipped by
//! the executor on entry and cleared exactly once by its completion handler.
//! The plan-ahead duration is read on every tick and raised (never lowered)
//! after each scale-out to cover observed provisioning latency.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Safety margin added on top of observed provisioning latency
pub const SCALE_MARGIN: Duration = Duration::from_secs(60);

/// Monotonically non-decreasing look-ahead duration
#[derive(Debug)]
pub struct PlanAhead {
    seconds: AtomicU64,
}

impl PlanAhead {
    pub fn new(initial: Duration) -> Self {
        Self {
            seconds: AtomicU64::new(initial.as_secs()),
        }
    }

    pub fn get(&self) -> Duration {
        Duration::from_secs(self.seconds.load(Ordering::Relaxed))
    }

    /// Raise to `candidate` if it is larger; returns true when raised
    pub fn raise_to(&self, candidate: Duration) -> bool {
        let candidate = candidate.as_secs();
        let previous = self.seconds.fetch_max(candidate, Ordering::Relaxed);
        previous < candidate
    }

    /// Feed back an observed provisioning duration. The prediction must look
    /// at least as far ahead as provisioning takes, or the scaler acts too
    /// late; the margin absorbs measurement jitter.
    pub fn observe_scale_duration(&self, elapsed: Duration) -> bool {
        self.raise_to(elapsed + SCALE_MARGIN)
    }
}

/// Controller-owned mutable state
#[derive(Debug)]
pub struct RuntimeState {
    is_scaling: AtomicBool,
    last_scale: RwLock<Option<DateTime<Utc>>>,
    pub plan_ahead: PlanAhead,
}

impl RuntimeState {
    pub fn new(initial_plan_ahead: Duration) -> Arc<Self> {
        Arc::new(Self {
            is_scaling: AtomicBool::new(false),
            last_scale: RwLock::new(None),
            plan_ahead: PlanAhead::new(initial_plan_ahead),
        })
    }

    /// Claim the single scaling slot; false if one is already in flight
    pub fn try_begin_scaling(&self) -> bool {
        self.is_scaling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the slot and stamp the completion time
    pub fn finish_scaling(&self) {
        *self.last_scale.write() = Some(Utc::now());
        self.is_scaling.store(false, Ordering::Release);
    }

    pub fn is_scaling(&self) -> bool {
        self.is_scaling.load(Ordering::Acquire)
    }

    pub fn last_scale(&self) -> Option<DateTime<Utc>> {
        *self.last_scale.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() {
        let state = RuntimeState::new(Duration::from_secs(600));
        assert!(!state.is_scaling());
        assert!(state.try_begin_scaling());
        assert!(state.is_scaling());
        // second claim is rejected while the first is in flight
        assert!(!state.try_begin_scaling());

        state.finish_scaling();
        assert!(!state.is_scaling());
        assert!(state.last_scale().is_some());
        assert!(state.try_begin_scaling());
    }

    #[test]
    fn test_plan_ahead_monotonic() {
        let plan = PlanAhead::new(Duration::from_secs(600));
        assert_eq!(plan.get(), Duration::from_secs(600));

        // smaller observations never lower the value
        assert!(!plan.raise_to(Duration::from_secs(300)));
        assert_eq!(plan.get(), Duration::from_secs(600));

        assert!(plan.raise_to(Duration::from_secs(900)));
        assert_eq!(plan.get(), Duration::from_secs(900));
    }

    #[test]
    fn test_plan_ahead_feedback_adds_margin() {
        // provisioning took 720 s against an initial 600 s look-ahead
        let plan = PlanAhead::new(Duration::from_secs(600));
        assert!(plan.observe_scale_duration(Duration::from_secs(720)));
        assert_eq!(plan.get(), Duration::from_secs(780));

        // a faster scale later leaves the value untouched
        assert!(!plan.observe_scale_duration(Duration::from_secs(300)));
        assert_eq!(plan.get(), Duration::from_secs(780));
    }
}
