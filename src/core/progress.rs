//! Display-side smoothing of the raw progress reported by drivers.
//!
//! External tools report progress in bursts and sometimes go backwards when they
//! restart a fragment. The smoother turns that into a steadier percentage for
//! rendering. It never writes anything back to the store.

use crate::core::model::{TaskId, TaskStatus};
use std::collections::HashMap;

const START_FLOOR: f64 = 1.0;
const FAST_PHASE_VALUE: f64 = 50.0;
const CAP_UNTIL_COMPLETED: f64 = 99.9;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Normal,
    /// First DOWNLOADING sample was already 100; next poll shows 50.
    FastPending,
    /// Holding at 50 until COMPLETED arrives.
    FastHold,
}

#[derive(Debug, Clone, Copy)]
struct SmoothState {
    shown: f64,
    raw: f64,
    phase: Phase,
}

#[derive(Debug, Default)]
pub struct ProgressSmoother {
    states: HashMap<TaskId, SmoothState>,
}

impl ProgressSmoother {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn smooth(&mut self, task_id: TaskId, raw: f64, status: TaskStatus) -> f64 {
        let raw = if raw.is_finite() { raw.clamp(0.0, 100.0) } else { 0.0 };

        if status != TaskStatus::Downloading {
            self.states.remove(&task_id);
            return if status == TaskStatus::Completed { 100.0 } else { raw };
        }

        let Some(st) = self.states.get_mut(&task_id) else {
            let phase = if raw >= 100.0 { Phase::FastPending } else { Phase::Normal };
            self.states.insert(task_id, SmoothState { shown: START_FLOOR, raw, phase });
            return START_FLOOR;
        };

        match st.phase {
            Phase::FastPending | Phase::FastHold => {
                st.phase = Phase::FastHold;
                st.shown = FAST_PHASE_VALUE;
                st.raw = raw;
                return FAST_PHASE_VALUE;
            }
            Phase::Normal => {}
        }

        let prev_shown = st.shown;
        let prev_raw = st.raw;
        st.raw = raw;

        // fragment restarted upstream
        if raw < prev_raw {
            st.shown = raw;
            return raw;
        }

        if raw >= 100.0 && prev_shown > START_FLOOR {
            st.shown = 100.0;
            return 100.0;
        }

        let target = prev_shown.max(raw);
        let shown = (prev_shown + (target - prev_shown) / 2.0)
            .max(prev_shown)
            .min(CAP_UNTIL_COMPLETED);
        st.shown = shown;
        shown
    }

    /// Drops state for tasks that no longer appear in a listing.
    pub fn retain_only(&mut self, live: &[TaskId]) {
        self.states.retain(|id, _| live.contains(id));
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: TaskStatus = TaskStatus::Downloading;

    #[test]
    fn normal_sequence_rises_without_reaching_100() {
        let mut s = ProgressSmoother::new();
        let shown: Vec<f64> = [0.0, 30.0, 60.0, 99.0].iter().map(|r| s.smooth(1, *r, D)).collect();
        assert_eq!(shown[0], 1.0);
        assert!(shown.windows(2).all(|w| w[1] >= w[0]), "{shown:?}");
        assert!(shown.iter().all(|v| *v < 100.0));
        assert_eq!(shown[1], 15.5);
        assert_eq!(s.smooth(1, 99.0, TaskStatus::Completed), 100.0);
        assert_eq!(s.tracked(), 0);
    }

    #[test]
    fn raw_100_after_visible_progress_snaps_to_100() {
        let mut s = ProgressSmoother::new();
        s.smooth(1, 0.0, D);
        s.smooth(1, 30.0, D);
        s.smooth(1, 60.0, D);
        assert_eq!(s.smooth(1, 100.0, D), 100.0);
    }

    #[test]
    fn first_sample_at_100_enters_fast_phase() {
        let mut s = ProgressSmoother::new();
        assert_eq!(s.smooth(7, 100.0, D), 1.0);
        assert_eq!(s.smooth(7, 100.0, D), 50.0);
        assert_eq!(s.smooth(7, 100.0, D), 50.0);
        assert_eq!(s.smooth(7, 100.0, D), 50.0);
        assert_eq!(s.smooth(7, 100.0, TaskStatus::Completed), 100.0);
    }

    #[test]
    fn regression_drops_shown_to_raw() {
        let mut s = ProgressSmoother::new();
        s.smooth(3, 0.0, D);
        let mut shown = 0.0;
        for _ in 0..12 {
            shown = s.smooth(3, 90.0, D);
        }
        assert!((shown - 90.0).abs() < 0.1);
        assert_eq!(s.smooth(3, 80.0, D), 80.0);
    }

    #[test]
    fn non_downloading_statuses_pass_raw_through() {
        let mut s = ProgressSmoother::new();
        s.smooth(1, 40.0, D);
        assert_eq!(s.smooth(1, 40.0, TaskStatus::Error), 40.0);
        assert_eq!(s.smooth(2, 0.0, TaskStatus::Pending), 0.0);
        assert_eq!(s.tracked(), 0);
        // state was dropped, so the next DOWNLOADING sample starts over at 1
        assert_eq!(s.smooth(1, 40.0, D), 1.0);
    }

    #[test]
    fn tasks_do_not_interact() {
        let mut s = ProgressSmoother::new();
        assert_eq!(s.smooth(1, 100.0, D), 1.0);
        assert_eq!(s.smooth(2, 20.0, D), 1.0);
        assert_eq!(s.smooth(2, 20.0, D), 10.5);
        assert_eq!(s.smooth(1, 100.0, D), 50.0);
        s.retain_only(&[2]);
        assert_eq!(s.tracked(), 1);
    }
}
