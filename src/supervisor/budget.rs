use crate::config::RestartBudget;
use std::collections::VecDeque;
use std::time::Instant;

/// Rolling record of one slot's recent crashes.
#[derive(Debug, Default)]
pub(crate) struct CrashHistory {
    recent: VecDeque<Instant>,
}

impl CrashHistory {
    /// Record a crash at `now`. Returns `true` once the slot has crashed more
    /// than `budget.max_restarts` times within `budget.window`.
    pub(crate) fn record(&mut self, now: Instant, budget: &RestartBudget) -> bool {
        self.recent.push_back(now);

        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) > budget.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        self.recent.len() > budget.max_restarts as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.recent.len()
    }

    pub(crate) fn clear(&mut self) {
        self.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exceeding_budget_within_window() {
        let budget = RestartBudget::new(2, Duration::from_millis(1000));
        let mut history = CrashHistory::default();
        let t0 = Instant::now();

        assert!(!history.record(t0, &budget));
        assert!(!history.record(t0 + Duration::from_millis(200), &budget));
        assert!(history.record(t0 + Duration::from_millis(400), &budget));
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_old_crashes_fall_out_of_window() {
        let budget = RestartBudget::new(2, Duration::from_millis(1000));
        let mut history = CrashHistory::default();
        let t0 = Instant::now();

        assert!(!history.record(t0, &budget));
        assert!(!history.record(t0 + Duration::from_millis(100), &budget));
        // first two are more than a window old by now
        assert!(!history.record(t0 + Duration::from_millis(1500), &budget));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_zero_budget_disables_on_first_crash() {
        let budget = RestartBudget::new(0, Duration::from_secs(1));
        let mut history = CrashHistory::default();
        assert!(history.record(Instant::now(), &budget));
    }

    #[test]
    fn test_clear_resets() {
        let budget = RestartBudget::new(1, Duration::from_secs(10));
        let mut history = CrashHistory::default();
        let t0 = Instant::now();
        history.record(t0, &budget);
        assert!(history.record(t0, &budget));

        history.clear();
        assert_eq!(history.len(), 0);
        assert!(!history.record(t0, &budget));
    }
}
