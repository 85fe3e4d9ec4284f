/// Fixed polling cadence: one status check every 3 seconds, at most 60
/// checks (~3 minutes) before the job is declared timed out.
pub const POLL_INTERVAL_SECS: u64 = 3;
pub const MAX_STATUS_CHECKS: u32 = 60;

/// Status as reported by the provider. The in-progress vocabulary is an
/// open set; anything that is not exactly `Ready` or `Failed` keeps the
/// job pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Ready,
    Failed,
    Pending(String),
}

impl JobStatus {
    pub fn from_label(label: &str) -> JobStatus {
        match label {
            "Ready" => JobStatus::Ready,
            "Failed" => JobStatus::Failed,
            other => JobStatus::Pending(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            JobStatus::Ready => "Ready",
            JobStatus::Failed => "Failed",
            JobStatus::Pending(label) => label.as_str(),
        }
    }
}

/// Lifecycle of a submitted job: `Pending -> Ready | Failed | TimedOut`.
/// Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Ready,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn observe(self, status: &JobStatus) -> JobState {
        if self.is_terminal() {
            return self;
        }
        match status {
            JobStatus::Ready => JobState::Ready,
            JobStatus::Failed => JobState::Failed,
            JobStatus::Pending(_) => JobState::Pending,
        }
    }

    pub fn time_out(self) -> JobState {
        if self.is_terminal() {
            return self;
        }
        JobState::TimedOut
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Pending)
    }
}

/// Cosmetic completion estimate after `checks` status checks. Climbs five
/// points per check and holds at 95 until the job is actually ready.
pub fn progress_estimate(checks: u32) -> u8 {
    let pct = checks.saturating_mul(100) / 20;
    pct.min(95) as u8
}

#[cfg(test)]
mod tests {
    use super::{progress_estimate, JobState, JobStatus, MAX_STATUS_CHECKS};

    #[test]
    fn status_parse_treats_unknown_labels_as_pending() {
        assert_eq!(JobStatus::from_label("Ready"), JobStatus::Ready);
        assert_eq!(JobStatus::from_label("Failed"), JobStatus::Failed);
        assert_eq!(
            JobStatus::from_label("Queued"),
            JobStatus::Pending("Queued".to_string())
        );
        assert_eq!(
            JobStatus::from_label("Task in progress"),
            JobStatus::Pending("Task in progress".to_string())
        );
        // case matters on the wire
        assert_eq!(
            JobStatus::from_label("ready"),
            JobStatus::Pending("ready".to_string())
        );
    }

    #[test]
    fn pending_transitions_on_terminal_statuses() {
        assert_eq!(
            JobState::Pending.observe(&JobStatus::Ready),
            JobState::Ready
        );
        assert_eq!(
            JobState::Pending.observe(&JobStatus::Failed),
            JobState::Failed
        );
        assert_eq!(
            JobState::Pending.observe(&JobStatus::Pending("Queued".to_string())),
            JobState::Pending
        );
    }

    #[test]
    fn terminal_states_never_transition_again() {
        for state in [JobState::Ready, JobState::Failed, JobState::TimedOut] {
            assert_eq!(state.observe(&JobStatus::Failed), state);
            assert_eq!(state.observe(&JobStatus::Ready), state);
            assert_eq!(state.time_out(), state);
            assert!(state.is_terminal());
        }
        assert_eq!(JobState::Pending.time_out(), JobState::TimedOut);
        assert!(!JobState::Pending.is_terminal());
    }

    #[test]
    fn progress_is_monotonic_and_capped_below_100() {
        let mut last = 0;
        for checks in 0..=MAX_STATUS_CHECKS {
            let pct = progress_estimate(checks);
            assert!(pct >= last);
            assert!(pct < 100);
            last = pct;
        }
        assert_eq!(progress_estimate(1), 5);
        assert_eq!(progress_estimate(19), 95);
        assert_eq!(progress_estimate(60), 95);
    }
}
