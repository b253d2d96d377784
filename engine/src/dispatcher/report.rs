// Outcomes of schedule and fire operations

use crate::errors::DispatchError;
use crate::models::{JobHandle, LifecycleState};

/// Result of a successful `schedule` call
#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    /// Dispatched inline because the trigger resolved to immediate
    Fired(FireReport),
    /// Handed to the queue for a one-off fire
    Queued(JobHandle),
    /// Handed to the queue as a recurring registration
    Recurring(JobHandle),
}

impl ScheduleOutcome {
    pub fn state(&self) -> LifecycleState {
        match self {
            ScheduleOutcome::Fired(report) => report.state,
            ScheduleOutcome::Queued(_) | ScheduleOutcome::Recurring(_) => LifecycleState::Queued,
        }
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        match self {
            ScheduleOutcome::Fired(_) => None,
            ScheduleOutcome::Queued(handle) | ScheduleOutcome::Recurring(handle) => Some(handle),
        }
    }

    pub fn report(&self) -> Option<&FireReport> {
        match self {
            ScheduleOutcome::Fired(report) => Some(report),
            _ => None,
        }
    }
}

/// A (recipient, backend) pair that was delivered
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeliveredPair {
    pub recipient_id: String,
    pub backend: String,
}

/// A (recipient, backend) pair that failed; other pairs are unaffected
#[derive(Debug, Clone)]
pub struct PairFailure {
    pub recipient_id: String,
    pub backend: String,
    pub error: DispatchError,
}

/// Per-fire summary
#[derive(Debug, Clone)]
pub struct FireReport {
    pub notification: String,
    pub event_id: String,
    pub recipients: usize,
    pub backends: Vec<String>,
    /// Sorted by (recipient, backend)
    pub delivered: Vec<DeliveredPair>,
    /// Sorted by (recipient, backend)
    pub failures: Vec<PairFailure>,
    /// Next occurrence armed for recurring events
    pub rearmed: Option<JobHandle>,
    pub state: LifecycleState,
}

impl FireReport {
    pub fn new(notification: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            notification: notification.into(),
            event_id: event_id.into(),
            recipients: 0,
            backends: Vec::new(),
            delivered: Vec::new(),
            failures: Vec::new(),
            rearmed: None,
            state: LifecycleState::Firing,
        }
    }

    /// Number of pairs attempted
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failures.len()
    }

    /// Whether every attempted pair was delivered
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn finish(&mut self) {
        self.delivered.sort();
        self.failures.sort_by(|a, b| {
            (a.recipient_id.as_str(), a.backend.as_str())
                .cmp(&(b.recipient_id.as_str(), b.backend.as_str()))
        });
        self.state = LifecycleState::Complete;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DeliveryError;
    use chrono::Utc;

    #[test]
    fn test_finish_sorts_and_completes() {
        let mut report = FireReport::new("n", "evt");
        report.delivered.push(DeliveredPair {
            recipient_id: "b".to_string(),
            backend: "email".to_string(),
        });
        report.delivered.push(DeliveredPair {
            recipient_id: "a".to_string(),
            backend: "sms".to_string(),
        });
        report.failures.push(PairFailure {
            recipient_id: "c".to_string(),
            backend: "sms".to_string(),
            error: DispatchError::Delivery(DeliveryError::Timeout("5s".to_string())),
        });
        report.failures.push(PairFailure {
            recipient_id: "c".to_string(),
            backend: "email".to_string(),
            error: DispatchError::UnknownBackend("email".to_string()),
        });

        report.finish();

        assert_eq!(report.state, LifecycleState::Complete);
        assert_eq!(report.delivered[0].recipient_id, "a");
        assert_eq!(report.failures[0].backend, "email");
        assert_eq!(report.attempted(), 4);
        assert!(!report.is_success());
    }

    #[test]
    fn test_outcome_accessors() {
        let handle = JobHandle {
            id: "evt".to_string(),
            fire_at: Utc::now(),
            recurring: false,
        };
        let queued = ScheduleOutcome::Queued(handle.clone());
        assert_eq!(queued.state(), LifecycleState::Queued);
        assert_eq!(queued.handle(), Some(&handle));
        assert!(queued.report().is_none());
    }
}
