//! Retry budget for transiently failing units.

/// Decides whether a transiently failed unit gets another attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` invocations per unit (at least one).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Handles a transient failure after `attempts` invocations.
    pub fn on_transient(&self, attempts: u32, reason: &str) -> FailureAction {
        if attempts < self.max_attempts {
            FailureAction::Retrying {
                attempt: attempts,
                max_attempts: self.max_attempts,
            }
        } else {
            FailureAction::Exhausted {
                reason: format!(
                    "Exhausted {} attempts. Last error: {}",
                    self.max_attempts, reason
                ),
            }
        }
    }
}

/// Result of handling a unit failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// The unit goes back to pending for another attempt.
    Retrying { attempt: u32, max_attempts: u32 },
    /// The unit is failed and the job with it.
    Exhausted { reason: String },
}
