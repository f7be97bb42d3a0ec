//! Saga tunables.

use chrono::Duration;
use store::DEFAULT_APPROVAL_GRACE_HOURS;

/// Default number of insert attempts when the order reference collides.
pub const DEFAULT_REFERENCE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Time between postulation and the approval deadline. Also the
    /// reservation window of the stall.
    pub approval_grace: Duration,
    pub reference_attempts: u32,
}

impl SagaConfig {
    pub fn with_approval_grace_hours(mut self, hours: i64) -> Self {
        self.approval_grace = Duration::hours(hours);
        self
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            approval_grace: Duration::hours(DEFAULT_APPROVAL_GRACE_HOURS),
            reference_attempts: DEFAULT_REFERENCE_ATTEMPTS,
        }
    }
}
