//! Retry scheduling policy.
//!
//! A pure function from attempt number to retry instant: the policy holds an
//! ordered list of day offsets measured from the sequence's creation, so the
//! schedule never drifts with individual attempt timing. Tenants/plans may
//! configure their own offsets; validation rejects anything that is not
//! strictly increasing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use dunning_core::{DunningError, DunningResult};

/// Default retry schedule: days 1, 3, 7, 14 and 21 after the initial failure.
pub const DEFAULT_OFFSET_DAYS: [u32; 5] = [1, 3, 7, 14, 21];

/// Consecutive failures before a sequence auto-escalates to a CSM.
pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 2;

/// Tenant/plan-configurable retry policy.
///
/// `max_attempts` is implied by the schedule length: one attempt per offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    offset_days: Vec<u32>,
    escalation_threshold: u32,
    /// Whether the orchestrator keeps charging sequences that were escalated
    /// to a human. Escalation augments automated recovery by default.
    retry_while_escalated: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            offset_days: DEFAULT_OFFSET_DAYS.to_vec(),
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            retry_while_escalated: true,
        }
    }
}

impl RetryPolicy {
    /// Build a policy from day offsets (measured from sequence creation).
    ///
    /// Offsets must be non-empty and strictly increasing; the threshold must
    /// be at least 1.
    pub fn new(offset_days: Vec<u32>, escalation_threshold: u32) -> DunningResult<Self> {
        if offset_days.is_empty() {
            return Err(DunningError::validation("retry policy needs at least one offset"));
        }
        if !offset_days.windows(2).all(|w| w[0] < w[1]) {
            return Err(DunningError::validation(format!(
                "retry offsets must be strictly increasing, got {offset_days:?}"
            )));
        }
        if escalation_threshold == 0 {
            return Err(DunningError::validation("escalation threshold must be >= 1"));
        }
        Ok(Self {
            offset_days,
            escalation_threshold,
            retry_while_escalated: true,
        })
    }

    pub fn with_retry_while_escalated(mut self, enabled: bool) -> Self {
        self.retry_while_escalated = enabled;
        self
    }

    /// Maximum automated attempts: one per scheduled offset.
    pub fn max_attempts(&self) -> u32 {
        self.offset_days.len() as u32
    }

    pub fn escalation_threshold(&self) -> u32 {
        self.escalation_threshold
    }

    pub fn retry_while_escalated(&self) -> bool {
        self.retry_while_escalated
    }

    pub fn offset_days(&self) -> &[u32] {
        &self.offset_days
    }

    /// The retry instant after `attempts_made` attempts have been consumed,
    /// or `None` once the schedule is exhausted.
    ///
    /// Attempt *n* (1-based) runs at `created_at + offsets[n-1]`, so the
    /// instant for the *next* attempt is indexed by the attempts already made.
    pub fn next_retry_at(
        &self,
        created_at: DateTime<Utc>,
        attempts_made: u32,
    ) -> Option<DateTime<Utc>> {
        self.offset_days
            .get(attempts_made as usize)
            .map(|days| created_at + Duration::days(i64::from(*days)))
    }

    /// Time left until the scheduled retry, clamped to zero when overdue.
    ///
    /// `pause` snapshots this so `resume` can restore relative spacing
    /// instead of restarting the clock.
    pub fn remaining_offset(next_retry_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (next_retry_at - now).max(Duration::zero())
    }
}
