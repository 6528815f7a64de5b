//! The dunning sequence entity and its state machine.
//!
//! A sequence is the unit of recovery work for one overdue invoice. All
//! mutation goes through the transition methods below; each one guards the
//! allowed source states and bumps the entity version so the repository can
//! enforce optimistic concurrency.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use dunning_core::{
    CsmId, DunningError, DunningResult, Entity, InvoiceId, Money, OrganizationId, SequenceId,
    SubscriptionId,
};

use crate::policy::RetryPolicy;

/// Recovery lifecycle status.
///
/// `Active` is initial; `Recovered`, `Cancelled` and `Exhausted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DunningStatus {
    Active,
    Paused,
    Escalated,
    Recovered,
    Cancelled,
    Exhausted,
}

impl DunningStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Recovered | Self::Cancelled | Self::Exhausted)
    }

    /// True while the orchestrator may still schedule automated charges.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Active | Self::Escalated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Escalated => "escalated",
            Self::Recovered => "recovered",
            Self::Cancelled => "cancelled",
            Self::Exhausted => "exhausted",
        }
    }
}

impl core::str::FromStr for DunningStatus {
    type Err = DunningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "escalated" => Ok(Self::Escalated),
            "recovered" => Ok(Self::Recovered),
            "cancelled" => Ok(Self::Cancelled),
            "exhausted" => Ok(Self::Exhausted),
            other => Err(DunningError::validation(format!(
                "unknown dunning status {other:?}"
            ))),
        }
    }
}

impl core::fmt::Display for DunningStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    /// A tick found the sequence paused after it had already been selected;
    /// no charge was made and no attempt was consumed.
    SkippedPaused,
}

/// One entry in a sequence's attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based, never exceeds the sequence's `max_attempts`.
    pub attempt_number: u32,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub failure_reason: Option<String>,
}

/// Operator/system note, append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// What a successful `retry_payment` did to the sequence. The orchestrator
/// uses this to decide on notifications and CSM assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Payment went through; the sequence is recovered.
    Recovered,
    /// Final allowed attempt failed; no further automated retries.
    Exhausted,
    /// Attempt failed but the schedule continues.
    Rescheduled {
        next_retry_at: DateTime<Utc>,
        /// True when this failure crossed the escalation threshold.
        escalated: bool,
    },
}

/// Payment-recovery sequence for one overdue invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DunningSequence {
    id: SequenceId,
    organization_id: OrganizationId,
    invoice_id: InvoiceId,
    subscription_id: SubscriptionId,
    status: DunningStatus,
    attempts_made: u32,
    max_attempts: u32,
    /// Outstanding balance frozen at creation; partial payments are out of
    /// scope and never adjust this.
    amount_at_risk: Money,
    /// Decline reason reported for the original failed payment.
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    next_retry_at: Option<DateTime<Utc>>,
    escalated_at: Option<DateTime<Utc>>,
    recovered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    assigned_csm_id: Option<CsmId>,
    pause_reason: Option<String>,
    cancel_reason: Option<String>,
    recovery_method: Option<String>,
    /// Status to return to on resume (Active or Escalated).
    paused_from: Option<DunningStatus>,
    /// Remaining time to the next retry, snapshotted at pause.
    paused_remaining_ms: Option<i64>,
    attempts: Vec<AttemptRecord>,
    notes: Vec<Note>,
    version: u64,
}

impl DunningSequence {
    /// Open a new sequence for a failed invoice payment.
    ///
    /// `max_attempts` and the first retry instant are fixed here from the
    /// active policy; later policy changes do not rewrite in-flight work.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: SequenceId,
        organization_id: OrganizationId,
        invoice_id: InvoiceId,
        subscription_id: SubscriptionId,
        amount_at_risk: Money,
        failure_reason: Option<String>,
        policy: &RetryPolicy,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            organization_id,
            invoice_id,
            subscription_id,
            status: DunningStatus::Active,
            attempts_made: 0,
            max_attempts: policy.max_attempts(),
            amount_at_risk,
            failure_reason,
            created_at,
            // A validated policy always has a first offset.
            next_retry_at: policy.next_retry_at(created_at, 0),
            escalated_at: None,
            recovered_at: None,
            cancelled_at: None,
            assigned_csm_id: None,
            pause_reason: None,
            cancel_reason: None,
            recovery_method: None,
            paused_from: None,
            paused_remaining_ms: None,
            attempts: Vec::new(),
            notes: Vec::new(),
            version: 1,
        }
    }

    // --- accessors -------------------------------------------------------

    pub fn id_typed(&self) -> SequenceId {
        self.id
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    pub fn invoice_id(&self) -> InvoiceId {
        self.invoice_id
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    pub fn status(&self) -> DunningStatus {
        self.status
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn amount_at_risk(&self) -> &Money {
        &self.amount_at_risk
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub fn escalated_at(&self) -> Option<DateTime<Utc>> {
        self.escalated_at
    }

    pub fn recovered_at(&self) -> Option<DateTime<Utc>> {
        self.recovered_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn assigned_csm_id(&self) -> Option<CsmId> {
        self.assigned_csm_id
    }

    pub fn pause_reason(&self) -> Option<&str> {
        self.pause_reason.as_deref()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn recovery_method(&self) -> Option<&str> {
        self.recovery_method.as_deref()
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    /// Whole days elapsed since the sequence was opened ("day N of sequence").
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }

    /// Instant the sequence reached a terminal status, for report windowing.
    /// Exhaustion carries no dedicated timestamp; the final attempt stands in.
    pub fn terminated_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            DunningStatus::Recovered => self.recovered_at,
            DunningStatus::Cancelled => self.cancelled_at,
            DunningStatus::Exhausted => self.attempts.last().map(|a| a.attempted_at),
            _ => None,
        }
    }

    /// Trailing run of failed charges (skipped ticks do not break the run).
    fn consecutive_failures(&self) -> u32 {
        self.attempts
            .iter()
            .rev()
            .filter(|a| a.outcome != AttemptOutcome::SkippedPaused)
            .take_while(|a| a.outcome == AttemptOutcome::Failure)
            .count() as u32
    }

    fn reject(&self, event: &'static str) -> DunningError {
        DunningError::invalid_transition(self.status.as_str(), event)
    }

    fn ensure_not_terminal(&self, event: &'static str) -> DunningResult<()> {
        if self.status.is_terminal() {
            return Err(self.reject(event));
        }
        Ok(())
    }

    // --- transitions -----------------------------------------------------

    /// Record a charge attempt and apply its outcome.
    ///
    /// Only legal from `Active`/`Escalated`, and only once the scheduled
    /// retry instant has passed. This is the one event that moves money, so
    /// callers derive an idempotency key from `attempts_made() + 1` before
    /// charging.
    pub fn retry_payment(
        &mut self,
        outcome: AttemptOutcome,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> DunningResult<RetryDisposition> {
        if !self.status.is_retryable() {
            return Err(self.reject("retry_payment"));
        }
        if outcome == AttemptOutcome::SkippedPaused {
            return Err(DunningError::validation(
                "skipped_paused is recorded via record_paused_skip, not retry_payment",
            ));
        }
        if let Some(next) = self.next_retry_at {
            if next > now {
                return Err(DunningError::too_early(next));
            }
        }

        // Resolve the follow-up instant before touching state, so a policy
        // that no longer covers this sequence cannot leave it half-applied.
        let reschedule_at = if outcome == AttemptOutcome::Failure
            && self.attempts_made + 1 < self.max_attempts
        {
            Some(
                policy
                    .next_retry_at(self.created_at, self.attempts_made + 1)
                    .ok_or_else(|| {
                        DunningError::validation(
                            "retry policy shorter than the sequence's max_attempts",
                        )
                    })?,
            )
        } else {
            None
        };

        self.attempts_made += 1;
        self.attempts.push(AttemptRecord {
            attempt_number: self.attempts_made,
            attempted_at: now,
            outcome,
            failure_reason,
        });

        let disposition = if outcome == AttemptOutcome::Success {
            self.status = DunningStatus::Recovered;
            self.recovered_at = Some(now);
            self.recovery_method = Some("automatic_retry".to_string());
            self.next_retry_at = None;
            RetryDisposition::Recovered
        } else if self.attempts_made >= self.max_attempts {
            self.status = DunningStatus::Exhausted;
            self.next_retry_at = None;
            RetryDisposition::Exhausted
        } else {
            // Guarded above: a failure below max_attempts always has a slot.
            let next = reschedule_at.ok_or_else(|| {
                DunningError::validation("retry policy shorter than the sequence's max_attempts")
            })?;
            self.next_retry_at = Some(next);

            let mut escalated = false;
            if self.status == DunningStatus::Active
                && self.consecutive_failures() >= policy.escalation_threshold()
            {
                self.status = DunningStatus::Escalated;
                self.escalated_at = Some(now);
                escalated = true;
            }
            RetryDisposition::Rescheduled {
                next_retry_at: next,
                escalated,
            }
        };

        self.version += 1;
        Ok(disposition)
    }

    /// Suspend automated retries, preserving the relative gap to the next
    /// attempt so `resume` does not restart the clock.
    pub fn pause(&mut self, reason: Option<String>, now: DateTime<Utc>) -> DunningResult<()> {
        if !self.status.is_retryable() {
            return Err(self.reject("pause"));
        }
        self.paused_remaining_ms = self
            .next_retry_at
            .map(|next| RetryPolicy::remaining_offset(next, now).num_milliseconds());
        self.paused_from = Some(self.status);
        self.pause_reason = reason;
        self.status = DunningStatus::Paused;
        self.next_retry_at = None;
        self.version += 1;
        Ok(())
    }

    /// Return to the pre-pause status with the snapshotted offset re-applied.
    pub fn resume(&mut self, now: DateTime<Utc>) -> DunningResult<()> {
        if self.status != DunningStatus::Paused {
            return Err(self.reject("resume"));
        }
        self.status = self.paused_from.take().unwrap_or(DunningStatus::Active);
        let remaining = Duration::milliseconds(self.paused_remaining_ms.take().unwrap_or(0));
        self.next_retry_at = Some(now + remaining);
        self.pause_reason = None;
        self.version += 1;
        Ok(())
    }

    /// Hand the sequence to a CSM. Automated retries keep running; escalation
    /// augments recovery rather than halting it.
    pub fn escalate_to_csm(
        &mut self,
        csm_id: CsmId,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> DunningResult<()> {
        if self.status != DunningStatus::Active {
            return Err(self.reject("escalate_to_csm"));
        }
        self.status = DunningStatus::Escalated;
        self.escalated_at = Some(now);
        self.assigned_csm_id = Some(csm_id);
        if let Some(text) = note {
            self.notes.push(Note {
                author: "escalation".to_string(),
                timestamp: now,
                text,
            });
        }
        self.version += 1;
        Ok(())
    }

    /// (Re)assign the responsible CSM without changing status.
    pub fn assign_csm(&mut self, csm_id: CsmId) -> DunningResult<()> {
        self.ensure_not_terminal("assign_csm")?;
        self.assigned_csm_id = Some(csm_id);
        self.version += 1;
        Ok(())
    }

    /// Abandon recovery. Terminal.
    pub fn cancel(&mut self, reason: Option<String>, now: DateTime<Utc>) -> DunningResult<()> {
        self.ensure_not_terminal("cancel")?;
        self.status = DunningStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.cancel_reason = reason;
        self.next_retry_at = None;
        self.paused_from = None;
        self.paused_remaining_ms = None;
        self.version += 1;
        Ok(())
    }

    /// Manual override for payments collected out-of-band. Terminal.
    pub fn mark_recovered(
        &mut self,
        method: impl Into<String>,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> DunningResult<()> {
        self.ensure_not_terminal("mark_recovered")?;
        self.status = DunningStatus::Recovered;
        self.recovered_at = Some(now);
        self.recovery_method = Some(method.into());
        if let Some(text) = note {
            self.notes.push(Note {
                author: "recovery".to_string(),
                timestamp: now,
                text,
            });
        }
        self.next_retry_at = None;
        self.paused_from = None;
        self.paused_remaining_ms = None;
        self.version += 1;
        Ok(())
    }

    /// Append an operator note. Legal in every state.
    pub fn add_note(
        &mut self,
        author: impl Into<String>,
        text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DunningResult<()> {
        self.notes.push(Note {
            author: author.into(),
            timestamp: now,
            text: text.into(),
        });
        self.version += 1;
        Ok(())
    }

    /// Record that a tick selected this sequence but found it paused before
    /// charging. Does not consume an attempt.
    pub fn record_paused_skip(&mut self, now: DateTime<Utc>) -> DunningResult<()> {
        if self.status != DunningStatus::Paused {
            return Err(self.reject("record_paused_skip"));
        }
        self.attempts.push(AttemptRecord {
            attempt_number: self.attempts_made + 1,
            attempted_at: now,
            outcome: AttemptOutcome::SkippedPaused,
            failure_reason: None,
        });
        self.version += 1;
        Ok(())
    }
}

impl Entity for DunningSequence {
    type Id = SequenceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
