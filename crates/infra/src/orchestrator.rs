//! Scheduled retry orchestrator.
//!
//! `tick(now)` drains the due sequences and drives one charge attempt each,
//! with bounded parallelism and no shared mutable state between sequences.
//! One sequence failing never aborts the tick; everything is accumulated
//! into a [`TickReport`] and logged with structured fields.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use dunning_core::{DunningError, Entity, SequenceId};
use dunning_sequence::{AttemptOutcome, DunningStatus, RetryDisposition, RetryPolicy};

use crate::ports::{ChargeOutcome, CsmAssignmentPort, NotificationPort, PaymentGatewayPort};
use crate::repository::DunningRepository;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrent charge attempts per tick.
    pub max_concurrent: usize,
    /// Due sequences taken per tick; the rest wait for the next one.
    pub batch_limit: usize,
    pub policy: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            batch_limit: 100,
            policy: RetryPolicy::default(),
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Due sequences selected for processing.
    pub selected: u64,
    pub recovered: u64,
    /// Declined but the schedule continues.
    pub rescheduled: u64,
    /// Rescheduled attempts that crossed the escalation threshold.
    pub escalated: u64,
    pub exhausted: u64,
    /// Selected while a concurrent pause landed; recorded, no charge made.
    pub skipped_paused: u64,
    /// Selected but no longer chargeable on the fresh read (raced a manual
    /// operation or a competing tick).
    pub skipped_stale: u64,
    /// Gateway transient failures; no attempt consumed.
    pub transient_failures: u64,
    /// Lost optimistic-concurrency races on save.
    pub conflicts: u64,
    /// Unexpected per-sequence errors.
    pub errors: u64,
}

enum SequenceOutcome {
    Recovered,
    Rescheduled { escalated: bool },
    Exhausted,
    SkippedPaused,
    SkippedStale,
    Transient,
    Conflict,
    Error,
}

impl TickReport {
    fn absorb(&mut self, outcome: SequenceOutcome) {
        match outcome {
            SequenceOutcome::Recovered => self.recovered += 1,
            SequenceOutcome::Rescheduled { escalated } => {
                self.rescheduled += 1;
                if escalated {
                    self.escalated += 1;
                }
            }
            SequenceOutcome::Exhausted => self.exhausted += 1,
            SequenceOutcome::SkippedPaused => self.skipped_paused += 1,
            SequenceOutcome::SkippedStale => self.skipped_stale += 1,
            SequenceOutcome::Transient => self.transient_failures += 1,
            SequenceOutcome::Conflict => self.conflicts += 1,
            SequenceOutcome::Error => self.errors += 1,
        }
    }
}

/// Drives scheduled retries over the repository and outbound ports.
pub struct DunningOrchestrator {
    repository: Arc<dyn DunningRepository>,
    gateway: Arc<dyn PaymentGatewayPort>,
    notifier: Arc<dyn NotificationPort>,
    csm_pool: Arc<dyn CsmAssignmentPort>,
    config: OrchestratorConfig,
}

impl DunningOrchestrator {
    pub fn new(
        repository: Arc<dyn DunningRepository>,
        gateway: Arc<dyn PaymentGatewayPort>,
        notifier: Arc<dyn NotificationPort>,
        csm_pool: Arc<dyn CsmAssignmentPort>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repository,
            gateway,
            notifier,
            csm_pool,
            config,
        }
    }

    /// Process every due sequence once.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let due = match self.repository.list_due_for_retry(now).await {
            Ok(due) => due,
            Err(error) => {
                warn!(error = %error, "tick aborted: could not list due sequences");
                report.errors += 1;
                return report;
            }
        };

        let mut ids: Vec<SequenceId> = due
            .into_iter()
            .filter(|seq| {
                self.config.policy.retry_while_escalated()
                    || seq.status() != DunningStatus::Escalated
            })
            .map(|seq| seq.id_typed())
            .collect();
        ids.truncate(self.config.batch_limit);
        report.selected = ids.len() as u64;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for id in ids {
            let permit_source = semaphore.clone();
            let repository = self.repository.clone();
            let gateway = self.gateway.clone();
            let notifier = self.notifier.clone();
            let csm_pool = self.csm_pool.clone();
            let policy = self.config.policy.clone();

            tasks.spawn(async move {
                let _permit = permit_source.acquire_owned().await;
                process_sequence(id, now, &policy, repository, gateway, notifier, csm_pool).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.absorb(outcome),
                Err(error) => {
                    warn!(error = %error, "sequence task panicked");
                    report.errors += 1;
                }
            }
        }

        info!(
            selected = report.selected,
            recovered = report.recovered,
            rescheduled = report.rescheduled,
            escalated = report.escalated,
            exhausted = report.exhausted,
            skipped_paused = report.skipped_paused,
            transient = report.transient_failures,
            conflicts = report.conflicts,
            errors = report.errors,
            "dunning tick complete"
        );
        report
    }
}

/// One sequence, end to end: fresh read, charge, apply, save, side effects.
async fn process_sequence(
    id: SequenceId,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
    repository: Arc<dyn DunningRepository>,
    gateway: Arc<dyn PaymentGatewayPort>,
    notifier: Arc<dyn NotificationPort>,
    csm_pool: Arc<dyn CsmAssignmentPort>,
) -> SequenceOutcome {
    // Never charge off the listing snapshot: money moves here, so decisions
    // are made on a fresh read and persisted against its version.
    let mut sequence = match repository.get(id).await {
        Ok(seq) => seq,
        Err(error) => {
            warn!(sequence_id = %id, error = %error, "could not load due sequence");
            return SequenceOutcome::Error;
        }
    };

    if sequence.status() == DunningStatus::Paused {
        let expected = sequence.version();
        if let Err(error) = sequence.record_paused_skip(now) {
            warn!(sequence_id = %id, error = %error, "could not record paused skip");
            return SequenceOutcome::Error;
        }
        return match repository.save(&sequence, expected).await {
            Ok(()) => SequenceOutcome::SkippedPaused,
            Err(DunningError::ConcurrentModification { .. }) => SequenceOutcome::Conflict,
            Err(error) => {
                warn!(sequence_id = %id, error = %error, "could not save paused skip");
                SequenceOutcome::Error
            }
        };
    }

    if !sequence.status().is_retryable()
        || sequence.next_retry_at().is_none_or(|next| next > now)
    {
        debug!(sequence_id = %id, status = %sequence.status(), "no longer due, skipping");
        return SequenceOutcome::SkippedStale;
    }

    let idempotency_key = format!("{}:{}", id, sequence.attempts_made() + 1);
    let charge = gateway
        .charge(sequence.invoice_id(), sequence.amount_at_risk(), &idempotency_key)
        .await;

    let attempt = match charge {
        Ok(ChargeOutcome::Approved) => (AttemptOutcome::Success, None),
        Ok(ChargeOutcome::Declined { reason }) => (AttemptOutcome::Failure, Some(reason)),
        Ok(ChargeOutcome::TransientError { message }) | Err(DunningError::Gateway { transient: true, message }) => {
            warn!(sequence_id = %id, error = %message, "transient gateway failure, attempt not consumed");
            return SequenceOutcome::Transient;
        }
        Err(error) => {
            warn!(sequence_id = %id, error = %error, "gateway call failed");
            return SequenceOutcome::Error;
        }
    };

    let expected = sequence.version();
    let disposition = match sequence.retry_payment(attempt.0, attempt.1, now, policy) {
        Ok(d) => d,
        Err(error) => {
            warn!(sequence_id = %id, error = %error, "attempt could not be applied");
            return SequenceOutcome::Error;
        }
    };

    if let RetryDisposition::Rescheduled { escalated: true, .. } = disposition {
        if sequence.assigned_csm_id().is_none() {
            match csm_pool.assign(None).await {
                Ok(csm_id) => {
                    // Status is already Escalated; this only fills the assignee.
                    if let Err(error) = sequence.assign_csm(csm_id) {
                        warn!(sequence_id = %id, error = %error, "could not record CSM");
                    }
                }
                Err(error) => {
                    warn!(sequence_id = %id, error = %error, "CSM assignment failed")
                }
            }
        }
    }

    if let Err(error) = repository.save(&sequence, expected).await {
        return match error {
            DunningError::ConcurrentModification { .. } => {
                debug!(sequence_id = %id, "lost save race, next tick re-evaluates");
                SequenceOutcome::Conflict
            }
            other => {
                warn!(sequence_id = %id, error = %other, "could not persist attempt");
                SequenceOutcome::Error
            }
        };
    }

    // Notifications happen after the attempt is durable; failures only log.
    match disposition {
        RetryDisposition::Recovered => {
            if let Err(error) = notifier.send_recovery_confirmation(id).await {
                warn!(sequence_id = %id, error = %error, "recovery confirmation failed");
            }
            SequenceOutcome::Recovered
        }
        RetryDisposition::Rescheduled { escalated, .. } => {
            if let Err(error) = notifier.send_payment_link(id).await {
                warn!(sequence_id = %id, error = %error, "payment link send failed");
            }
            SequenceOutcome::Rescheduled { escalated }
        }
        RetryDisposition::Exhausted => {
            info!(sequence_id = %id, attempts = sequence.attempts_made(), "sequence exhausted");
            SequenceOutcome::Exhausted
        }
    }
}
