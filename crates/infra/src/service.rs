//! Manual operation surface used by the HTTP layer.
//!
//! Every mutation is read → transition → save with the version that was
//! read, so two operators (or an operator racing the orchestrator) cannot
//! silently overwrite each other.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use dunning_core::{
    CsmId, DunningResult, Entity, InvoiceId, Money, OrganizationId, SequenceId, SubscriptionId,
};
use dunning_sequence::{
    AttemptOutcome, DunningSequence, DunningStatus, RetryDisposition, RetryPolicy,
};

use crate::ports::{ChargeOutcome, CsmAssignmentPort, NotificationPort, PaymentGatewayPort};
use crate::reporting::{self, DunningStatistics, RevenueAtRisk};
use crate::repository::DunningRepository;

/// Request to open a sequence for a failed invoice payment.
#[derive(Debug, Clone)]
pub struct OpenSequence {
    pub organization_id: OrganizationId,
    pub invoice_id: InvoiceId,
    pub subscription_id: SubscriptionId,
    pub amount_at_risk: Money,
    pub failure_reason: Option<String>,
}

/// Application service over the repository and outbound ports.
#[derive(Clone)]
pub struct DunningService {
    repository: Arc<dyn DunningRepository>,
    gateway: Arc<dyn PaymentGatewayPort>,
    notifier: Arc<dyn NotificationPort>,
    csm_pool: Arc<dyn CsmAssignmentPort>,
    policy: RetryPolicy,
}

impl DunningService {
    pub fn new(
        repository: Arc<dyn DunningRepository>,
        gateway: Arc<dyn PaymentGatewayPort>,
        notifier: Arc<dyn NotificationPort>,
        csm_pool: Arc<dyn CsmAssignmentPort>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            repository,
            gateway,
            notifier,
            csm_pool,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[instrument(skip(self, request), fields(invoice_id = %request.invoice_id), err)]
    pub async fn open(
        &self,
        request: OpenSequence,
        now: DateTime<Utc>,
    ) -> DunningResult<DunningSequence> {
        let sequence = DunningSequence::open(
            SequenceId::new(),
            request.organization_id,
            request.invoice_id,
            request.subscription_id,
            request.amount_at_risk,
            request.failure_reason,
            &self.policy,
            now,
        );
        self.repository.save(&sequence, 0).await?;
        info!(
            sequence_id = %sequence.id_typed(),
            organization_id = %sequence.organization_id(),
            amount = %sequence.amount_at_risk(),
            "dunning sequence opened"
        );
        Ok(sequence)
    }

    pub async fn get(&self, id: SequenceId) -> DunningResult<DunningSequence> {
        self.repository.get(id).await
    }

    pub async fn list_active(&self, limit: usize) -> DunningResult<Vec<DunningSequence>> {
        self.repository.list_active(limit).await
    }

    pub async fn list_by_status(
        &self,
        status: DunningStatus,
        limit: usize,
    ) -> DunningResult<Vec<DunningSequence>> {
        self.repository.list_by_status(status, limit).await
    }

    pub async fn list_escalated(&self, limit: usize) -> DunningResult<Vec<DunningSequence>> {
        self.repository
            .list_by_status(DunningStatus::Escalated, limit)
            .await
    }

    pub async fn list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> DunningResult<Vec<DunningSequence>> {
        self.repository.list_by_organization(organization_id).await
    }

    /// The organization's in-flight sequences (Active or Escalated).
    pub async fn list_active_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> DunningResult<Vec<DunningSequence>> {
        let all = self.repository.list_by_organization(organization_id).await?;
        Ok(all
            .into_iter()
            .filter(|s| s.status().is_retryable())
            .collect())
    }

    /// Operator-triggered charge. Still honors the schedule: a retry before
    /// `next_retry_at` is rejected with `TooEarlyForRetry`, and transient
    /// gateway failures surface without consuming an attempt.
    #[instrument(skip(self), fields(sequence_id = %id), err)]
    pub async fn retry_now(&self, id: SequenceId, now: DateTime<Utc>) -> DunningResult<DunningSequence> {
        let mut sequence = self.repository.get(id).await?;
        let expected = sequence.version();

        // Same guards the attempt itself applies, checked before money moves:
        // a terminal or paused sequence must never reach the gateway.
        if !sequence.status().is_retryable() {
            return Err(dunning_core::DunningError::invalid_transition(
                sequence.status().as_str(),
                "retry_payment",
            ));
        }
        if let Some(next) = sequence.next_retry_at() {
            if next > now {
                return Err(dunning_core::DunningError::too_early(next));
            }
        }

        let idempotency_key = format!("{}:{}", id, sequence.attempts_made() + 1);
        let outcome = self
            .gateway
            .charge(sequence.invoice_id(), sequence.amount_at_risk(), &idempotency_key)
            .await?;

        let (attempt, reason) = match outcome {
            ChargeOutcome::Approved => (AttemptOutcome::Success, None),
            ChargeOutcome::Declined { reason } => (AttemptOutcome::Failure, Some(reason)),
            ChargeOutcome::TransientError { message } => {
                return Err(dunning_core::DunningError::gateway(true, message));
            }
        };

        let disposition = sequence.retry_payment(attempt, reason, now, &self.policy)?;
        self.repository.save(&sequence, expected).await?;

        if disposition == RetryDisposition::Recovered {
            if let Err(error) = self.notifier.send_recovery_confirmation(id).await {
                warn!(sequence_id = %id, error = %error, "recovery confirmation failed");
            }
        }
        Ok(sequence)
    }

    /// Send the customer a payment link and note it on the sequence.
    #[instrument(skip(self), fields(sequence_id = %id), err)]
    pub async fn send_payment_link(
        &self,
        id: SequenceId,
        now: DateTime<Utc>,
    ) -> DunningResult<DunningSequence> {
        let mut sequence = self.repository.get(id).await?;
        let expected = sequence.version();
        self.notifier.send_payment_link(id).await?;
        sequence.add_note("system", "payment link sent", now)?;
        self.repository.save(&sequence, expected).await?;
        Ok(sequence)
    }

    /// Escalate to a CSM; `preferred` wins when given, otherwise the pool
    /// picks one.
    #[instrument(skip(self), fields(sequence_id = %id), err)]
    pub async fn escalate(
        &self,
        id: SequenceId,
        preferred: Option<CsmId>,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> DunningResult<DunningSequence> {
        let mut sequence = self.repository.get(id).await?;
        let expected = sequence.version();
        let csm_id = self.csm_pool.assign(preferred).await?;
        sequence.escalate_to_csm(csm_id, note, now)?;
        self.repository.save(&sequence, expected).await?;
        info!(sequence_id = %id, csm_id = %csm_id, "sequence escalated");
        Ok(sequence)
    }

    #[instrument(skip(self), fields(sequence_id = %id), err)]
    pub async fn assign_csm(
        &self,
        id: SequenceId,
        preferred: Option<CsmId>,
    ) -> DunningResult<DunningSequence> {
        let mut sequence = self.repository.get(id).await?;
        let expected = sequence.version();
        let csm_id = self.csm_pool.assign(preferred).await?;
        sequence.assign_csm(csm_id)?;
        self.repository.save(&sequence, expected).await?;
        Ok(sequence)
    }

    #[instrument(skip(self), fields(sequence_id = %id), err)]
    pub async fn pause(
        &self,
        id: SequenceId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> DunningResult<DunningSequence> {
        let mut sequence = self.repository.get(id).await?;
        let expected = sequence.version();
        sequence.pause(reason, now)?;
        self.repository.save(&sequence, expected).await?;
        Ok(sequence)
    }

    #[instrument(skip(self), fields(sequence_id = %id), err)]
    pub async fn resume(&self, id: SequenceId, now: DateTime<Utc>) -> DunningResult<DunningSequence> {
        let mut sequence = self.repository.get(id).await?;
        let expected = sequence.version();
        sequence.resume(now)?;
        self.repository.save(&sequence, expected).await?;
        Ok(sequence)
    }

    #[instrument(skip(self), fields(sequence_id = %id), err)]
    pub async fn cancel(
        &self,
        id: SequenceId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> DunningResult<DunningSequence> {
        let mut sequence = self.repository.get(id).await?;
        let expected = sequence.version();
        sequence.cancel(reason, now)?;
        self.repository.save(&sequence, expected).await?;
        info!(sequence_id = %id, "sequence cancelled");
        Ok(sequence)
    }

    /// Record an out-of-band recovery (bank transfer, manual card entry...).
    #[instrument(skip(self), fields(sequence_id = %id), err)]
    pub async fn mark_recovered(
        &self,
        id: SequenceId,
        method: String,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> DunningResult<DunningSequence> {
        let mut sequence = self.repository.get(id).await?;
        let expected = sequence.version();
        sequence.mark_recovered(method, note, now)?;
        self.repository.save(&sequence, expected).await?;
        if let Err(error) = self.notifier.send_recovery_confirmation(id).await {
            warn!(sequence_id = %id, error = %error, "recovery confirmation failed");
        }
        Ok(sequence)
    }

    #[instrument(skip(self, text), fields(sequence_id = %id), err)]
    pub async fn add_note(
        &self,
        id: SequenceId,
        author: String,
        text: String,
        now: DateTime<Utc>,
    ) -> DunningResult<DunningSequence> {
        let mut sequence = self.repository.get(id).await?;
        let expected = sequence.version();
        sequence.add_note(author, text, now)?;
        self.repository.save(&sequence, expected).await?;
        Ok(sequence)
    }

    pub async fn revenue_at_risk(&self, now: DateTime<Utc>) -> DunningResult<RevenueAtRisk> {
        let all = self.repository.list_all().await?;
        Ok(reporting::revenue_at_risk(&all, now))
    }

    pub async fn statistics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DunningResult<DunningStatistics> {
        let all = self.repository.list_all().await?;
        Ok(reporting::statistics(&all, from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::test_support::{FixedCsmPool, RecordingNotifier, ScriptedGateway};
    use crate::repository::in_memory::InMemoryDunningRepository;
    use chrono::{Duration, TimeZone};
    use dunning_core::{Currency, DunningError};
    use std::sync::atomic::Ordering;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
    }

    fn day(n: i64) -> DateTime<Utc> {
        t0() + Duration::days(n)
    }

    fn request() -> OpenSequence {
        OpenSequence {
            organization_id: OrganizationId::new(),
            invoice_id: InvoiceId::new(),
            subscription_id: SubscriptionId::new(),
            amount_at_risk: Money::new(500_00, Currency::new("SAR").unwrap()),
            failure_reason: Some("card_expired".to_string()),
        }
    }

    struct Fixture {
        repo: Arc<InMemoryDunningRepository>,
        gateway: Arc<ScriptedGateway>,
        notifier: Arc<RecordingNotifier>,
        csm_pool: Arc<FixedCsmPool>,
        service: DunningService,
    }

    fn fixture(outcomes: Vec<ChargeOutcome>) -> Fixture {
        let repo = Arc::new(InMemoryDunningRepository::new());
        let gateway = Arc::new(ScriptedGateway::new(outcomes));
        let notifier = Arc::new(RecordingNotifier::default());
        let csm_pool = Arc::new(FixedCsmPool::default());
        let service = DunningService::new(
            repo.clone(),
            gateway.clone(),
            notifier.clone(),
            csm_pool.clone(),
            RetryPolicy::new(vec![1, 3, 7], 2).unwrap(),
        );
        Fixture {
            repo,
            gateway,
            notifier,
            csm_pool,
            service,
        }
    }

    #[tokio::test]
    async fn open_persists_a_fresh_active_sequence() {
        let f = fixture(vec![]);
        let seq = f.service.open(request(), t0()).await.unwrap();
        let stored = f.repo.get(seq.id_typed()).await.unwrap();
        assert_eq!(stored.status(), DunningStatus::Active);
        assert_eq!(stored.next_retry_at(), Some(day(1)));
        assert_eq!(stored.failure_reason(), Some("card_expired"));
    }

    #[tokio::test]
    async fn retry_now_before_schedule_is_rejected() {
        let f = fixture(vec![ChargeOutcome::Approved]);
        let seq = f.service.open(request(), t0()).await.unwrap();

        let err = f.service.retry_now(seq.id_typed(), t0()).await.unwrap_err();
        assert_eq!(err, DunningError::too_early(day(1)));

        // Nothing changed and nothing was charged.
        let stored = f.repo.get(seq.id_typed()).await.unwrap();
        assert_eq!(stored.attempts_made(), 0);
        assert_eq!(f.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn retry_now_on_cancelled_sequence_never_touches_the_gateway() {
        let f = fixture(vec![ChargeOutcome::Approved]);
        let seq = f.service.open(request(), t0()).await.unwrap();
        f.service.cancel(seq.id_typed(), None, day(1)).await.unwrap();

        let err = f.service.retry_now(seq.id_typed(), day(2)).await.unwrap_err();
        assert_eq!(
            err,
            DunningError::invalid_transition("cancelled", "retry_payment")
        );
        assert_eq!(f.gateway.calls(), 0);
        let stored = f.repo.get(seq.id_typed()).await.unwrap();
        assert_eq!(stored.attempts_made(), 0);
    }

    #[tokio::test]
    async fn retry_now_on_paused_sequence_never_touches_the_gateway() {
        let f = fixture(vec![ChargeOutcome::Approved]);
        let seq = f.service.open(request(), t0()).await.unwrap();
        f.service.pause(seq.id_typed(), None, t0()).await.unwrap();

        let err = f.service.retry_now(seq.id_typed(), day(2)).await.unwrap_err();
        assert_eq!(
            err,
            DunningError::invalid_transition("paused", "retry_payment")
        );
        assert_eq!(f.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn retry_now_success_recovers_and_confirms() {
        let f = fixture(vec![ChargeOutcome::Approved]);
        let seq = f.service.open(request(), t0()).await.unwrap();

        let updated = f.service.retry_now(seq.id_typed(), day(1)).await.unwrap();
        assert_eq!(updated.status(), DunningStatus::Recovered);
        assert_eq!(f.notifier.confirmations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_now_transient_failure_keeps_the_sequence_intact() {
        let f = fixture(vec![ChargeOutcome::TransientError {
            message: "timeout".to_string(),
        }]);
        let seq = f.service.open(request(), t0()).await.unwrap();

        let err = f.service.retry_now(seq.id_typed(), day(1)).await.unwrap_err();
        assert!(err.is_transient());
        let stored = f.repo.get(seq.id_typed()).await.unwrap();
        assert_eq!(stored.attempts_made(), 0);
        assert_eq!(stored.status(), DunningStatus::Active);
    }

    #[tokio::test]
    async fn escalate_uses_the_pool_when_no_csm_preferred() {
        let f = fixture(vec![]);
        let seq = f.service.open(request(), t0()).await.unwrap();

        let updated = f
            .service
            .escalate(seq.id_typed(), None, Some("vip".to_string()), day(1))
            .await
            .unwrap();
        assert_eq!(updated.status(), DunningStatus::Escalated);
        assert_eq!(updated.assigned_csm_id(), Some(f.csm_pool.csm));
        assert_eq!(updated.notes().len(), 1);
    }

    #[tokio::test]
    async fn assign_csm_prefers_the_requested_one() {
        let f = fixture(vec![]);
        let seq = f.service.open(request(), t0()).await.unwrap();
        let wanted = CsmId::new();

        let updated = f
            .service
            .assign_csm(seq.id_typed(), Some(wanted))
            .await
            .unwrap();
        assert_eq!(updated.assigned_csm_id(), Some(wanted));
        assert_eq!(updated.status(), DunningStatus::Active);
    }

    #[tokio::test]
    async fn pause_resume_round_trip_persists() {
        let f = fixture(vec![]);
        let seq = f.service.open(request(), t0()).await.unwrap();

        f.service
            .pause(seq.id_typed(), Some("promised payment".to_string()), t0())
            .await
            .unwrap();
        let paused = f.repo.get(seq.id_typed()).await.unwrap();
        assert_eq!(paused.status(), DunningStatus::Paused);

        let resumed = f.service.resume(seq.id_typed(), day(5)).await.unwrap();
        assert_eq!(resumed.status(), DunningStatus::Active);
        assert_eq!(resumed.next_retry_at(), Some(day(6)));
    }

    #[tokio::test]
    async fn cancel_on_terminal_sequence_surfaces_invalid_transition() {
        let f = fixture(vec![]);
        let seq = f.service.open(request(), t0()).await.unwrap();
        f.service
            .mark_recovered(seq.id_typed(), "manual".to_string(), None, day(1))
            .await
            .unwrap();

        let err = f
            .service
            .cancel(seq.id_typed(), None, day(2))
            .await
            .unwrap_err();
        assert_eq!(err, DunningError::invalid_transition("recovered", "cancel"));
    }

    #[tokio::test]
    async fn send_payment_link_notes_the_sequence() {
        let f = fixture(vec![]);
        let seq = f.service.open(request(), t0()).await.unwrap();

        let updated = f
            .service
            .send_payment_link(seq.id_typed(), day(1))
            .await
            .unwrap();
        assert_eq!(f.notifier.payment_links.load(Ordering::SeqCst), 1);
        assert_eq!(updated.notes()[0].text, "payment link sent");
    }

    #[tokio::test]
    async fn reporting_runs_over_the_whole_book() {
        let f = fixture(vec![]);
        f.service.open(request(), t0()).await.unwrap();
        let other = f.service.open(request(), t0()).await.unwrap();
        f.service
            .mark_recovered(other.id_typed(), "manual".to_string(), None, day(1))
            .await
            .unwrap();

        let at_risk = f.service.revenue_at_risk(day(2)).await.unwrap();
        assert_eq!(at_risk.currencies.len(), 1);
        assert_eq!(at_risk.currencies[0].total, 500_00);

        let stats = f.service.statistics(t0(), day(3)).await.unwrap();
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.recovered, 1);
    }
}
