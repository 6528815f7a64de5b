//! Outbound ports: payment gateway, notifications, CSM assignment.
//!
//! These are the collaborators the recovery engine talks to but does not
//! own. Adapters live with the deployment; tests use the mock
//! implementations in this module's test helpers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use dunning_core::{CsmId, DunningError, DunningResult, InvoiceId, Money, SequenceId};

/// Gateway verdict for one charge attempt.
///
/// `Declined` is a definitive business answer and consumes a dunning
/// attempt; `TransientError` is infrastructure noise and never does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeOutcome {
    Approved,
    Declined { reason: String },
    TransientError { message: String },
}

/// Payment gateway port.
///
/// `idempotency_key` is stable per (sequence, attempt number), so a crashed
/// tick that re-charges cannot double-bill.
#[async_trait]
pub trait PaymentGatewayPort: Send + Sync {
    async fn charge(
        &self,
        invoice_id: InvoiceId,
        amount: &Money,
        idempotency_key: &str,
    ) -> DunningResult<ChargeOutcome>;
}

/// Customer notification port. Failures here are logged and never block
/// recovery work.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn send_payment_link(&self, sequence_id: SequenceId) -> DunningResult<()>;
    async fn send_recovery_confirmation(&self, sequence_id: SequenceId) -> DunningResult<()>;
}

/// Picks a customer success manager for an escalated sequence.
#[async_trait]
pub trait CsmAssignmentPort: Send + Sync {
    async fn assign(&self, preferred: Option<CsmId>) -> DunningResult<CsmId>;
}

#[async_trait]
impl<G> PaymentGatewayPort for Arc<G>
where
    G: PaymentGatewayPort + ?Sized,
{
    async fn charge(
        &self,
        invoice_id: InvoiceId,
        amount: &Money,
        idempotency_key: &str,
    ) -> DunningResult<ChargeOutcome> {
        (**self).charge(invoice_id, amount, idempotency_key).await
    }
}

#[async_trait]
impl<N> NotificationPort for Arc<N>
where
    N: NotificationPort + ?Sized,
{
    async fn send_payment_link(&self, sequence_id: SequenceId) -> DunningResult<()> {
        (**self).send_payment_link(sequence_id).await
    }

    async fn send_recovery_confirmation(&self, sequence_id: SequenceId) -> DunningResult<()> {
        (**self).send_recovery_confirmation(sequence_id).await
    }
}

#[async_trait]
impl<C> CsmAssignmentPort for Arc<C>
where
    C: CsmAssignmentPort + ?Sized,
{
    async fn assign(&self, preferred: Option<CsmId>) -> DunningResult<CsmId> {
        (**self).assign(preferred).await
    }
}

/// Backoff configuration for in-call gateway retries.
///
/// This is transport-level retrying inside a single dunning attempt; the
/// day-scale schedule between attempts lives in the domain policy.
#[derive(Debug, Clone)]
pub struct GatewayRetryConfig {
    /// Additional tries after the first call (0 = no retries).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for GatewayRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl GatewayRetryConfig {
    /// Delay before retry `attempt` (1-indexed): base * 2^(attempt-1), capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi((attempt - 1) as i32);
        Duration::from_millis((base_ms * exp).min(max_ms) as u64)
    }
}

/// Decorator that absorbs `TransientError` verdicts with exponential backoff.
///
/// Every try reuses the caller's idempotency key, so retried charges are
/// safe. Once retries run out, the transient failure surfaces as
/// `DunningError::Gateway { transient: true }`, which the orchestrator
/// treats as "skip this tick, no attempt consumed".
#[derive(Debug, Clone)]
pub struct RetryingGateway<G> {
    inner: G,
    config: GatewayRetryConfig,
}

impl<G> RetryingGateway<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            config: GatewayRetryConfig::default(),
        }
    }

    pub fn with_config(inner: G, config: GatewayRetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<G> PaymentGatewayPort for RetryingGateway<G>
where
    G: PaymentGatewayPort,
{
    async fn charge(
        &self,
        invoice_id: InvoiceId,
        amount: &Money,
        idempotency_key: &str,
    ) -> DunningResult<ChargeOutcome> {
        let mut attempt = 0u32;
        loop {
            match self.inner.charge(invoice_id, amount, idempotency_key).await? {
                ChargeOutcome::TransientError { message } => {
                    if attempt >= self.config.max_retries {
                        return Err(DunningError::gateway(true, message));
                    }
                    attempt += 1;
                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        %invoice_id,
                        idempotency_key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient gateway failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => return Ok(outcome),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedGateway;
    use super::*;
    use dunning_core::Currency;

    fn sar(amount: u64) -> Money {
        Money::new(amount, Currency::new("SAR").unwrap())
    }

    fn transient(msg: &str) -> ChargeOutcome {
        ChargeOutcome::TransientError {
            message: msg.to_string(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = GatewayRetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_same_key() {
        let inner = Arc::new(ScriptedGateway::new(vec![
            transient("timeout"),
            transient("timeout"),
            ChargeOutcome::Approved,
        ]));
        let gateway = RetryingGateway::new(inner.clone());

        let outcome = gateway
            .charge(InvoiceId::new(), &sar(100_00), "seq:1")
            .await
            .unwrap();

        assert_eq!(outcome, ChargeOutcome::Approved);
        assert_eq!(inner.calls(), 3);
        assert!(inner.keys.lock().unwrap().iter().all(|k| k == "seq:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_as_transient_gateway_error() {
        let inner = Arc::new(ScriptedGateway::new(vec![
            transient("down"),
            transient("down"),
            transient("down"),
        ]));
        let gateway = RetryingGateway::with_config(
            inner.clone(),
            GatewayRetryConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            },
        );

        let err = gateway
            .charge(InvoiceId::new(), &sar(100_00), "seq:1")
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn declines_pass_through_without_retry() {
        let inner = Arc::new(ScriptedGateway::new(vec![ChargeOutcome::Declined {
            reason: "insufficient_funds".to_string(),
        }]));
        let gateway = RetryingGateway::new(inner.clone());

        let outcome = gateway
            .charge(InvoiceId::new(), &sar(100_00), "seq:1")
            .await
            .unwrap();

        assert!(matches!(outcome, ChargeOutcome::Declined { .. }));
        assert_eq!(inner.calls(), 1);
    }
}
