//! Dev defaults for the outbound ports.
//!
//! Real deployments wire gateway/notification/CSM integrations here. The
//! defaults below keep a local instance honest: the gateway refuses to
//! pretend a charge happened, so no dunning attempt is ever consumed.

use async_trait::async_trait;
use tracing::{info, warn};

use dunning_core::{CsmId, DunningResult, InvoiceId, Money, SequenceId};
use dunning_infra::{ChargeOutcome, CsmAssignmentPort, NotificationPort, PaymentGatewayPort};

/// Reports every charge as a transient failure until a real gateway is
/// configured.
#[derive(Debug, Default)]
pub struct UnconfiguredGateway;

#[async_trait]
impl PaymentGatewayPort for UnconfiguredGateway {
    async fn charge(
        &self,
        invoice_id: InvoiceId,
        amount: &Money,
        idempotency_key: &str,
    ) -> DunningResult<ChargeOutcome> {
        warn!(%invoice_id, %amount, idempotency_key, "no payment gateway configured");
        Ok(ChargeOutcome::TransientError {
            message: "payment gateway not configured".to_string(),
        })
    }
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationPort for LogNotifier {
    async fn send_payment_link(&self, sequence_id: SequenceId) -> DunningResult<()> {
        info!(%sequence_id, "payment link (log only)");
        Ok(())
    }

    async fn send_recovery_confirmation(&self, sequence_id: SequenceId) -> DunningResult<()> {
        info!(%sequence_id, "recovery confirmation (log only)");
        Ok(())
    }
}

/// Honors an explicit CSM and otherwise mints a placeholder id.
#[derive(Debug, Default)]
pub struct PlaceholderCsmPool;

#[async_trait]
impl CsmAssignmentPort for PlaceholderCsmPool {
    async fn assign(&self, preferred: Option<CsmId>) -> DunningResult<CsmId> {
        Ok(preferred.unwrap_or_default())
    }
}
