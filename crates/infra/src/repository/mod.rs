//! Persistence port for dunning sequences.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use dunning_core::{DunningResult, OrganizationId, SequenceId};
use dunning_sequence::{DunningSequence, DunningStatus};

/// Storage port for dunning sequences with optimistic concurrency.
///
/// `save` takes the version the caller read; `expected_version == 0` means
/// "create" and fails if the sequence already exists. A stale version yields
/// `ConcurrentModification` and the caller re-reads before retrying.
#[async_trait]
pub trait DunningRepository: Send + Sync {
    async fn get(&self, id: SequenceId) -> DunningResult<DunningSequence>;

    async fn save(&self, sequence: &DunningSequence, expected_version: u64) -> DunningResult<()>;

    async fn list_by_status(
        &self,
        status: DunningStatus,
        limit: usize,
    ) -> DunningResult<Vec<DunningSequence>>;

    async fn list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> DunningResult<Vec<DunningSequence>>;

    /// Sequences the orchestrator should charge: Active or Escalated with a
    /// retry instant at or before `now`, ordered by that instant.
    async fn list_due_for_retry(&self, now: DateTime<Utc>)
    -> DunningResult<Vec<DunningSequence>>;

    /// Active and Escalated sequences (the in-flight book of work).
    async fn list_active(&self, limit: usize) -> DunningResult<Vec<DunningSequence>>;

    /// Everything, for on-demand reporting.
    async fn list_all(&self) -> DunningResult<Vec<DunningSequence>>;
}

#[async_trait]
impl<R> DunningRepository for Arc<R>
where
    R: DunningRepository + ?Sized,
{
    async fn get(&self, id: SequenceId) -> DunningResult<DunningSequence> {
        (**self).get(id).await
    }

    async fn save(&self, sequence: &DunningSequence, expected_version: u64) -> DunningResult<()> {
        (**self).save(sequence, expected_version).await
    }

    async fn list_by_status(
        &self,
        status: DunningStatus,
        limit: usize,
    ) -> DunningResult<Vec<DunningSequence>> {
        (**self).list_by_status(status, limit).await
    }

    async fn list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> DunningResult<Vec<DunningSequence>> {
        (**self).list_by_organization(organization_id).await
    }

    async fn list_due_for_retry(
        &self,
        now: DateTime<Utc>,
    ) -> DunningResult<Vec<DunningSequence>> {
        (**self).list_due_for_retry(now).await
    }

    async fn list_active(&self, limit: usize) -> DunningResult<Vec<DunningSequence>> {
        (**self).list_active(limit).await
    }

    async fn list_all(&self) -> DunningResult<Vec<DunningSequence>> {
        (**self).list_all().await
    }
}
