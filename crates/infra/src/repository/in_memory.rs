//! In-memory repository for tests and development.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dunning_core::{DunningError, DunningResult, Entity, OrganizationId, SequenceId};
use dunning_sequence::{DunningSequence, DunningStatus};

use super::DunningRepository;

/// `RwLock<HashMap>` store with the same optimistic-concurrency contract as
/// the Postgres adapter.
#[derive(Debug, Default)]
pub struct InMemoryDunningRepository {
    inner: RwLock<HashMap<SequenceId, DunningSequence>>,
}

impl InMemoryDunningRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_all(&self) -> DunningResult<Vec<DunningSequence>> {
        let map = self
            .inner
            .read()
            .map_err(|_| DunningError::storage("sequence store lock poisoned"))?;
        Ok(map.values().cloned().collect())
    }
}

#[async_trait]
impl DunningRepository for InMemoryDunningRepository {
    async fn get(&self, id: SequenceId) -> DunningResult<DunningSequence> {
        let map = self
            .inner
            .read()
            .map_err(|_| DunningError::storage("sequence store lock poisoned"))?;
        map.get(&id).cloned().ok_or(DunningError::not_found(id))
    }

    async fn save(&self, sequence: &DunningSequence, expected_version: u64) -> DunningResult<()> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| DunningError::storage("sequence store lock poisoned"))?;

        match map.get(Entity::id(sequence)) {
            None if expected_version == 0 => {
                map.insert(sequence.id_typed(), sequence.clone());
                Ok(())
            }
            None => Err(DunningError::conflict(expected_version, 0)),
            Some(stored) if stored.version() == expected_version => {
                map.insert(sequence.id_typed(), sequence.clone());
                Ok(())
            }
            Some(stored) => Err(DunningError::conflict(expected_version, stored.version())),
        }
    }

    async fn list_by_status(
        &self,
        status: DunningStatus,
        limit: usize,
    ) -> DunningResult<Vec<DunningSequence>> {
        let mut out: Vec<_> = self
            .read_all()?
            .into_iter()
            .filter(|s| s.status() == status)
            .collect();
        out.sort_by_key(|s| s.created_at());
        out.truncate(limit);
        Ok(out)
    }

    async fn list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> DunningResult<Vec<DunningSequence>> {
        let mut out: Vec<_> = self
            .read_all()?
            .into_iter()
            .filter(|s| s.organization_id() == organization_id)
            .collect();
        out.sort_by_key(|s| s.created_at());
        Ok(out)
    }

    async fn list_due_for_retry(
        &self,
        now: DateTime<Utc>,
    ) -> DunningResult<Vec<DunningSequence>> {
        let mut out: Vec<_> = self
            .read_all()?
            .into_iter()
            .filter(|s| {
                s.status().is_retryable() && s.next_retry_at().is_some_and(|next| next <= now)
            })
            .collect();
        out.sort_by_key(|s| s.next_retry_at());
        Ok(out)
    }

    async fn list_active(&self, limit: usize) -> DunningResult<Vec<DunningSequence>> {
        let mut out: Vec<_> = self
            .read_all()?
            .into_iter()
            .filter(|s| s.status().is_retryable())
            .collect();
        out.sort_by_key(|s| s.created_at());
        out.truncate(limit);
        Ok(out)
    }

    async fn list_all(&self) -> DunningResult<Vec<DunningSequence>> {
        self.read_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use dunning_core::{Currency, InvoiceId, Money, SubscriptionId};
    use dunning_sequence::{AttemptOutcome, RetryPolicy};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
    }

    fn open(org: OrganizationId) -> DunningSequence {
        DunningSequence::open(
            SequenceId::new(),
            org,
            InvoiceId::new(),
            SubscriptionId::new(),
            Money::new(100_00, Currency::new("SAR").unwrap()),
            None,
            &RetryPolicy::default(),
            t0(),
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let repo = InMemoryDunningRepository::new();
        let seq = open(OrganizationId::new());
        repo.save(&seq, 0).await.unwrap();
        let loaded = repo.get(seq.id_typed()).await.unwrap();
        assert_eq!(loaded, seq);
    }

    #[tokio::test]
    async fn get_unknown_id_is_not_found() {
        let repo = InMemoryDunningRepository::new();
        let id = SequenceId::new();
        assert_eq!(
            repo.get(id).await.unwrap_err(),
            DunningError::not_found(id)
        );
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let repo = InMemoryDunningRepository::new();
        let seq = open(OrganizationId::new());
        repo.save(&seq, 0).await.unwrap();
        let err = repo.save(&seq, 0).await.unwrap_err();
        // The conflict reports the version that actually won the create.
        assert_eq!(err, DunningError::conflict(0, seq.version()));
    }

    #[tokio::test]
    async fn stale_version_loses_the_race() {
        let repo = InMemoryDunningRepository::new();
        let seq = open(OrganizationId::new());
        repo.save(&seq, 0).await.unwrap();

        // Two readers load version 1; both mutate; only the first save wins.
        let mut a = repo.get(seq.id_typed()).await.unwrap();
        let mut b = repo.get(seq.id_typed()).await.unwrap();
        a.add_note("ops", "from a", t0()).unwrap();
        b.add_note("ops", "from b", t0()).unwrap();

        repo.save(&a, 1).await.unwrap();
        let err = repo.save(&b, 1).await.unwrap_err();
        assert_eq!(err, DunningError::conflict(1, 2));

        let stored = repo.get(seq.id_typed()).await.unwrap();
        assert_eq!(stored.notes()[0].text, "from a");
    }

    #[tokio::test]
    async fn due_listing_filters_status_and_instant() {
        let repo = InMemoryDunningRepository::new();

        let due = open(OrganizationId::new());
        repo.save(&due, 0).await.unwrap();

        let mut paused = open(OrganizationId::new());
        paused.pause(None, t0()).unwrap();
        repo.save(&paused, 0).await.unwrap();

        let mut done = open(OrganizationId::new());
        done.retry_payment(
            AttemptOutcome::Success,
            None,
            t0() + Duration::days(1),
            &RetryPolicy::default(),
        )
        .unwrap();
        repo.save(&done, 0).await.unwrap();

        // First retry is due one day in; nothing due at t0.
        assert!(repo.list_due_for_retry(t0()).await.unwrap().is_empty());

        let due_list = repo
            .list_due_for_retry(t0() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(due_list.len(), 1);
        assert_eq!(due_list[0].id_typed(), due.id_typed());
    }

    #[tokio::test]
    async fn organization_listing_is_scoped() {
        let repo = InMemoryDunningRepository::new();
        let org = OrganizationId::new();
        repo.save(&open(org), 0).await.unwrap();
        repo.save(&open(org), 0).await.unwrap();
        repo.save(&open(OrganizationId::new()), 0).await.unwrap();

        assert_eq!(repo.list_by_organization(org).await.unwrap().len(), 2);
        assert_eq!(repo.list_all().await.unwrap().len(), 3);
    }
}
