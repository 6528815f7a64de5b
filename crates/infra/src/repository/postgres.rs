//! Postgres-backed dunning sequence repository.
//!
//! Each sequence is stored as one row: the full entity as a JSONB `payload`
//! plus the columns the list queries filter and order on. `save` enforces
//! optimistic concurrency with `WHERE version = $expected`; a concurrent
//! writer makes the UPDATE match zero rows and the caller gets
//! `ConcurrentModification`.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `DunningError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | DunningError | Scenario |
//! |------------|----------------------|--------------|----------|
//! | Database (unique violation) | `23505` | `ConcurrentModification` (actual version re-read) | Two creates raced on the same id |
//! | Database (other) | Any other | `Storage` | Constraint or query failure |
//! | RowNotFound | N/A | `NotFound` | `get` on an unknown id |
//! | PoolClosed / Io / other | N/A | `Storage` | Connection loss, pool shutdown |
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE dunning_sequences (
//!     id              UUID PRIMARY KEY,
//!     organization_id UUID        NOT NULL,
//!     status          TEXT        NOT NULL,
//!     next_retry_at   TIMESTAMPTZ,
//!     created_at      TIMESTAMPTZ NOT NULL,
//!     version         BIGINT      NOT NULL,
//!     payload         JSONB       NOT NULL
//! );
//! CREATE INDEX idx_dunning_due ON dunning_sequences (next_retry_at)
//!     WHERE status IN ('active', 'escalated');
//! CREATE INDEX idx_dunning_org ON dunning_sequences (organization_id);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::instrument;

use dunning_core::{DunningError, DunningResult, Entity, OrganizationId, SequenceId};
use dunning_sequence::{DunningSequence, DunningStatus};

use super::DunningRepository;

#[derive(Debug, Clone)]
pub struct PostgresDunningRepository {
    pool: Arc<PgPool>,
}

impl PostgresDunningRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn decode(row: &sqlx::postgres::PgRow) -> DunningResult<DunningSequence> {
        let payload: serde_json::Value = row
            .try_get("payload")
            .map_err(|e| DunningError::storage(format!("missing payload column: {e}")))?;
        serde_json::from_value(payload)
            .map_err(|e| DunningError::storage(format!("corrupt sequence payload: {e}")))
    }

    async fn fetch_payloads(&self, query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>) -> DunningResult<Vec<DunningSequence>> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(Self::decode).collect()
    }

    async fn stored_version(&self, id: SequenceId) -> DunningResult<Option<u64>> {
        let row = sqlx::query("SELECT version FROM dunning_sequences WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stored_version", e))?;
        Ok(row.and_then(|r| r.try_get::<i64, _>("version").ok().map(|v| v as u64)))
    }
}

#[async_trait]
impl DunningRepository for PostgresDunningRepository {
    #[instrument(skip(self), fields(sequence_id = %id), err)]
    async fn get(&self, id: SequenceId) -> DunningResult<DunningSequence> {
        let row = sqlx::query("SELECT payload FROM dunning_sequences WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .ok_or(DunningError::not_found(id))?;
        Self::decode(&row)
    }

    #[instrument(
        skip(self, sequence),
        fields(sequence_id = %sequence.id_typed(), expected_version, new_version = sequence.version()),
        err
    )]
    async fn save(&self, sequence: &DunningSequence, expected_version: u64) -> DunningResult<()> {
        let payload = serde_json::to_value(sequence)
            .map_err(|e| DunningError::storage(format!("failed to encode sequence: {e}")))?;

        if expected_version == 0 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO dunning_sequences
                    (id, organization_id, status, next_retry_at, created_at, version, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(sequence.id_typed().as_uuid())
            .bind(sequence.organization_id().as_uuid())
            .bind(sequence.status().as_str())
            .bind(sequence.next_retry_at())
            .bind(sequence.created_at())
            .bind(sequence.version() as i64)
            .bind(payload)
            .execute(&*self.pool)
            .await;

            let result = match inserted {
                Ok(result) => result,
                // A racing create slipped between the conflict check and the
                // insert; report the version that actually won.
                Err(e) if is_unique_violation(&e) => {
                    let actual = self.stored_version(sequence.id_typed()).await?.unwrap_or(0);
                    return Err(DunningError::conflict(0, actual));
                }
                Err(e) => return Err(map_sqlx_error("save", e)),
            };

            if result.rows_affected() == 0 {
                let actual = self.stored_version(sequence.id_typed()).await?.unwrap_or(0);
                return Err(DunningError::conflict(0, actual));
            }
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE dunning_sequences
            SET status = $2, next_retry_at = $3, version = $4, payload = $5
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(sequence.id_typed().as_uuid())
        .bind(sequence.status().as_str())
        .bind(sequence.next_retry_at())
        .bind(sequence.version() as i64)
        .bind(payload)
        .bind(expected_version as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        if result.rows_affected() == 0 {
            return match self.stored_version(sequence.id_typed()).await? {
                Some(actual) => Err(DunningError::conflict(expected_version, actual)),
                None => Err(DunningError::not_found(sequence.id_typed())),
            };
        }
        Ok(())
    }

    #[instrument(skip(self), fields(status = %status, limit), err)]
    async fn list_by_status(
        &self,
        status: DunningStatus,
        limit: usize,
    ) -> DunningResult<Vec<DunningSequence>> {
        self.fetch_payloads(
            sqlx::query(
                r#"
                SELECT payload FROM dunning_sequences
                WHERE status = $1
                ORDER BY created_at ASC
                LIMIT $2
                "#,
            )
            .bind(status.as_str())
            .bind(limit as i64),
        )
        .await
    }

    #[instrument(skip(self), fields(organization_id = %organization_id), err)]
    async fn list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> DunningResult<Vec<DunningSequence>> {
        self.fetch_payloads(
            sqlx::query(
                r#"
                SELECT payload FROM dunning_sequences
                WHERE organization_id = $1
                ORDER BY created_at ASC
                "#,
            )
            .bind(organization_id.as_uuid()),
        )
        .await
    }

    #[instrument(skip(self), fields(now = %now), err)]
    async fn list_due_for_retry(
        &self,
        now: DateTime<Utc>,
    ) -> DunningResult<Vec<DunningSequence>> {
        self.fetch_payloads(
            sqlx::query(
                r#"
                SELECT payload FROM dunning_sequences
                WHERE status IN ('active', 'escalated') AND next_retry_at <= $1
                ORDER BY next_retry_at ASC
                "#,
            )
            .bind(now),
        )
        .await
    }

    #[instrument(skip(self), fields(limit), err)]
    async fn list_active(&self, limit: usize) -> DunningResult<Vec<DunningSequence>> {
        self.fetch_payloads(
            sqlx::query(
                r#"
                SELECT payload FROM dunning_sequences
                WHERE status IN ('active', 'escalated')
                ORDER BY created_at ASC
                LIMIT $1
                "#,
            )
            .bind(limit as i64),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_all(&self) -> DunningResult<Vec<DunningSequence>> {
        self.fetch_payloads(sqlx::query(
            "SELECT payload FROM dunning_sequences ORDER BY created_at ASC",
        ))
        .await
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DunningError {
    DunningError::storage(format!("{operation}: {err}"))
}
