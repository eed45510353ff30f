//! Durable external-call broker: claim, apply, fail.
//!
//! Every side effect the agent performs outside the substrate flows through
//! the `external_calls` queue, so a heartbeat can pause at any action and
//! resume after a worker restart. N workers share the queue safely via
//! `FOR UPDATE SKIP LOCKED`; no in-process coordination is required.

use sqlx::Row;
use uuid::Uuid;

use crate::store::{AppliedEffects, ExternalCall, Store, StoreError, StoreResult};

/// Broker over the external-call queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CallBroker {
    store: Store,
}

impl CallBroker {
    /// Create a broker over a store handle.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Claim the oldest `pending` call, if any.
    ///
    /// Atomically flips it to `processing` and stamps `started_at`. Rows
    /// locked by other workers are skipped, so concurrent claims never
    /// collide. Returns `None` when the queue is empty — that is not an
    /// error.
    pub async fn claim_pending_call(&self) -> StoreResult<Option<ExternalCall>> {
        let row = sqlx::query(
            "UPDATE external_calls
             SET status = 'processing', started_at = now()
             WHERE id = (
                 SELECT id FROM external_calls
                 WHERE status = 'pending'
                 ORDER BY requested_at, id
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING id, call_type, input, heartbeat_id, retry_count",
        )
        .fetch_optional(self.store.pool())
        .await?;

        row.map(row_to_call).transpose()
    }

    /// Claim a specific call by id.
    ///
    /// Produces no row when the call is not `pending` (another worker owns
    /// it, or it already finished).
    pub async fn claim_call_by_id(&self, call_id: Uuid) -> StoreResult<Option<ExternalCall>> {
        let row = sqlx::query(
            "UPDATE external_calls
             SET status = 'processing', started_at = now()
             WHERE id = $1 AND status = 'pending'
             RETURNING id, call_type, input, heartbeat_id, retry_count",
        )
        .bind(call_id)
        .fetch_optional(self.store.pool())
        .await?;

        row.map(row_to_call).transpose()
    }

    /// Apply a processing call's result: status transition and domain side
    /// effects commit in one transaction (delegated to the store).
    pub async fn apply_result(
        &self,
        call_id: Uuid,
        output: &serde_json::Value,
    ) -> StoreResult<AppliedEffects> {
        self.store.apply_external_call_result(call_id, output).await
    }

    /// Record a processing failure.
    ///
    /// With `retry` and remaining budget the call returns to `pending` with
    /// an incremented `retry_count` and cleared `started_at`; otherwise it is
    /// marked `failed` with the error message.
    pub async fn fail_call(
        &self,
        call_id: Uuid,
        error: &str,
        max_retries: i32,
        retry: bool,
    ) -> StoreResult<()> {
        if retry {
            sqlx::query(
                "UPDATE external_calls
                 SET status = CASE WHEN retry_count < $1 THEN 'pending'::external_call_status
                                   ELSE 'failed'::external_call_status END,
                     error_message = $2,
                     retry_count = retry_count + 1,
                     started_at = NULL
                 WHERE id = $3",
            )
            .bind(max_retries)
            .bind(error)
            .bind(call_id)
            .execute(self.store.pool())
            .await?;
        } else {
            sqlx::query(
                "UPDATE external_calls
                 SET status = 'failed', error_message = $1, completed_at = now()
                 WHERE id = $2",
            )
            .bind(error)
            .bind(call_id)
            .execute(self.store.pool())
            .await?;
        }
        Ok(())
    }

    /// Current status and output of a call, for observability.
    pub async fn get_call_status(
        &self,
        call_id: Uuid,
    ) -> StoreResult<Option<(String, Option<serde_json::Value>, Option<String>)>> {
        let row = sqlx::query(
            "SELECT status::text AS status, output, error_message
             FROM external_calls WHERE id = $1",
        )
        .bind(call_id)
        .fetch_optional(self.store.pool())
        .await?;
        match row {
            Some(row) => Ok(Some((
                row.try_get("status")?,
                row.try_get("output")?,
                row.try_get("error_message")?,
            ))),
            None => Ok(None),
        }
    }

    /// Number of calls currently waiting, for status displays.
    pub async fn pending_count(&self) -> StoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM external_calls WHERE status = 'pending'")
                .fetch_one(self.store.pool())
                .await?;
        Ok(count)
    }
}

/// Convert a claimed row into the worker-facing shape.
fn row_to_call(row: sqlx::postgres::PgRow) -> StoreResult<ExternalCall> {
    let call_type: String = row.try_get("call_type")?;
    if call_type == "embed" {
        // Reserved at this layer; the embedding service is a substrate-side
        // collaborator.
        return Err(StoreError::EmbedUnsupported);
    }
    Ok(ExternalCall {
        id: row.try_get("id")?,
        call_type,
        input: row.try_get("input")?,
        heartbeat_id: row.try_get("heartbeat_id")?,
        retry_count: row.try_get("retry_count")?,
    })
}
