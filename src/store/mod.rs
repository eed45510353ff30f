//! Typed façade over the substrate's named operations.
//!
//! Every control-plane mutation goes through a method here, and each method
//! commits its status transition together with its domain side effects in a
//! single transaction. The substrate schema lives in `migrations/` and is
//! applied in lexicographic filename order.

mod error;
mod state;
mod types;
mod worldview;

pub use error::{StoreError, StoreResult};
pub use types::{
    AppliedEffects, DecisionBatch, ExternalCall, HeartbeatState, OutboxPayload, StartedHeartbeat,
};
pub use worldview::{TransformationFailure, TransformationOutcome};

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Embedded schema files, ordered as they would sort on disk.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_substrate.sql",
    include_str!("../../migrations/001_substrate.sql"),
)];

/// Handle to the substrate. Cheap to clone; wraps a [`PgPool`].
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the substrate, retrying for up to `wait` while it comes up.
    ///
    /// # Errors
    ///
    /// Returns the final connection error once the wait budget is exhausted.
    pub async fn connect(dsn: &str, wait: Duration) -> StoreResult<Self> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match PgPoolOptions::new()
                .min_connections(1)
                .max_connections(10)
                .connect(dsn)
                .await
            {
                Ok(pool) => {
                    info!("connected to substrate");
                    return Ok(Self { pool });
                }
                Err(e) if tokio::time::Instant::now() < deadline => {
                    tracing::debug!(error = %e, "substrate not ready, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(StoreError::Database(e)),
            }
        }
    }

    /// The underlying pool, for collaborators that need raw access.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema files to this substrate.
    ///
    /// Idempotent: every statement guards against existing objects.
    ///
    /// # Errors
    ///
    /// Returns an error if any schema file fails to apply.
    pub async fn apply_embedded_schema(&self) -> StoreResult<()> {
        for (name, sql) in MIGRATIONS {
            info!(file = name, "applying schema");
            sqlx::raw_sql(sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}
