//! Typed errors surfaced by the state store adapter.

/// Domain errors from named store operations.
///
/// The adapter surfaces kinds, not strings, and never retries on its own.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The agent has not completed initial configuration.
    #[error("agent is not configured")]
    AgentNotConfigured,

    /// The agent has been terminated; no further work may be started.
    #[error("agent is terminated")]
    AgentTerminated,

    /// Referenced heartbeat row does not exist.
    #[error("heartbeat {0} not found")]
    HeartbeatNotFound(uuid::Uuid),

    /// An external call could not be claimed (not `pending` or missing).
    #[error("external call {0} is not claimable")]
    CallNotClaimable(uuid::Uuid),

    /// The `embed` call type is reserved and unsupported at the broker layer.
    #[error("external call type 'embed' is unsupported")]
    EmbedUnsupported,

    /// A stored JSON document did not match its expected shape.
    #[error("malformed stored document: {0}")]
    Malformed(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;
