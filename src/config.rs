//! Process-level configuration resolved from the environment.
//!
//! The substrate's `config` table owns everything the agent can change about
//! itself; the environment owns only how this process reaches the substrate
//! and the message broker. `.env` files are honoured via [`dotenvy`].

use std::time::Duration;

/// Default Postgres port for Hexis substrates.
pub const DEFAULT_POSTGRES_PORT: u16 = 43815;

/// Connection settings for the Postgres substrate.
#[derive(Debug, Clone)]
pub struct PostgresSettings {
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Database user.
    pub user: String,
    /// Database password.
    pub password: String,
    /// Seconds to wait for the database to accept connections at startup.
    pub wait_seconds: u64,
}

impl PostgresSettings {
    /// Read settings from `POSTGRES_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_owned()),
            port: std::env::var("POSTGRES_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_POSTGRES_PORT),
            database: std::env::var("POSTGRES_DB").unwrap_or_else(|_| "hexis_memory".to_owned()),
            user: std::env::var("POSTGRES_USER").unwrap_or_else(|_| "hexis_user".to_owned()),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or_default(),
            wait_seconds: std::env::var("POSTGRES_WAIT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    /// Build a Postgres DSN from these settings.
    pub fn dsn(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Resolve the DSN for the active substrate.
///
/// Order: explicit `HEXIS_INSTANCE` registry entry, then the registry's
/// current selection, then raw `POSTGRES_*` environment variables.
pub fn db_dsn_from_env() -> String {
    if let Ok(name) = std::env::var("HEXIS_INSTANCE") {
        if let Ok(registry) = crate::instance::InstanceRegistry::open_default() {
            if let Ok(dsn) = registry.dsn_for(&name) {
                return dsn;
            }
        }
    }

    if let Ok(registry) = crate::instance::InstanceRegistry::open_default() {
        if let Some(current) = registry.get_current() {
            if let Ok(dsn) = registry.dsn_for(&current) {
                return dsn;
            }
        }
    }

    PostgresSettings::from_env().dsn()
}

/// Worker loop settings from `WORKER_*` / `HEXIS_WORKER_MODE` variables.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Poll interval between loop iterations.
    pub poll_interval: Duration,
    /// Maximum retries before an external call is marked failed.
    pub max_retries: i32,
    /// Which worker loops to run.
    pub mode: WorkerMode,
}

/// Which worker loops a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Heartbeat dispatch loop only.
    Heartbeat,
    /// Maintenance/subconscious loop only.
    Maintenance,
    /// Both loops concurrently.
    Both,
}

impl std::str::FromStr for WorkerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "heartbeat" => Ok(Self::Heartbeat),
            "maintenance" => Ok(Self::Maintenance),
            "both" => Ok(Self::Both),
            other => Err(anyhow::anyhow!(
                "mode must be one of heartbeat, maintenance, both (got {other:?})"
            )),
        }
    }
}

impl WorkerSettings {
    /// Read settings from the environment.
    pub fn from_env() -> Self {
        let poll_secs: f64 = std::env::var("WORKER_POLL_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1.0);

        Self {
            poll_interval: Duration::from_secs_f64(poll_secs.max(0.05)),
            max_retries: std::env::var("WORKER_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            mode: std::env::var("HEXIS_WORKER_MODE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(WorkerMode::Both),
        }
    }
}

/// RabbitMQ bridge settings from `RABBITMQ_*` variables.
#[derive(Debug, Clone)]
pub struct RabbitSettings {
    /// Whether the bridge is enabled at all.
    pub enabled: bool,
    /// Management API base URL (no trailing slash).
    pub management_url: String,
    /// Management API user.
    pub user: String,
    /// Management API password.
    pub password: String,
    /// Virtual host.
    pub vhost: String,
    /// Queue the agent publishes outbound messages to.
    pub outbox_queue: String,
    /// Queue the agent consumes inbound messages from.
    pub inbox_queue: String,
    /// Minimum interval between inbox polls.
    pub poll_inbox_every: Duration,
}

impl RabbitSettings {
    /// Read settings from the environment.
    pub fn from_env() -> Self {
        let enabled = std::env::var("RABBITMQ_ENABLED")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let poll_secs: f64 = std::env::var("RABBITMQ_POLL_INBOX_EVERY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1.0);

        Self {
            enabled,
            management_url: std::env::var("RABBITMQ_MANAGEMENT_URL")
                .unwrap_or_else(|_| "http://rabbitmq:15672".to_owned())
                .trim_end_matches('/')
                .to_owned(),
            user: std::env::var("RABBITMQ_USER").unwrap_or_else(|_| "hexis".to_owned()),
            password: std::env::var("RABBITMQ_PASSWORD")
                .unwrap_or_else(|_| "hexis_password".to_owned()),
            vhost: std::env::var("RABBITMQ_VHOST").unwrap_or_else(|_| "/".to_owned()),
            outbox_queue: std::env::var("RABBITMQ_OUTBOX_QUEUE")
                .unwrap_or_else(|_| "hexis.outbox".to_owned()),
            inbox_queue: std::env::var("RABBITMQ_INBOX_QUEUE")
                .unwrap_or_else(|_| "hexis.inbox".to_owned()),
            poll_inbox_every: Duration::from_secs_f64(poll_secs.max(0.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_dsn_shape() {
        let settings = PostgresSettings {
            host: "db.example".to_owned(),
            port: 5599,
            database: "hexis_x".to_owned(),
            user: "u".to_owned(),
            password: "p".to_owned(),
            wait_seconds: 30,
        };
        assert_eq!(settings.dsn(), "postgresql://u:p@db.example:5599/hexis_x");
    }

    #[test]
    fn test_worker_mode_parse() {
        assert_eq!(
            "heartbeat".parse::<WorkerMode>().expect("ok"),
            WorkerMode::Heartbeat
        );
        assert_eq!(
            " Both ".parse::<WorkerMode>().expect("ok"),
            WorkerMode::Both
        );
        assert!("neither".parse::<WorkerMode>().is_err());
    }
}
