//! High-level instance lifecycle: create, import, clone, delete.
//!
//! Deletion is gated by the agent's own termination review: unless the
//! substrate already reports terminated/unconfigured (or permission is
//! waived), the agent is asked to consent, the review is persisted in the
//! store and under `~/.hexis/termination_records/`, and a refusal raises
//! [`InstanceApiError::DeletionRefused`] unless forced.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::calls::prompts;
use crate::calls::schemas::TerminationReview;
use crate::llm::json::chat_json;
use crate::llm::{load_llm_binding, resolve_provider, ChatMessage};
use crate::store::Store;

use super::schema::{
    admin_dsn_for, apply_schema, create_database, database_exists, drop_database,
    verify_database_connection,
};
use super::{hexis_home, validate_instance_name, InstanceConfig, InstanceError, InstanceRegistry};

/// Errors from high-level instance operations.
#[derive(Debug, thiserror::Error)]
pub enum InstanceApiError {
    /// Registry-level failure.
    #[error(transparent)]
    Registry(#[from] InstanceError),
    /// The agent declined deletion permission.
    #[error("agent declined deletion permission; use force to override")]
    DeletionRefused {
        /// The review document the agent returned.
        review: TerminationReview,
    },
    /// Anything else (database, subprocess, review plumbing).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of a deletion run.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    /// Review the agent produced, when one was requested.
    pub review: Option<TerminationReview>,
    /// Path of the termination record file, when one was written.
    pub record_path: Option<PathBuf>,
}

/// Create a new instance: fresh substrate, schema, registry entry.
pub async fn create_instance(
    name: &str,
    description: &str,
    admin_dsn: Option<&str>,
) -> Result<InstanceConfig, InstanceApiError> {
    validate_instance_name(name)?;
    let mut registry = InstanceRegistry::open_default()?;
    if registry.exists(name) {
        return Err(InstanceError::Exists(name.to_owned()).into());
    }

    let db_name = format!("hexis_{name}");
    let mut config = InstanceConfig::new(name, db_name.clone());
    config.host = std::env::var("POSTGRES_HOST").unwrap_or(config.host);
    config.port = std::env::var("POSTGRES_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.port);
    config.user = std::env::var("POSTGRES_USER").unwrap_or(config.user);
    config.description = description.to_owned();

    let admin = admin_dsn
        .map(str::to_owned)
        .unwrap_or_else(|| admin_dsn_for(&config.dsn()));

    if database_exists(&db_name, &admin).await? {
        return Err(anyhow::anyhow!("database '{db_name}' already exists").into());
    }
    create_database(&db_name, &admin).await?;

    info!(instance = name, database = %db_name, "applying schema");
    apply_schema(&config.dsn()).await?;

    registry.add(config.clone())?;
    info!(instance = name, "instance created");
    Ok(config)
}

/// Register an existing, reachable substrate as an instance.
pub async fn import_instance(
    name: &str,
    database: Option<&str>,
    description: &str,
) -> Result<InstanceConfig, InstanceApiError> {
    validate_instance_name(name)?;
    let mut registry = InstanceRegistry::open_default()?;
    if registry.exists(name) {
        return Err(InstanceError::Exists(name.to_owned()).into());
    }

    let db_name = database
        .map(str::to_owned)
        .unwrap_or_else(|| format!("hexis_{name}"));
    let mut config = InstanceConfig::new(name, db_name.clone());
    config.host = std::env::var("POSTGRES_HOST").unwrap_or(config.host);
    config.port = std::env::var("POSTGRES_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.port);
    config.user = std::env::var("POSTGRES_USER").unwrap_or(config.user);
    config.description = description.to_owned();

    if !verify_database_connection(&config.dsn()).await {
        return Err(anyhow::anyhow!("cannot connect to database '{db_name}'").into());
    }

    registry.add(config.clone())?;
    info!(instance = name, database = %db_name, "instance imported");
    Ok(config)
}

/// Clone an instance by streaming `pg_dump -Fc` into `pg_restore`.
///
/// The target substrate is dropped again on any failure.
pub async fn clone_instance(
    source_name: &str,
    target_name: &str,
    description: &str,
) -> Result<InstanceConfig, InstanceApiError> {
    validate_instance_name(target_name)?;
    let mut registry = InstanceRegistry::open_default()?;
    let source = registry
        .get(source_name)
        .ok_or_else(|| InstanceError::NotFound(source_name.to_owned()))?;
    if registry.exists(target_name) {
        return Err(InstanceError::Exists(target_name.to_owned()).into());
    }

    let target_db = format!("hexis_{target_name}");
    let admin = admin_dsn_for(&source.dsn());
    if database_exists(&target_db, &admin).await? {
        return Err(anyhow::anyhow!("database '{target_db}' already exists").into());
    }
    create_database(&target_db, &admin).await?;

    match stream_clone(&source, &target_db).await {
        Ok(()) => {}
        Err(e) => {
            // Best-effort cleanup of the half-made target.
            if let Err(drop_err) = drop_database(&target_db, &admin).await {
                warn!(error = %drop_err, "failed to drop partially-cloned database");
            }
            return Err(e.into());
        }
    }

    let mut config = InstanceConfig::new(target_name, target_db);
    config.host = source.host.clone();
    config.port = source.port;
    config.user = source.user.clone();
    config.password_env = source.password_env.clone();
    config.description = if description.is_empty() {
        format!("Cloned from {source_name}")
    } else {
        description.to_owned()
    };

    registry.add(config.clone())?;
    info!(source = source_name, target = target_name, "instance cloned");
    Ok(config)
}

async fn stream_clone(source: &InstanceConfig, target_db: &str) -> anyhow::Result<()> {
    let password = std::env::var(&source.password_env).unwrap_or_default();

    let mut dump = tokio::process::Command::new("pg_dump")
        .args([
            "-h",
            &source.host,
            "-p",
            &source.port.to_string(),
            "-U",
            &source.user,
            "-d",
            &source.database,
            "-Fc",
        ])
        .env("PGPASSWORD", &password)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| anyhow::anyhow!("pg_dump not available: {e}"))?;

    let dump_stdout = dump
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to capture pg_dump stdout"))?;

    let restore = tokio::process::Command::new("pg_restore")
        .args([
            "-h",
            &source.host,
            "-p",
            &source.port.to_string(),
            "-U",
            &source.user,
            "-d",
            target_db,
        ])
        .env("PGPASSWORD", &password)
        .stdin(std::process::Stdio::from(
            dump_stdout.into_owned_fd().map_err(|e| {
                anyhow::anyhow!("failed to convert pg_dump stdout into a pipe: {e}")
            })?,
        ))
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| anyhow::anyhow!("pg_restore not available: {e}"))?;

    let restore_output = restore.wait_with_output().await?;
    let dump_status = dump.wait().await?;

    if !dump_status.success() {
        anyhow::bail!("pg_dump exited with {dump_status}");
    }
    // pg_restore exits non-zero on warnings too; only treat real errors as
    // fatal.
    if !restore_output.status.success() {
        let stderr = String::from_utf8_lossy(&restore_output.stderr);
        if stderr.to_lowercase().contains("error") {
            anyhow::bail!("pg_restore failed: {stderr}");
        }
    }
    Ok(())
}

/// Delete an instance, honoring the termination-review gate.
pub async fn delete_instance(
    name: &str,
    force: bool,
    reason: Option<&str>,
    require_permission: bool,
) -> Result<DeleteOutcome, InstanceApiError> {
    let mut registry = InstanceRegistry::open_default()?;
    let config = registry
        .get(name)
        .ok_or_else(|| InstanceError::NotFound(name.to_owned()))?;
    let admin = admin_dsn_for(&config.dsn());

    let mut outcome = DeleteOutcome::default();

    if require_permission {
        let store = Store::connect(&config.dsn(), Duration::from_secs(10))
            .await
            .map_err(|e| anyhow::anyhow!("cannot connect to instance '{name}': {e}"))?;

        let terminated = store.is_agent_terminated().await.unwrap_or(false);
        let configured = store.is_agent_configured().await.unwrap_or(false);

        if !terminated && configured {
            let review = request_termination_review(&store, reason).await;

            let record = json!({
                "instance": name,
                "requested_at": Utc::now(),
                "review": review,
            });
            persist_review(&store, &record).await;
            outcome.record_path = write_termination_record(name, &record);

            if review.confirm {
                let farewells = serde_json::to_value(&review.farewells)
                    .unwrap_or_else(|_| json!([]));
                store
                    .terminate_agent(&review.last_will, &farewells, &json!({}))
                    .await
                    .map_err(|e| anyhow::anyhow!("termination procedure failed: {e}"))?;
                outcome.review = Some(review);
            } else if force {
                warn!(instance = name, "deletion refused by agent; overridden by force");
                outcome.review = Some(review);
            } else {
                return Err(InstanceApiError::DeletionRefused { review });
            }
        }
    }

    drop_database(&config.database, &admin).await?;
    registry.remove(name)?;
    info!(instance = name, "instance deleted");
    Ok(outcome)
}

/// Ask the agent for termination consent via its heartbeat model.
///
/// Any failure resolves to the declared refusal fallback.
async fn request_termination_review(store: &Store, reason: Option<&str>) -> TerminationReview {
    let context = store
        .gather_turn_context()
        .await
        .unwrap_or_else(|_| json!({}));
    let params = reason
        .map(|r| json!({"reason": r}))
        .unwrap_or_else(|| json!({}));

    let user_prompt = format!(
        "Context (JSON):\n{}\n\nDeletion request params (JSON):\n{}\n\n\
         If you refuse, include objections and alternative_actions. \
         In all cases, include a last_will.",
        truncate(&context.to_string(), 8000),
        truncate(&params.to_string(), 2000),
    );

    let fallback = TerminationReview::fallback_refusal();
    let fallback_doc = match serde_json::to_value(&fallback) {
        Ok(doc) => doc,
        Err(_) => return fallback,
    };

    let binding = match load_llm_binding(store, "llm.heartbeat", None).await {
        Ok(binding) => binding,
        Err(_) => return fallback,
    };
    let provider = match resolve_provider(&binding) {
        Ok(provider) => provider,
        Err(_) => return fallback,
    };

    let (doc, _raw) = chat_json(
        provider.as_ref(),
        vec![
            ChatMessage::system(prompts::TERMINATION_REVIEW),
            ChatMessage::user(user_prompt),
        ],
        1200,
        &fallback_doc,
    )
    .await;

    let mut review = TerminationReview::parse_or_fallback(&doc);
    if review.last_will.trim().is_empty() {
        review.last_will = if review.reasoning.is_empty() {
            fallback.last_will.clone()
        } else {
            review.reasoning.clone()
        };
    }
    review
}

/// Persist the latest review into store state (best-effort).
async fn persist_review(store: &Store, record: &serde_json::Value) {
    if let Err(e) = store
        .set_state("termination.review.latest", record)
        .await
    {
        warn!(error = %e, "failed to persist termination review in store");
    }
}

/// Write the review record under `~/.hexis/termination_records/<instance>/`.
fn write_termination_record(instance: &str, record: &serde_json::Value) -> Option<PathBuf> {
    let dir = hexis_home().join("termination_records").join(instance);
    if std::fs::create_dir_all(&dir).is_err() {
        return None;
    }
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = dir.join(format!("{instance}-{timestamp}.json"));
    let body = serde_json::to_string_pretty(record).ok()?;
    std::fs::write(&path, body).ok()?;
    Some(path)
}

/// Auto-import the conventional `hexis_memory` database as `default`.
///
/// Keeps single-instance setups working without an explicit `create`.
pub async fn auto_import_default() -> Result<Option<InstanceConfig>, InstanceApiError> {
    let mut registry = InstanceRegistry::open_default()?;
    if registry.exists("default") {
        return Ok(None);
    }

    let settings = crate::config::PostgresSettings::from_env();
    if !verify_database_connection(&settings.dsn()).await {
        return Ok(None);
    }

    let mut config = InstanceConfig::new("default", settings.database.clone());
    config.host = settings.host;
    config.port = settings.port;
    config.user = settings.user;
    config.description = "Default instance (auto-imported)".to_owned();

    registry.add(config.clone())?;
    registry.set_current("default")?;
    info!("auto-imported existing database as 'default' instance");
    Ok(Some(config))
}

/// Resolve the DSN for a named instance, the current selection, or the
/// environment fallback.
pub fn get_instance_dsn(instance: Option<&str>) -> Result<String, InstanceApiError> {
    if let Some(name) = instance {
        let registry = InstanceRegistry::open_default()?;
        return Ok(registry.dsn_for(name)?);
    }
    Ok(crate::config::db_dsn_from_env())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    text.chars().take(max_chars).collect()
}
