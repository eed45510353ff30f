//! Substrate lifecycle: create, drop, verify, and apply schema.
//!
//! Database DDL cannot be parameterized, so names are validated against a
//! strict identifier pattern before interpolation.

use sqlx::{Connection, PgConnection};
use tracing::info;

/// Validate a database name for safe identifier quoting.
fn validate_db_name(name: &str) -> anyhow::Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
    if !valid {
        anyhow::bail!("invalid database name: {name:?}");
    }
    Ok(())
}

/// Derive an admin DSN by pointing the base DSN at the `postgres` catalogue.
pub fn admin_dsn_for(base_dsn: &str) -> String {
    let Some(scheme_end) = base_dsn.find("://") else {
        return format!("{base_dsn}/postgres");
    };
    let after_scheme = &base_dsn[scheme_end.saturating_add(3)..];
    match after_scheme.find('/') {
        Some(slash) => {
            let cut = scheme_end.saturating_add(3).saturating_add(slash);
            format!("{}/postgres", &base_dsn[..cut])
        }
        None => format!("{base_dsn}/postgres"),
    }
}

/// Create a new empty database.
///
/// # Errors
///
/// Fails if the database already exists or the admin connection fails.
pub async fn create_database(db_name: &str, admin_dsn: &str) -> anyhow::Result<()> {
    validate_db_name(db_name)?;
    let mut conn = PgConnection::connect(admin_dsn).await?;

    let exists: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(db_name)
            .fetch_optional(&mut conn)
            .await?;
    if exists.is_some() {
        conn.close().await?;
        anyhow::bail!("database '{db_name}' already exists");
    }

    sqlx::query(&format!("CREATE DATABASE \"{db_name}\""))
        .execute(&mut conn)
        .await?;
    conn.close().await?;
    info!(database = db_name, "created database");
    Ok(())
}

/// Drop a database, terminating its remaining connections first.
pub async fn drop_database(db_name: &str, admin_dsn: &str) -> anyhow::Result<()> {
    validate_db_name(db_name)?;
    let mut conn = PgConnection::connect(admin_dsn).await?;

    sqlx::query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity
         WHERE datname = $1 AND pid <> pg_backend_pid()",
    )
    .bind(db_name)
    .execute(&mut conn)
    .await?;

    sqlx::query(&format!("DROP DATABASE IF EXISTS \"{db_name}\""))
        .execute(&mut conn)
        .await?;
    conn.close().await?;
    info!(database = db_name, "dropped database");
    Ok(())
}

/// Whether a database exists.
pub async fn database_exists(db_name: &str, admin_dsn: &str) -> anyhow::Result<bool> {
    let mut conn = PgConnection::connect(admin_dsn).await?;
    let exists: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(db_name)
            .fetch_optional(&mut conn)
            .await?;
    conn.close().await?;
    Ok(exists.is_some())
}

/// Apply the embedded schema files to a substrate, in lexicographic order.
pub async fn apply_schema(dsn: &str) -> anyhow::Result<()> {
    let store = crate::store::Store::connect(dsn, std::time::Duration::from_secs(10)).await?;
    store.apply_embedded_schema().await?;
    Ok(())
}

/// Whether a connection to the DSN succeeds.
pub async fn verify_database_connection(dsn: &str) -> bool {
    match PgConnection::connect(dsn).await {
        Ok(conn) => {
            let _ = conn.close().await;
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_dsn_replaces_database() {
        assert_eq!(
            admin_dsn_for("postgresql://u:p@host:5432/hexis_x"),
            "postgresql://u:p@host:5432/postgres"
        );
        assert_eq!(
            admin_dsn_for("postgresql://u:p@host:5432"),
            "postgresql://u:p@host:5432/postgres"
        );
    }

    #[test]
    fn test_db_name_validation() {
        assert!(validate_db_name("hexis_agent1").is_ok());
        assert!(validate_db_name("_internal").is_ok());
        assert!(validate_db_name("1bad").is_err());
        assert!(validate_db_name("drop\"; --").is_err());
        assert!(validate_db_name("").is_err());
    }
}
