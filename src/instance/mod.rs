//! Named agent instances, each backed by its own Postgres substrate.
//!
//! The registry lives at `~/.hexis/instances.json`:
//!
//! ```json
//! {
//!   "version": 1,
//!   "current": "default",
//!   "instances": {
//!     "default": {
//!       "database": "hexis_memory",
//!       "host": "localhost",
//!       "port": 43815,
//!       "user": "hexis_user",
//!       "password_env": "POSTGRES_PASSWORD",
//!       "created_at": "2024-01-25T00:00:00Z",
//!       "description": "Default instance"
//!     }
//!   }
//! }
//! ```

mod api;
mod schema;

pub use api::{
    auto_import_default, clone_instance, create_instance, delete_instance, get_instance_dsn,
    import_instance, DeleteOutcome, InstanceApiError,
};
pub use schema::{
    admin_dsn_for, apply_schema, create_database, database_exists, drop_database,
    verify_database_connection,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Root of Hexis's on-disk state (`~/.hexis`).
pub fn hexis_home() -> PathBuf {
    if let Some(dirs) = directories::UserDirs::new() {
        return dirs.home_dir().join(".hexis");
    }
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_owned())).join(".hexis")
}

/// Errors from the instance registry.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    /// Name does not match `[A-Za-z][A-Za-z0-9_-]*`.
    #[error("invalid instance name '{0}': must start with a letter and contain only alphanumerics, dashes, underscores")]
    InvalidName(String),
    /// No instance registered under the name.
    #[error("instance '{0}' not found")]
    NotFound(String),
    /// An instance with the name already exists.
    #[error("instance '{0}' already exists")]
    Exists(String),
    /// Filesystem failure.
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Registry file failed to serialize.
    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Validate an instance name against the naming pattern.
pub fn validate_instance_name(name: &str) -> Result<(), InstanceError> {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap_or_else(|_| {
            // The literal above is a valid pattern; this branch is unreachable.
            regex::Regex::new("^$").expect("empty pattern")
        })
    });
    if re.is_match(name) {
        Ok(())
    } else {
        Err(InstanceError::InvalidName(name.to_owned()))
    }
}

/// Configuration for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Registry name (not stored inside the per-instance map).
    #[serde(skip)]
    pub name: String,
    /// Database name.
    pub database: String,
    /// Database host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Database port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database user.
    #[serde(default = "default_user")]
    pub user: String,
    /// Environment variable holding the password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    crate::config::DEFAULT_POSTGRES_PORT
}

fn default_user() -> String {
    "hexis_user".to_owned()
}

fn default_password_env() -> String {
    "POSTGRES_PASSWORD".to_owned()
}

impl InstanceConfig {
    /// Build a config with conventional defaults.
    pub fn new(name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: database.into(),
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password_env: default_password_env(),
            created_at: Utc::now(),
            description: String::new(),
        }
    }

    /// Postgres DSN for this instance; the password comes from
    /// `password_env` at call time.
    pub fn dsn(&self) -> String {
        let password = std::env::var(&self.password_env).unwrap_or_default();
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.user, password, self.host, self.port, self.database
        )
    }
}

/// On-disk registry shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    current: Option<String>,
    instances: BTreeMap<String, InstanceConfig>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: 1,
            current: None,
            instances: BTreeMap::new(),
        }
    }
}

/// Manages instances via a JSON registry file.
///
/// Single-writer, multi-reader: every mutation rewrites the whole file.
#[derive(Debug)]
pub struct InstanceRegistry {
    config_file: PathBuf,
    data: RegistryFile,
}

impl InstanceRegistry {
    /// Open (or initialise) a registry under the given directory.
    pub fn open(config_dir: &Path) -> Result<Self, InstanceError> {
        std::fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join("instances.json");
        let data = match std::fs::read_to_string(&config_file) {
            Ok(body) => serde_json::from_str(&body).unwrap_or_default(),
            Err(_) => RegistryFile::default(),
        };
        Ok(Self { config_file, data })
    }

    /// Open the default registry at `~/.hexis`.
    pub fn open_default() -> Result<Self, InstanceError> {
        Self::open(&hexis_home())
    }

    fn save(&self) -> Result<(), InstanceError> {
        let body = serde_json::to_string_pretty(&self.data)?;
        std::fs::write(&self.config_file, body)?;
        Ok(())
    }

    /// Name of the current instance, if any.
    pub fn get_current(&self) -> Option<String> {
        self.data.current.clone()
    }

    /// Select the current instance.
    pub fn set_current(&mut self, name: &str) -> Result<(), InstanceError> {
        if !self.data.instances.contains_key(name) {
            return Err(InstanceError::NotFound(name.to_owned()));
        }
        self.data.current = Some(name.to_owned());
        self.save()
    }

    /// Fetch an instance by name.
    pub fn get(&self, name: &str) -> Option<InstanceConfig> {
        self.data.instances.get(name).map(|config| {
            let mut config = config.clone();
            config.name = name.to_owned();
            config
        })
    }

    /// All registered instances.
    pub fn list_all(&self) -> Vec<InstanceConfig> {
        self.data
            .instances
            .iter()
            .map(|(name, config)| {
                let mut config = config.clone();
                config.name = name.clone();
                config
            })
            .collect()
    }

    /// Register a new instance.
    pub fn add(&mut self, config: InstanceConfig) -> Result<(), InstanceError> {
        validate_instance_name(&config.name)?;
        if self.data.instances.contains_key(&config.name) {
            return Err(InstanceError::Exists(config.name));
        }
        self.data.instances.insert(config.name.clone(), config);
        self.save()
    }

    /// Update an existing instance.
    pub fn update(&mut self, config: InstanceConfig) -> Result<(), InstanceError> {
        if !self.data.instances.contains_key(&config.name) {
            return Err(InstanceError::NotFound(config.name));
        }
        self.data.instances.insert(config.name.clone(), config);
        self.save()
    }

    /// Remove an instance. Removing the current one clears the selection.
    pub fn remove(&mut self, name: &str) -> Result<(), InstanceError> {
        if self.data.instances.remove(name).is_none() {
            return Err(InstanceError::NotFound(name.to_owned()));
        }
        if self.data.current.as_deref() == Some(name) {
            self.data.current = None;
        }
        self.save()
    }

    /// Whether an instance exists.
    pub fn exists(&self, name: &str) -> bool {
        self.data.instances.contains_key(name)
    }

    /// DSN for a named instance.
    pub fn dsn_for(&self, name: &str) -> Result<String, InstanceError> {
        self.get(name)
            .map(|config| config.dsn())
            .ok_or_else(|| InstanceError::NotFound(name.to_owned()))
    }
}

/// Current instance name from `HEXIS_INSTANCE` or the registry selection.
pub fn resolve_instance() -> Option<String> {
    if let Ok(name) = std::env::var("HEXIS_INSTANCE") {
        if !name.is_empty() {
            return Some(name);
        }
    }
    InstanceRegistry::open_default()
        .ok()
        .and_then(|registry| registry.get_current())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_instance_name("default").is_ok());
        assert!(validate_instance_name("Agent-2_test").is_ok());
        assert!(validate_instance_name("a").is_ok());
        assert!(validate_instance_name("2fast").is_err());
        assert!(validate_instance_name("-dash").is_err());
        assert!(validate_instance_name("").is_err());
        assert!(validate_instance_name("has space").is_err());
    }

    #[test]
    fn test_dsn_shape() {
        let config = InstanceConfig::new("test", "hexis_test");
        let dsn = config.dsn();
        assert!(dsn.starts_with("postgresql://hexis_user:"));
        assert!(dsn.ends_with("/hexis_test"));
    }
}
