//! Patch engine configuration loading
//!
//! Loads configuration from `~/.config/user-patch/config.toml` (or the
//! `USER_PATCH_CONFIG` env var). Every key is optional.

use crate::errors::{PatchError, Result};
use crate::retry::RetryConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PatchEngineConfig {
    /// Path to the SQLite database used by the CLI
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Upper bound on any single storage call
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,

    /// Retry policy for audit appends
    #[serde(default)]
    pub audit_retry: AuditRetryConfig,

    /// Mutable-attribute schema for user records
    #[serde(default)]
    pub schema: SchemaConfig,
}

fn default_db_path() -> String {
    dirs::data_dir()
        .map(|d| {
            d.join("user-patch")
                .join("users.db")
                .to_string_lossy()
                .into_owned()
        })
        .unwrap_or_else(|| "users.db".to_string())
}

fn default_storage_timeout_ms() -> u64 {
    5_000
}

/// Audit append retry settings
#[derive(Debug, Deserialize, Clone)]
pub struct AuditRetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> usize {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    2_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for AuditRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl AuditRetryConfig {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries,
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// User field schema
#[derive(Debug, Deserialize, Clone)]
pub struct SchemaConfig {
    /// Fields a patch may add, remove or replace
    #[serde(default = "default_mutable_fields")]
    pub mutable_fields: Vec<String>,

    /// System fields a patch may never target
    #[serde(default = "default_immutable_fields")]
    pub immutable_fields: Vec<String>,

    /// Accepted values for `status` (empty = unrestricted)
    #[serde(default = "default_allowed_statuses")]
    pub allowed_statuses: Vec<String>,

    /// Fields every stored user must carry as a non-empty string
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
}

fn default_mutable_fields() -> Vec<String> {
    [
        "email",
        "title",
        "first_name",
        "last_name",
        "country_code",
        "auth0_id",
        "crm_id",
        "status",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_immutable_fields() -> Vec<String> {
    ["id", "created", "modified", "version"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_required_fields() -> Vec<String> {
    vec!["email".to_string()]
}

fn default_allowed_statuses() -> Vec<String> {
    ["new", "active", "suspended", "deactivated"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            mutable_fields: default_mutable_fields(),
            immutable_fields: default_immutable_fields(),
            allowed_statuses: default_allowed_statuses(),
            required_fields: default_required_fields(),
        }
    }
}

impl Default for PatchEngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage_timeout_ms: default_storage_timeout_ms(),
            audit_retry: AuditRetryConfig::default(),
            schema: SchemaConfig::default(),
        }
    }
}

impl PatchEngineConfig {
    /// Environment variable for config path override
    pub const ENV_CONFIG_PATH: &'static str = "USER_PATCH_CONFIG";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "config.toml";

    /// Load configuration from file
    ///
    /// Resolution order:
    /// 1. `USER_PATCH_CONFIG` environment variable
    /// 2. `~/.config/user-patch/config.toml`
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PatchError::config(format!("failed to read config at {}: {e}", path.display()))
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: PatchEngineConfig = toml::from_str(contents)
            .map_err(|e| PatchError::config(format!("failed to parse config: {e}")))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .map(|h| {
                h.join(".config")
                    .join("user-patch")
                    .join(Self::DEFAULT_CONFIG_FILENAME)
            })
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    fn validate(&self) -> Result<()> {
        if let Some(field) = self
            .schema
            .mutable_fields
            .iter()
            .find(|f| self.schema.immutable_fields.contains(f))
        {
            tracing::warn!(
                field = %field,
                "field listed as both mutable and immutable; it will not be patchable"
            );
        }

        if let Some(field) = self
            .schema
            .required_fields
            .iter()
            .find(|f| !self.schema.mutable_fields.contains(f))
        {
            tracing::warn!(
                field = %field,
                "required field is not mutable; users cannot be created"
            );
        }

        if self.audit_retry.backoff_multiplier < 1.0 {
            return Err(PatchError::config(
                "audit_retry.backoff_multiplier must be >= 1.0",
            ));
        }

        if self.storage_timeout_ms == 0 {
            return Err(PatchError::config("storage_timeout_ms must be > 0"));
        }

        Ok(())
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    /// Get the resolved database path (expanding ~ if needed)
    pub fn resolved_db_path(&self) -> PathBuf {
        let path = &self.db_path;
        if let Some(stripped) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(stripped);
        }
        PathBuf::from(path)
    }
}
