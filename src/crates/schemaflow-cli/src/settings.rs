//! `schemaflow.toml` settings
//!
//! ```toml
//! [store]
//! url = "sqlite://schemaflow.db"
//! tenant_id = "org-1"
//! cleanup_enabled = false
//! max_checkpoints = 50
//!
//! [engine]
//! recursion_limit = 100
//! interactive = false
//!
//! [designer]
//! max_design_attempts = 3
//! max_statement_attempts = 3
//! ```
//!
//! Every key is optional. `SCHEMAFLOW_TENANT` and `SCHEMAFLOW_DATABASE_URL` override
//! the file (see the `--tenant` and `--database-url` flags).

use schemaflow_checkpoint::{CleanupPolicy, TenantId};
use schemaflow_core::RunConfig;
use schemaflow_designer::DesignerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SETTINGS_FILE: &str = "schemaflow.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default)]
    pub tenant_id: String,

    #[serde(default)]
    pub cleanup_enabled: bool,

    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,

    /// Interactive sessions retry failed compute calls; batch runs do not
    #[serde(default)]
    pub interactive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignerSettings {
    #[serde(default = "default_attempts")]
    pub max_design_attempts: u32,

    #[serde(default = "default_attempts")]
    pub max_statement_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub designer: DesignerSettings,
}

fn default_database_url() -> String {
    "sqlite://schemaflow.db".to_string()
}

fn default_max_checkpoints() -> usize {
    50
}

fn default_recursion_limit() -> usize {
    schemaflow_core::DEFAULT_RECURSION_LIMIT
}

fn default_attempts() -> u32 {
    3
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            tenant_id: String::new(),
            cleanup_enabled: false,
            max_checkpoints: default_max_checkpoints(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recursion_limit: default_recursion_limit(),
            interactive: false,
        }
    }
}

impl Default for DesignerSettings {
    fn default() -> Self {
        Self {
            max_design_attempts: default_attempts(),
            max_statement_attempts: default_attempts(),
        }
    }
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(content)?)
    }

    /// Read `path` if given, else `./schemaflow.toml` if present, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_SETTINGS_FILE).exists() => {
                Self::from_file(DEFAULT_SETTINGS_FILE)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn with_overrides(mut self, tenant: Option<String>, database_url: Option<String>) -> Self {
        if let Some(tenant) = tenant {
            self.store.tenant_id = tenant;
        }
        if let Some(url) = database_url {
            self.store.url = url;
        }
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.store.tenant_id.trim().is_empty() {
            return Err(SettingsError::InvalidConfig(
                "store.tenant_id is required (or set SCHEMAFLOW_TENANT)".to_string(),
            ));
        }
        if self.store.cleanup_enabled && self.store.max_checkpoints == 0 {
            return Err(SettingsError::InvalidConfig(
                "store.max_checkpoints must be at least 1 when cleanup is enabled".to_string(),
            ));
        }
        if self.engine.recursion_limit == 0 {
            return Err(SettingsError::InvalidConfig(
                "engine.recursion_limit must be at least 1".to_string(),
            ));
        }
        if self.designer.max_design_attempts == 0 || self.designer.max_statement_attempts == 0 {
            return Err(SettingsError::InvalidConfig(
                "designer attempt limits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tenant(&self) -> Result<TenantId, SettingsError> {
        TenantId::new(&self.store.tenant_id)
            .map_err(|error| SettingsError::InvalidConfig(error.to_string()))
    }

    pub fn cleanup_policy(&self) -> CleanupPolicy {
        if self.store.cleanup_enabled {
            CleanupPolicy::keep_latest(self.store.max_checkpoints)
        } else {
            CleanupPolicy::default()
        }
    }

    pub fn run_config(&self, thread_id: &str) -> Result<RunConfig, SettingsError> {
        Ok(RunConfig::new(self.tenant()?, thread_id)
            .with_recursion_limit(self.engine.recursion_limit)
            .with_interactive(self.engine.interactive))
    }

    pub fn designer_config(&self) -> DesignerConfig {
        DesignerConfig {
            max_design_attempts: self.designer.max_design_attempts,
            max_statement_attempts: self.designer.max_statement_attempts,
            interactive: self.engine.interactive,
        }
    }
}
