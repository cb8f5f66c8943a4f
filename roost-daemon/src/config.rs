//! Daemon configuration from `roost.toml`, resolved against the data dir.
//!
//! Everything has a default so a missing config file means "use the stock
//! backend layout". The backend port is deliberately a config value and
//! never a literal at call sites.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::defaults;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Root configuration from roost.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoostToml {
    /// [backend] section
    #[serde(default)]
    pub backend: BackendSection,
}

/// [backend] section of roost.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendSection {
    /// TCP port the backend binds once ready
    #[serde(default = "default_port")]
    pub port: u16,

    /// Isolated runtime directory (defaults to `<data_dir>/venv`)
    pub runtime_dir: Option<PathBuf>,

    /// Bootstrap tool used to create the runtime and install packages
    #[serde(default = "default_package_manager")]
    pub package_manager: String,

    /// Package that provides the backend executable
    #[serde(default = "default_backend_package")]
    pub backend_package: String,

    /// Companion tooling package
    #[serde(default = "default_tools_package")]
    pub tools_package: String,

    /// Executable name inside the runtime (defaults to the backend package name)
    pub executable: Option<String>,

    /// Arguments passed to the backend executable
    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,

    /// Seconds to wait for a graceful exit before force-killing the tree
    #[serde(default = "default_grace_secs")]
    pub grace_timeout_secs: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            runtime_dir: None,
            package_manager: default_package_manager(),
            backend_package: default_backend_package(),
            tools_package: default_tools_package(),
            executable: None,
            args: default_backend_args(),
            grace_timeout_secs: default_grace_secs(),
        }
    }
}

fn default_port() -> u16 {
    defaults::DEFAULT_BACKEND_PORT
}

fn default_package_manager() -> String {
    "uv".to_string()
}

fn default_backend_package() -> String {
    "roost-backend".to_string()
}

fn default_tools_package() -> String {
    "roost-tools".to_string()
}

fn default_backend_args() -> Vec<String> {
    vec!["run".to_string()]
}

fn default_grace_secs() -> u64 {
    defaults::GRACE_TIMEOUT.as_secs()
}

impl RoostToml {
    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        Ok(toml::from_str(&contents)?)
    }

    /// Resolve into a concrete backend config.
    pub fn resolve(&self, data_dir: &Path) -> BackendConfig {
        let section = &self.backend;
        BackendConfig {
            port: section.port,
            runtime_dir: section
                .runtime_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("venv")),
            package_manager: section.package_manager.clone(),
            backend_package: section.backend_package.clone(),
            tools_package: section.tools_package.clone(),
            executable: section
                .executable
                .clone()
                .unwrap_or_else(|| section.backend_package.clone()),
            args: section.args.clone(),
            grace_timeout: Duration::from_secs(section.grace_timeout_secs),
        }
    }
}

/// Fully resolved backend definition shared by the prober, provisioner,
/// and supervisor.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub port: u16,
    pub runtime_dir: PathBuf,
    pub package_manager: String,
    pub backend_package: String,
    pub tools_package: String,
    pub executable: String,
    pub args: Vec<String>,
    pub grace_timeout: Duration,
}

impl BackendConfig {
    /// Package names in install order.
    pub fn packages(&self) -> [&str; 2] {
        [&self.backend_package, &self.tools_package]
    }
}
