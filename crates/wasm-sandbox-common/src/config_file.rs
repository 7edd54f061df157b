//! Configuration file structures for wasm-sandbox.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`LoaderConfig`]: Where module bytes are read from
//! - [`LoggingConfig`]: Tracing subscriber settings
//! - [`ModuleEntry`]: Explicit instance-to-file mapping

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::SandboxConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [sandbox.engine]
/// memory_limit_pages = 10
///
/// [sandbox.execution]
/// max_execution_ms = 5000
///
/// [sandbox.store]
/// max_active_instances = 25
/// max_idle_ms = 60000
/// cleanup_interval_ms = 5000
///
/// [loader]
/// module_dir = "./modules"
///
/// [logging]
/// filter = "info,wasm_sandbox=debug"
/// json = false
///
/// [[modules]]
/// id = "chat"
/// path = "./example/build/release.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Sandbox configuration (engine, execution, store, protocol).
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Module loader configuration.
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Explicit instance modules.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Module loader configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoaderConfig {
    /// Directory searched for `<instance id>.wasm` when no explicit entry matches.
    #[serde(default)]
    pub module_dir: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "defaults::log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: defaults::log_filter(),
            json: false,
        }
    }
}

/// An explicit mapping from instance id to module file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Instance identifier.
    pub id: String,

    /// Path to the WebAssembly module file.
    pub path: String,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn log_filter() -> String {
        "info,wasm_sandbox=debug".to_string()
    }
}
