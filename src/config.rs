//! Demo binary configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CHOMFLOW_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration of the demo binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Machine configuration.
    pub machine: MachineConfig,
    /// Runtime configuration.
    pub runtime: RuntimeConfig,
    /// Periodic trigger configuration.
    pub scheduler: SchedulerConfig,
    /// Logging configuration.
    pub log: LogConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CHOMFLOW_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.machine.apply_env_overrides();
        self.runtime.apply_env_overrides();
        self.scheduler.apply_env_overrides();
        self.log.apply_env_overrides();
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machine.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "machine.name must not be empty".to_string(),
            ));
        }
        if self.machine.initial_flow.is_empty() {
            return Err(ConfigError::ValidationError(
                "machine.initial_flow must not be empty".to_string(),
            ));
        }
        if self.machine.initial_flow.contains(':') {
            return Err(ConfigError::ValidationError(
                "machine.initial_flow must not contain ':' (reserved for child flows)".to_string(),
            ));
        }
        if self.scheduler.cadence.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "scheduler.cadence must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Machine name.
    pub name: String,
    /// Name of the flow started with the machine.
    pub initial_flow: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: "chomflow".to_string(),
            initial_flow: "main".to_string(),
        }
    }
}

impl MachineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("CHOMFLOW_MACHINE_NAME") {
            if !name.is_empty() {
                self.name = name;
            }
        }

        if let Ok(flow) = std::env::var("CHOMFLOW_INITIAL_FLOW") {
            if !flow.is_empty() {
                self.initial_flow = flow;
            }
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum snapshots kept per storage (0 = unlimited).
    pub history_limit: usize,
}

impl RuntimeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(limit) = std::env::var("CHOMFLOW_HISTORY_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.history_limit = n;
            }
        }
    }
}

/// Periodic trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Skip a firing while the previous one is still running.
    pub singleton: bool,
    /// Cadence of periodic states, in the scheduler's syntax.
    pub cadence: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            singleton: true,
            cadence: "* * * * * *".to_string(),
        }
    }
}

impl SchedulerConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(singleton) = std::env::var("CHOMFLOW_SCHEDULER_SINGLETON") {
            self.singleton = singleton == "1" || singleton.to_lowercase() == "true";
        }

        if let Ok(cadence) = std::env::var("CHOMFLOW_SCHEDULER_CADENCE") {
            self.cadence = cadence;
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when RUST_LOG is not set.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl LogConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(filter) = std::env::var("CHOMFLOW_LOG") {
            self.filter = filter;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
