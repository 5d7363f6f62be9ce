//! Configuration for the document store
//!
//! Loads configuration from:
//! 1. a YAML file - database location, dispatch switches, logging
//! 2. a `.env` file, if present
//!
//! Environment variables always override YAML values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::dispatch::DispatchOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; in-memory when unset
    pub path: Option<PathBuf>,
}

/// Pipeline dispatch switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Send every pipeline straight to the in-memory evaluator
    pub force_fallback: bool,

    /// Try the single-statement tier before compiling
    pub direct_sql: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            force_fallback: false,
            direct_sql: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&contents)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse YAML only; missing sections take their defaults.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("DOCPIPE_DATABASE_PATH") {
            self.database.path = if path.is_empty() { None } else { Some(PathBuf::from(path)) };
        }
        if let Some(flag) = env_flag("DOCPIPE_FORCE_FALLBACK") {
            self.pipeline.force_fallback = flag;
        }
        if let Some(flag) = env_flag("DOCPIPE_DIRECT_SQL") {
            self.pipeline.direct_sql = flag;
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            force_fallback: self.pipeline.force_fallback,
            direct_sql: self.pipeline.direct_sql,
        }
    }
}

// Unrecognized values leave the setting alone.
fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.database.path.is_none());
        assert!(!config.pipeline.force_fallback);
        assert!(config.pipeline.direct_sql);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.output, "stdout");
        assert_eq!(config.dispatch_options(), DispatchOptions::default());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            r#"
database:
  path: "/tmp/docs.db"
pipeline:
  force_fallback: true
"#,
        )
        .unwrap();
        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/docs.db")));
        assert!(config.pipeline.force_fallback);
        assert!(config.pipeline.direct_sql);
        assert_eq!(config.logging.directory, "./logs");

        assert!(Config::from_yaml("").unwrap().pipeline.direct_sql);
        assert!(Config::from_yaml("pipeline: [1").is_err());
    }

    #[test]
    fn test_env_var_override() {
        std::env::set_var("DOCPIPE_DIRECT_SQL", "false");
        std::env::set_var("DOCPIPE_FORCE_FALLBACK", "maybe");

        let temp_file = std::env::temp_dir().join("docpipe_test_config.yaml");
        std::fs::write(&temp_file, "pipeline:\n  direct_sql: true\n  force_fallback: true\n").unwrap();

        let config = Config::load(&temp_file).unwrap();
        assert!(!config.pipeline.direct_sql); // Overridden
        assert!(config.pipeline.force_fallback); // Unparseable value ignored

        std::env::remove_var("DOCPIPE_DIRECT_SQL");
        std::env::remove_var("DOCPIPE_FORCE_FALLBACK");
        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn test_missing_file() {
        let missing = std::env::temp_dir().join("docpipe_no_such_config.yaml");
        assert!(matches!(Config::load(missing), Err(ConfigError::Io(_))));
    }
}
