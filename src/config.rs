//! Worker configuration: a JSON file, overridden by command-line flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no module path configured (pass --module or set module_path)")]
    MissingModulePath,
}

/// Settings for one worker process. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Compiled WebAssembly module exporting `transcode`.
    pub module_path: Option<PathBuf>,
    /// `error`, `warn`, `info`, `debug`, `trace` or `off`.
    pub log_level: String,
    /// Also append logs to this file. Logs always go to stderr.
    pub log_file: Option<PathBuf>,
    /// Drop progress reports that repeat the previous position.
    pub dedupe_progress: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            module_path: None,
            log_level: "info".to_string(),
            log_file: None,
            dedupe_progress: true,
        }
    }
}

impl WorkerConfig {
    pub fn module_path(&self) -> Result<&Path, ConfigError> {
        self.module_path
            .as_deref()
            .ok_or(ConfigError::MissingModulePath)
    }
}

/// Load configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<WorkerConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn parse_config(text: &str) -> Result<WorkerConfig, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.dedupe_progress);
        assert!(matches!(
            config.module_path(),
            Err(ConfigError::MissingModulePath)
        ));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse_config(r#"{"module_path": "/opt/transcoder.wasm"}"#).unwrap();
        assert_eq!(
            config.module_path().unwrap(),
            Path::new("/opt/transcoder.wasm")
        );
        assert_eq!(config.log_level, "info");
        assert!(config.log_file.is_none());
        assert!(config.dedupe_progress);
    }

    #[test]
    fn test_full_file() {
        let config = parse_config(
            r#"{
                "module_path": "m.wasm",
                "log_level": "debug",
                "log_file": "logs/worker.log",
                "dedupe_progress": false
            }"#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_file.as_deref(), Some(Path::new("logs/worker.log")));
        assert!(!config.dedupe_progress);
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/worker.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_file() {
        assert!(parse_config("{ not json").is_err());
        assert!(parse_config(r#"{"dedupe_progress": "yes"}"#).is_err());
    }
}
