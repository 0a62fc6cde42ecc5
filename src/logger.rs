//! Process-wide logging. Stdout carries the protocol, so logs go to stderr,
//! plus an optional append-only file.

use std::path::Path;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use thiserror::Error;

use crate::config::WorkerConfig;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {m}{n}";

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("unknown log level `{0}`")]
    Level(String),
    #[error("cannot open log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid logging configuration: {0}")]
    Config(String),
    #[error("logger already installed: {0}")]
    Install(#[from] log::SetLoggerError),
}

pub fn parse_level(level: &str) -> Result<LevelFilter, LoggerError> {
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| LoggerError::Level(level.to_string()))
}

fn build_config(level: LevelFilter, log_file: Option<&Path>) -> Result<Config, LoggerError> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let mut builder = Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        // FileAppender creates missing parent directories itself.
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .append(true)
            .build(path)
            .map_err(|source| LoggerError::File {
                path: path.display().to_string(),
                source,
            })?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    builder
        .build(root.build(level))
        .map_err(|e| LoggerError::Config(e.to_string()))
}

/// Install the global logger. Call once, before the worker starts.
pub fn init_logging(config: &WorkerConfig) -> Result<(), LoggerError> {
    let level = parse_level(&config.log_level)?;
    let log_config = build_config(level, config.log_file.as_deref())?;
    log4rs::init_config(log_config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info").unwrap(), LevelFilter::Info);
        assert_eq!(parse_level(" DEBUG ").unwrap(), LevelFilter::Debug);
        assert_eq!(parse_level("off").unwrap(), LevelFilter::Off);
        assert!(matches!(parse_level("loud"), Err(LoggerError::Level(_))));
    }

    #[test]
    fn test_stderr_only_config_builds() {
        let config = build_config(LevelFilter::Warn, None).unwrap();
        assert_eq!(config.root().level(), LevelFilter::Warn);
        assert_eq!(config.root().appenders(), &["stderr".to_string()]);
    }

    #[test]
    fn test_file_appender_is_added() {
        let path = std::env::temp_dir()
            .join(format!("transcode-worker-log-{}", std::process::id()))
            .join("worker.log");
        let config = build_config(LevelFilter::Info, Some(&path)).unwrap();
        assert_eq!(
            config.root().appenders(),
            &["stderr".to_string(), "file".to_string()]
        );
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
