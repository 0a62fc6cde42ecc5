use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::error;

use transcode_worker::config::{load_config, WorkerConfig};
use transcode_worker::logger::init_logging;
use transcode_worker::worker::run_worker;

/// Transcoding worker process. Reads `{"buffer": "<base64>"}` lines on
/// stdin and writes progress, result and error lines on stdout.
#[derive(Parser, Debug)]
#[command(name = "transcode_worker", version, about)]
struct Cli {
    /// Compiled WebAssembly transcoding module
    #[arg(long)]
    module: Option<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace, off)
    #[arg(long)]
    log_level: Option<String>,

    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => WorkerConfig::default(),
        };
        if let Some(module) = self.module {
            config.module_path = Some(module);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(file) = self.log_file {
            config.log_file = Some(file);
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;
    init_logging(&config).context("failed to initialize logging")?;

    if let Err(e) = run_worker(&config) {
        error!("[WORKER] Fatal: {e:#}");
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "transcode_worker",
            "--module",
            "codec.wasm",
            "--log-level",
            "debug",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.module_path.as_deref(), Some(std::path::Path::new("codec.wasm")));
        assert_eq!(config.log_level, "debug");
        assert!(config.log_file.is_none());
        assert!(config.dedupe_progress);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["transcode_worker", "--config", "/nonexistent/worker.json"]);
        assert!(cli.into_config().is_err());
    }
}
