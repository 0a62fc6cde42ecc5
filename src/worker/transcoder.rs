//! Seams between the gateway and the processing module it drives.

use std::any::Any;
use std::future::Future;

use thiserror::Error;
use transcode_worker_types::TranscodeOutput;

use super::progress::ProgressReporter;

/// Failure while loading the module. Cloned to every request waiting on the load.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("cannot read module {path}: {message}")]
    Read { path: String, message: String },
    #[error("cannot compile module: {0}")]
    Compile(String),
    #[error("module does not export `{0}`")]
    MissingExport(String),
    #[error("module imports unsupported host function `{0}`")]
    UnsupportedImport(String),
    #[error("{0}")]
    Other(String),
}

/// Failure while processing one request.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The module ran and rejected the input; the message is the module's own.
    #[error("{0}")]
    Rejected(String),
    #[error("module ABI violation: {0}")]
    Abi(String),
    #[error("module trapped: {0}")]
    Trap(String),
    #[error("transcode task failed: {0}")]
    Task(String),
}

/// The processing function: `(input, progress) -> output`.
///
/// Implementations may report progress any number of times before resolving.
/// Every report must happen before the returned future completes.
pub trait Transcoder: Send + Sync + 'static {
    fn transcode(
        &self,
        input: Box<[u8]>,
        progress: ProgressReporter,
    ) -> impl Future<Output = Result<TranscodeOutput, TranscodeError>> + Send;
}

/// Produces the processing module. Called at most once per gateway.
pub trait ModuleLoader: Send + Sync + 'static {
    type Module: Transcoder;

    fn load(&self) -> impl Future<Output = Result<Self::Module, LoadError>> + Send;
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
