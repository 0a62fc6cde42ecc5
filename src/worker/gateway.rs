//! Request relay between the inbound channel and the processing module.
//!
//! Per request: `Received -> {Dropped | Processing -> Progress* -> {Result | Error}}`.
//! A well-formed request always ends in exactly one `Result` or `Error`;
//! a malformed one is logged and never answered.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use log::{debug, info, warn};
use thiserror::Error;
use transcode_worker_types::{InboundMessage, Response, TranscodeOutput};

use super::init_state::{InitCell, InitPhase};
use super::progress::ProgressReporter;
use super::sink::ResponseSink;
use super::transcoder::{panic_message, LoadError, ModuleLoader, TranscodeError, Transcoder};

/// How much of an unexpected message ends up in the log.
const UNEXPECTED_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("module initialization failed: {0}")]
    Init(LoadError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
    #[error("transcode panicked: {0}")]
    Panicked(String),
}

/// Terminal state of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Not a buffer. Nothing was sent.
    Dropped,
    /// A `Result` was sent.
    Completed,
    /// An `Error` was sent.
    Failed,
}

/// Owns the lazily loaded module and relays requests to it.
pub struct Gateway<L: ModuleLoader> {
    loader: Arc<L>,
    module: InitCell<L::Module>,
    sink: Arc<dyn ResponseSink>,
    dedupe_progress: bool,
}

impl<L: ModuleLoader> std::fmt::Debug for Gateway<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("module", &self.module)
            .field("dedupe_progress", &self.dedupe_progress)
            .finish_non_exhaustive()
    }
}

impl<L: ModuleLoader> Gateway<L> {
    pub fn new(loader: L, sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            loader: Arc::new(loader),
            module: InitCell::new(),
            sink,
            dedupe_progress: true,
        }
    }

    pub fn with_progress_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe_progress = dedupe;
        self
    }

    pub fn init_phase(&self) -> InitPhase {
        self.module.phase()
    }

    /// Number of module loads started so far. Never more than one.
    pub fn load_attempts(&self) -> usize {
        self.module.attempts()
    }

    /// Load the module if nobody has yet, or wait for the load in flight.
    pub async fn ensure_ready(&self) -> Result<Arc<L::Module>, GatewayError> {
        let loader = self.loader.clone();
        self.module
            .get_or_init(move || async move {
                info!("[GATEWAY] Loading processing module");
                let loaded = loader.load().await;
                if loaded.is_ok() {
                    info!("[GATEWAY] Processing module ready");
                }
                loaded
            })
            .await
            .map_err(GatewayError::Init)
    }

    /// Handle one inbound message.
    pub async fn handle_request(&self, message: InboundMessage) -> RequestOutcome {
        let input = match message {
            InboundMessage::Buffer(input) => input,
            InboundMessage::Unexpected(raw) => {
                warn!("[GATEWAY] received unexpected message: {}", preview(&raw));
                return RequestOutcome::Dropped;
            }
        };

        let input_len = input.len();
        debug!("[GATEWAY] Request received ({input_len} bytes)");

        let result = AssertUnwindSafe(self.process(input))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(GatewayError::Panicked(panic_message(&*panic))));

        match result {
            Ok(output) => {
                info!(
                    "[GATEWAY] Request done: {input_len} bytes in, {} bytes out as {}",
                    output.data.len(),
                    output.filename
                );
                self.sink.post(Response::Result(output));
                RequestOutcome::Completed
            }
            Err(e) => {
                warn!("[GATEWAY] Request failed: {e}");
                self.sink.post(Response::Error(e.to_string()));
                RequestOutcome::Failed
            }
        }
    }

    async fn process(&self, input: Box<[u8]>) -> Result<TranscodeOutput, GatewayError> {
        let module = self.ensure_ready().await?;
        let progress = ProgressReporter::new(self.sink.clone()).with_dedupe(self.dedupe_progress);
        Ok(module.transcode(input, progress).await?)
    }
}

fn preview(raw: &str) -> String {
    let mut chars = raw.chars();
    let head: String = chars.by_ref().take(UNEXPECTED_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
