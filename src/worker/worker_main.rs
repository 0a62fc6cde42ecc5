//! Worker process entry point.
//!
//! Reads one inbound message per line from stdin, hands each one to the
//! gateway, and writes responses to stdout as JSON lines. All log output goes
//! to stderr (inherited by the parent).
//!
//! Thread design:
//! - stdin reader thread: reads lines -> line channel
//! - main thread: current-thread tokio runtime, one task per message
//! - stdout writer thread: drains the response channel, one line per response

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use transcode_worker_types::{InboundMessage, Response};

use super::gateway::{Gateway, RequestOutcome};
use super::transcoder::ModuleLoader;
use crate::config::WorkerConfig;
use crate::module::WasmModuleLoader;

/// What happened to the messages read before input closed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    pub completed: usize,
    pub failed: usize,
    pub dropped: usize,
}

impl ServeSummary {
    fn record(&mut self, joined: Result<RequestOutcome, JoinError>) {
        match joined {
            Ok(RequestOutcome::Completed) => self.completed += 1,
            Ok(RequestOutcome::Failed) => self.failed += 1,
            Ok(RequestOutcome::Dropped) => self.dropped += 1,
            Err(e) => {
                error!("[WORKER] Request task died: {e}");
                self.failed += 1;
            }
        }
    }
}

/// Run the worker process until stdin closes.
pub fn run_worker(config: &WorkerConfig) -> anyhow::Result<()> {
    let module_path = config.module_path()?;
    info!(
        "[WORKER] Starting transcode worker (pid={}, module={})",
        std::process::id(),
        module_path.display()
    );

    let (response_tx, response_rx) = crossbeam_channel::unbounded::<Response>();
    let writer = thread::spawn(move || stdout_writer_task(response_rx));
    let lines = spawn_stdin_reader();

    let gateway = Gateway::new(WasmModuleLoader::from_file(module_path), Arc::new(response_tx))
        .with_progress_dedupe(config.dedupe_progress);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    info!("[WORKER] Ready, waiting for messages...");
    let summary = rt.block_on(serve(Arc::new(gateway), lines));
    drop(rt);

    // The gateway (and with it the last response sender) is gone, so the
    // writer finishes once it has flushed everything queued.
    writer
        .join()
        .map_err(|_| anyhow!("stdout writer thread panicked"))?;

    info!(
        "[WORKER] Exiting: {} completed, {} failed, {} dropped",
        summary.completed, summary.failed, summary.dropped
    );
    Ok(())
}

/// Dispatch every inbound line to the gateway until the line channel closes,
/// then wait for the requests still in flight.
///
/// Each message gets its own task, so a request waiting on the module does
/// not hold back the next one; on a current-thread runtime they interleave
/// without running in parallel.
pub async fn serve<L: ModuleLoader>(
    gateway: Arc<Gateway<L>>,
    mut lines: mpsc::UnboundedReceiver<String>,
) -> ServeSummary {
    let mut in_flight = JoinSet::new();
    let mut summary = ServeSummary::default();

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                let gateway = gateway.clone();
                in_flight.spawn(async move {
                    gateway.handle_request(InboundMessage::decode_line(&line)).await
                });
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                summary.record(joined);
            }
        }
    }

    if !in_flight.is_empty() {
        info!(
            "[WORKER] Input closed, waiting for {} in-flight request(s)",
            in_flight.len()
        );
    }
    while let Some(joined) = in_flight.join_next().await {
        summary.record(joined);
    }
    summary
}

/// Read stdin on a plain thread; pipe reads block.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();

    thread::spawn(move || {
        let stdin = io::stdin();
        let mut reader = stdin.lock();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break, // EOF, parent closed our stdin
                Ok(_) => {
                    // Invalid UTF-8 still becomes a message; the gateway drops it.
                    let line = String::from_utf8_lossy(&buf);
                    if line.trim().is_empty() {
                        continue;
                    }
                    if line_tx.send(line.into_owned()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("[WORKER] Stdin read error: {e}");
                    break;
                }
            }
        }
        debug!("[WORKER] Stdin reader thread exiting");
    });

    line_rx
}

fn stdout_writer_task(responses: crossbeam_channel::Receiver<Response>) {
    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    for response in responses.iter() {
        if let Err(e) = write_response(&mut stdout, &response) {
            error!("[WORKER] Failed to write response to stdout: {e}");
            break;
        }
    }
    debug!("[WORKER] Stdout writer thread exiting");
}

/// Write one response as a JSON line, flushing immediately.
pub fn write_response(out: &mut impl Write, response: &Response) -> io::Result<()> {
    let json = serde_json::to_string(response)?;
    writeln!(out, "{json}")?;
    out.flush()
}
