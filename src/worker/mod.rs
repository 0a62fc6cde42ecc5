//! Out-of-process transcode worker.
//!
//! The module is loaded on the first request, shared by every request after
//! that, and driven over JSON lines on stdin/stdout.

pub mod gateway;
pub mod init_state;
pub mod progress;
pub mod sink;
pub mod transcoder;
pub mod worker_main;

pub use gateway::{Gateway, GatewayError, RequestOutcome};
pub use init_state::{InitCell, InitPhase};
pub use progress::{ProgressReporter, StageProgress};
pub use sink::ResponseSink;
pub use transcoder::{LoadError, ModuleLoader, TranscodeError, Transcoder};
pub use worker_main::{run_worker, serve, write_response, ServeSummary};
