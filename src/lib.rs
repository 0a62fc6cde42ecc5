//! Transcoding worker: runs a WebAssembly transcoding module behind a
//! message gateway that initializes the module once, on first use, and
//! relays progress, results and errors back to the parent process.

pub mod config;
pub mod logger;
pub mod module;
pub mod worker;

pub use transcode_worker_types as types;
