//! Concrete processing modules the worker can load at runtime.

pub mod wasm;

pub use wasm::{ModuleSource, WasmModuleLoader, WasmTranscoder};
