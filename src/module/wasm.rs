//! Transcoding module compiled from WebAssembly.
//!
//! Guest ABI:
//! - exports `memory`, `alloc(len: i32) -> i32` and `transcode(ptr: i32, len: i32) -> i32`
//! - may import `env.progress(current: i64, total: i64)` and
//!   `env.stage_progress(from: i64, to: i64, current: i64, total: i64)`; the
//!   latter maps a stage's own progress into `from..=to` of 100
//! - `transcode` returns a pointer to a 20-byte little-endian record
//!   `[status, data_ptr, data_len, text_ptr, text_len]`. With `status == 0`
//!   the text is the output filename, otherwise it is the error message.
//!
//! Compiling the module is the expensive one-time step. Every request gets a
//! fresh instance, so guests never see each other's memory.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};
use transcode_worker_types::TranscodeOutput;
use wasmtime::{Caller, Engine, Instance, Linker, Memory, Module, Store};

use crate::worker::progress::ProgressReporter;
use crate::worker::transcoder::{LoadError, ModuleLoader, TranscodeError, Transcoder};

const HOST_MODULE: &str = "env";
const PROGRESS_IMPORT: &str = "progress";
const STAGE_PROGRESS_IMPORT: &str = "stage_progress";
const HOST_IMPORTS: [&str; 2] = [PROGRESS_IMPORT, STAGE_PROGRESS_IMPORT];
const REQUIRED_EXPORTS: [&str; 3] = ["memory", "alloc", "transcode"];

const RESULT_RECORD_LEN: usize = 20;
const STATUS_OK: u32 = 0;

/// Where the module bytes come from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    File(PathBuf),
    /// Binary wasm or WAT text held in memory.
    Bytes(Arc<[u8]>),
}

/// Loads and compiles the module on first use.
#[derive(Clone)]
pub struct WasmModuleLoader {
    source: ModuleSource,
    engine: Engine,
}

impl std::fmt::Debug for WasmModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModuleLoader")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl WasmModuleLoader {
    pub fn new(source: ModuleSource) -> Self {
        Self {
            source,
            engine: Engine::default(),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::new(ModuleSource::File(path.into()))
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::new(ModuleSource::Bytes(bytes.into()))
    }
}

impl ModuleLoader for WasmModuleLoader {
    type Module = WasmTranscoder;

    fn load(&self) -> impl Future<Output = Result<WasmTranscoder, LoadError>> + Send {
        let source = self.source.clone();
        let engine = self.engine.clone();
        async move {
            let bytes: Arc<[u8]> = match source {
                ModuleSource::File(path) => {
                    info!("[WASM] Reading module {}", path.display());
                    tokio::fs::read(&path)
                        .await
                        .map_err(|e| LoadError::Read {
                            path: path.display().to_string(),
                            message: e.to_string(),
                        })?
                        .into()
                }
                ModuleSource::Bytes(bytes) => bytes,
            };

            // Compilation is CPU-bound; keep it off the async thread.
            tokio::task::spawn_blocking(move || WasmTranscoder::compile(engine, &bytes))
                .await
                .map_err(|e| LoadError::Compile(format!("compile task failed: {e}")))?
        }
    }
}

/// A compiled module, ready to be instantiated per request.
#[derive(Clone)]
pub struct WasmTranscoder {
    engine: Engine,
    module: Module,
}

impl std::fmt::Debug for WasmTranscoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmTranscoder").finish_non_exhaustive()
    }
}

impl WasmTranscoder {
    /// Compile and check the module against the guest ABI.
    pub fn compile(engine: Engine, bytes: &[u8]) -> Result<Self, LoadError> {
        let started = std::time::Instant::now();
        let module = Module::new(&engine, bytes).map_err(|e| LoadError::Compile(format!("{e:#}")))?;

        for import in module.imports() {
            if import.module() != HOST_MODULE || !HOST_IMPORTS.contains(&import.name()) {
                return Err(LoadError::UnsupportedImport(format!(
                    "{}.{}",
                    import.module(),
                    import.name()
                )));
            }
        }
        for export in REQUIRED_EXPORTS {
            if module.get_export(export).is_none() {
                return Err(LoadError::MissingExport(export.to_string()));
            }
        }

        info!(
            "[WASM] Module compiled in {}ms ({} bytes)",
            started.elapsed().as_millis(),
            bytes.len()
        );
        Ok(Self { engine, module })
    }

    fn run(&self, input: &[u8], progress: ProgressReporter) -> Result<TranscodeOutput, TranscodeError> {
        let mut store = Store::new(&self.engine, GuestState { progress });
        let instance = self.instantiate(&mut store)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| TranscodeError::Abi("`memory` is not a memory export".to_string()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(abi_error)?;
        let transcode = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "transcode")
            .map_err(abi_error)?;

        let input_len = i32::try_from(input.len()).map_err(|_| {
            TranscodeError::Abi(format!("input of {} bytes does not fit the guest", input.len()))
        })?;
        let input_ptr = alloc.call(&mut store, input_len).map_err(trap_error)?;
        memory
            .write(&mut store, guest_offset(input_ptr), input)
            .map_err(|e| TranscodeError::Abi(format!("cannot copy input into guest memory: {e}")))?;

        debug!("[WASM] Calling transcode ({} bytes at {input_ptr:#x})", input.len());
        let record_ptr = transcode
            .call(&mut store, (input_ptr, input_len))
            .map_err(trap_error)?;

        let record = read_guest(&memory, &store, guest_offset(record_ptr), RESULT_RECORD_LEN)?;
        let [status, data_ptr, data_len, text_ptr, text_len] = decode_record(&record);
        let text = read_guest(&memory, &store, text_ptr as usize, text_len as usize)?;
        let text = String::from_utf8(text.into_vec())
            .map_err(|_| TranscodeError::Abi("result text is not UTF-8".to_string()))?;

        if status != STATUS_OK {
            return Err(TranscodeError::Rejected(text));
        }

        let data = read_guest(&memory, &store, data_ptr as usize, data_len as usize)?;
        Ok(TranscodeOutput { filename: text, data })
    }

    fn instantiate(&self, store: &mut Store<GuestState>) -> Result<Instance, TranscodeError> {
        let mut linker: Linker<GuestState> = Linker::new(&self.engine);
        linker
            .func_wrap(
                HOST_MODULE,
                PROGRESS_IMPORT,
                |caller: Caller<'_, GuestState>, current: i64, total: i64| {
                    caller
                        .data()
                        .progress
                        .report(guest_count(current), guest_count(total));
                },
            )
            .map_err(abi_error)?;
        linker
            .func_wrap(
                HOST_MODULE,
                STAGE_PROGRESS_IMPORT,
                |caller: Caller<'_, GuestState>, from: i64, to: i64, current: i64, total: i64| {
                    caller
                        .data()
                        .progress
                        .stage(guest_count(from), guest_count(to))
                        .report(guest_count(current), guest_count(total));
                },
            )
            .map_err(abi_error)?;
        linker.instantiate(store, &self.module).map_err(trap_error)
    }
}

impl Transcoder for WasmTranscoder {
    fn transcode(
        &self,
        input: Box<[u8]>,
        progress: ProgressReporter,
    ) -> impl Future<Output = Result<TranscodeOutput, TranscodeError>> + Send {
        let transcoder = self.clone();
        async move {
            tokio::task::spawn_blocking(move || transcoder.run(&input, progress))
                .await
                .map_err(|e| TranscodeError::Task(e.to_string()))?
        }
    }
}

/// Per-instance host state reachable from imported functions.
struct GuestState {
    progress: ProgressReporter,
}

/// Negative counts from the guest are treated as zero.
fn guest_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn guest_offset(ptr: i32) -> usize {
    // Guest pointers are unsigned 32-bit offsets.
    ptr as u32 as usize
}

fn read_guest(
    memory: &Memory,
    store: &Store<GuestState>,
    offset: usize,
    len: usize,
) -> Result<Box<[u8]>, TranscodeError> {
    // Bounds first: `len` comes from the guest and may be anything.
    offset
        .checked_add(len)
        .and_then(|end| memory.data(store).get(offset..end))
        .map(Box::from)
        .ok_or_else(|| {
            TranscodeError::Abi(format!(
                "guest range {offset:#x}..{:#x} is out of bounds",
                offset.saturating_add(len)
            ))
        })
}

fn decode_record(record: &[u8]) -> [u32; 5] {
    let mut fields = [0u32; 5];
    for (field, chunk) in fields.iter_mut().zip(record.chunks_exact(4)) {
        *field = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    fields
}

fn abi_error(err: wasmtime::Error) -> TranscodeError {
    TranscodeError::Abi(format!("{err:#}"))
}

fn trap_error(err: wasmtime::Error) -> TranscodeError {
    TranscodeError::Trap(format!("{err:#}"))
}
