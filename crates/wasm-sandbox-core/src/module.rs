//! WebAssembly module compilation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that records a content hash so compiled code can be reused when an evicted
//! instance is loaded again.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, Module};

use wasm_sandbox_common::SandboxError;

/// WebAssembly binary magic number.
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// A compiled core WebAssembly module.
///
/// `CompiledModule` is cheap to clone; clones share the compiled code.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// Hash of the original module bytes.
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile module bytes, accepting either a binary module or WAT text.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::CompilationFailed`] if the bytes are neither a
    /// valid binary module nor valid WAT.
    pub fn compile(engine: &Engine, bytes: &[u8]) -> Result<Self, SandboxError> {
        if bytes.starts_with(WASM_MAGIC) {
            return Self::from_bytes(engine, bytes);
        }

        let text = std::str::from_utf8(bytes).map_err(|_| {
            SandboxError::compilation_failed("Invalid Wasm: not a binary module or WAT text")
        })?;
        Self::from_wat(engine, text)
    }

    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails (e.g., invalid Wasm).
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, SandboxError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            SandboxError::compilation_failed(format!("Core module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Core module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, SandboxError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            SandboxError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Get the content hash of the original module bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Get the inner Wasmtime module.
    pub fn as_module(&self) -> &Module {
        &self.inner
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), SandboxError> {
        if bytes.len() < 8 {
            return Err(SandboxError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if !bytes.starts_with(WASM_MAGIC) {
            return Err(SandboxError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Compute the cache key for module bytes.
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
