//! Host capabilities for wasm-sandbox guests.
//!
//! Guests import a fixed set of functions from the `env` module. Each one
//! reads its arguments out of guest memory, builds an event record
//! attributed to the current caller, and hands it to the application's
//! [`HandlerRegistry`]. Some write a result back into guest memory.
//!
//! # Modules
//!
//! - [`bridge`]: Capability registration on a Wasmtime linker
//! - [`logging`]: Guest diagnostics forwarded to `tracing`
//!
//! # Error Model
//!
//! Capabilities never trap. Failures are logged and the guest sees a zero
//! pointer (or, for `fetch`, an error string).

use std::sync::Arc;

use wasmtime::Linker;

use wasm_sandbox_common::{HandlerRegistry, SandboxConfig, SandboxError};
use wasm_sandbox_core::{InstanceStore, ModuleLoader, WasmEngine};

pub mod bridge;
pub mod logging;

pub use bridge::{HOST_MODULE, HostBridge, register_all};
pub use logging::{GuestLogLevel, LoggingHost};

/// Build an instance store whose guests can call every host capability.
///
/// Must be called inside a Tokio runtime when idle reclamation is enabled.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the engine cannot be
/// created.
pub fn create_instance_store(
    config: &SandboxConfig,
    loader: Arc<dyn ModuleLoader>,
    registry: Arc<HandlerRegistry>,
) -> Result<InstanceStore, SandboxError> {
    config.validate()?;

    let engine = WasmEngine::new(&config.engine)?;
    let mut linker = Linker::new(engine.inner());
    register_all(&mut linker, registry, &config.protocol)?;

    InstanceStore::new(engine, linker, loader, config)
}
