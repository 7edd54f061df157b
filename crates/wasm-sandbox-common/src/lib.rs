//! Common types, errors, and configuration for wasm-sandbox.
//!
//! This crate provides shared functionality used across the wasm-sandbox workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the engine, execution budget, and store
//! - The event model exchanged with guests and the handler registry

pub mod config;
pub mod config_file;
pub mod error;
pub mod events;
pub mod registry;

pub use config::{EngineConfig, ExecutionConfig, ProtocolConfig, SandboxConfig, StoreConfig};
pub use config_file::{ConfigFile, ConfigFileError, LoaderConfig, LoggingConfig, ModuleEntry};
pub use error::{CodecError, HostFunctionError, SandboxError};
pub use events::{CallContext, EventRecord, GuestEvent, HostEvent, now_millis};
pub use registry::{Handler, HandlerRegistry};
