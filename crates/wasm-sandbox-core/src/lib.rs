//! Core Wasmtime runtime for wasm-sandbox.
//!
//! This crate hosts untrusted guest modules and delivers events to them:
//! - [`WasmEngine`]: Configured Wasmtime engine shared by every instance
//! - [`CompiledModule`]: Compiled WebAssembly module wrapper
//! - [`InstanceRunner`]: Compilation cache and instantiation
//! - [`Supervisor`]: Per-call deadline, fuel, and trap classification
//! - [`InstanceStore`]: Bounded, deduplicating cache of live instances
//! - [`codec`]: Guest memory wire formats
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    InstanceStore                        │
//! │  (Shared, thread-safe)                                  │
//! │  - Load deduplication (LoadTicket)                      │
//! │  - LRU eviction and idle sweep                          │
//! │  - Drain-before-close                                   │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │           InstanceRunner + CompiledModule               │
//! │  (Cached by content hash)                               │
//! │  - Pre-compiled machine code                            │
//! │  - Host capabilities via Linker                         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            Store<GuestContext> + Instance               │
//! │  (Per instance id, isolated)                            │
//! │  - Linear memory limit                                  │
//! │  - Epoch deadline and fuel                              │
//! │  - Current call identity                                │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod context;
pub mod engine;
pub mod instance;
pub mod loader;
pub mod memory;
pub mod module;
pub mod store;
pub mod supervisor;
pub mod ticket;

pub use codec::{GuestHeap, GuestMemory, GuestSlice, Status};
pub use context::{GuestContext, create_store};
pub use engine::WasmEngine;
pub use instance::{InFlightGuard, Instance, InstanceRunner};
pub use loader::{FsLoader, ModuleLoader, StaticLoader};
pub use memory::InstanceHeap;
pub use module::CompiledModule;
pub use store::InstanceStore;
pub use supervisor::{EpochTicker, Supervisor};
pub use ticket::{LoadOutcome, LoadTicket};
