//! Error types for wasm-sandbox.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`SandboxError`]: Top-level errors returned by the instance store
//! - [`HostFunctionError`]: Errors from the handler registry and host bridge
//! - [`CodecError`]: Failures translating data across the guest memory boundary

use std::io;

use thiserror::Error;

/// Top-level sandbox errors.
///
/// These errors represent failures that can occur while resolving, loading,
/// or invoking a guest instance. Every variant is surfaced to the caller of
/// `dispatch`; none of them leave the instance store in an inconsistent state.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The inbound event type is not part of the guest event enumeration.
    #[error("Invalid event type: {code}")]
    InvalidEvent {
        /// The raw event type code that was rejected.
        code: u32,
    },

    /// The module loader failed to produce bytes for an instance.
    #[error("Failed to load instance '{instance_id}': {reason}")]
    LoadFailed {
        /// The instance whose module could not be loaded.
        instance_id: String,
        /// Description of the loader failure.
        reason: String,
    },

    /// WebAssembly compilation or instantiation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The guest module does not export a required function or memory.
    #[error("Missing guest export: {name}")]
    MissingExport {
        /// Name of the missing export.
        name: String,
    },

    /// A read or write against guest linear memory failed.
    #[error("Guest memory fault: {reason}")]
    MemoryFault {
        /// Description of the memory failure.
        reason: String,
    },

    /// Execution exceeded the configured deadline.
    #[error("Execution timeout after {duration_ms}ms")]
    ExecutionTimeout {
        /// The configured deadline in milliseconds.
        duration_ms: u64,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// The instance was released while a caller still held a reference to it.
    #[error("Instance closed: {instance_id}")]
    InstanceClosed {
        /// The instance that has been closed.
        instance_id: String,
    },

    /// The instance store has been shut down.
    #[error("Instance store is closed")]
    StoreClosed,

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the handler registry and host bridge capabilities.
///
/// Capabilities never propagate these into guest code as traps; they are
/// logged and turned into zero values or encoded error strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostFunctionError {
    /// No application callback is registered for the event kind.
    #[error("No handler present for {event} event")]
    NoHandlerRegistered {
        /// Name of the event kind.
        event: String,
    },

    /// The application callback reported a failure.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },
}

/// Failures of the memory codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A guest memory range was outside the linear memory.
    #[error("memory access out of bounds: offset={offset} len={len}")]
    OutOfBounds {
        /// Start of the rejected range.
        offset: u32,
        /// Length of the rejected range.
        len: u32,
    },

    /// The guest does not export a function or memory the codec needs.
    #[error("{name} not exported")]
    MissingExport {
        /// Name of the missing export.
        name: String,
    },

    /// The guest allocator failed or trapped.
    #[error("allocation failed: {reason}")]
    AllocationFailed {
        /// Description of the allocator failure.
        reason: String,
    },

    /// The guest allocator ran past the execution deadline.
    #[error("allocation interrupted: execution deadline reached")]
    Interrupted,

    /// The guest allocator ran out of fuel.
    #[error("allocation interrupted: fuel exhausted")]
    OutOfFuel,

    /// Guest text was not valid UTF-16.
    #[error("invalid UTF-16 string data")]
    InvalidUtf16,

    /// Guest bytes were not valid UTF-8.
    #[error("invalid UTF-8 string data")]
    InvalidUtf8,

    /// An encoded buffer ended before its declared length.
    #[error("buffer truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the declared layout.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// A value does not fit in the 32-bit guest address space.
    #[error("value of {len} bytes exceeds the guest address space")]
    TooLarge {
        /// Size of the oversized value.
        len: usize,
    },
}

impl SandboxError {
    /// Create a new `LoadFailed` error.
    pub fn load_failed(instance_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            instance_id: instance_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `MissingExport` error.
    pub fn missing_export(name: impl Into<String>) -> Self {
        Self::MissingExport { name: name.into() }
    }

    /// Create a new `MemoryFault` error.
    pub fn memory_fault(reason: impl Into<String>) -> Self {
        Self::MemoryFault {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `InstanceClosed` error.
    pub fn instance_closed(instance_id: impl Into<String>) -> Self {
        Self::InstanceClosed {
            instance_id: instance_id.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error came from loading a module.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            Self::LoadFailed { .. } | Self::CompilationFailed { .. }
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted | Self::ExecutionTimeout { .. })
    }
}

// `io::Error` is not `Clone`; a copy keeps its kind and message.
impl Clone for SandboxError {
    fn clone(&self) -> Self {
        match self {
            Self::InvalidEvent { code } => Self::InvalidEvent { code: *code },
            Self::LoadFailed {
                instance_id,
                reason,
            } => Self::load_failed(instance_id.clone(), reason.clone()),
            Self::CompilationFailed { reason } => Self::compilation_failed(reason.clone()),
            Self::MissingExport { name } => Self::missing_export(name.clone()),
            Self::MemoryFault { reason } => Self::memory_fault(reason.clone()),
            Self::ExecutionTimeout { duration_ms } => Self::ExecutionTimeout {
                duration_ms: *duration_ms,
            },
            Self::FuelExhausted => Self::FuelExhausted,
            Self::Trap { message } => Self::trap(message.clone()),
            Self::InstanceClosed { instance_id } => Self::instance_closed(instance_id.clone()),
            Self::StoreClosed => Self::StoreClosed,
            Self::HostFunction(e) => Self::HostFunction(e.clone()),
            Self::InvalidConfig { reason } => Self::invalid_config(reason.clone()),
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl HostFunctionError {
    /// Create a new `Handler` error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

impl CodecError {
    /// Create a new `OutOfBounds` error.
    pub fn out_of_bounds(offset: u32, len: u32) -> Self {
        Self::OutOfBounds { offset, len }
    }

    /// Create a new `MissingExport` error.
    pub fn missing_export(name: impl Into<String>) -> Self {
        Self::MissingExport { name: name.into() }
    }
}

impl From<CodecError> for SandboxError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MissingExport { name } => Self::MissingExport { name },
            CodecError::OutOfFuel => Self::FuelExhausted,
            other => Self::MemoryFault {
                reason: other.to_string(),
            },
        }
    }
}
