//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is shared by every instance the store holds. It is:
//! - Thread-safe and cheap to clone
//! - Optionally backed by the pooling allocator for fast instantiation
//! - Set up with epoch interruption and optional fuel metering for per-call budgets

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use wasm_sandbox_common::{EngineConfig, SandboxError};

/// Thread-safe WebAssembly engine wrapper.
///
/// This struct wraps a Wasmtime [`Engine`] configured for long-lived guest
/// instances. The engine holds no per-instance state.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Async Support**: host capabilities may await while a guest is suspended
/// - **Epoch Interruption**: deadline enforcement driven by the epoch ticker
/// - **Fuel Metering** (optional): deterministic CPU limiting
/// - **Pooling Allocator** (optional): pre-allocated instance slots
///
/// # Example
///
/// ```ignore
/// use wasm_sandbox_common::EngineConfig;
/// use wasm_sandbox_core::WasmEngine;
///
/// let config = EngineConfig::default();
/// let engine = WasmEngine::new(&config)?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid or the
    /// pooling allocator cannot reserve its slots.
    pub fn new(config: &EngineConfig) -> Result<Self, SandboxError> {
        let mut wasmtime_config = Config::new();

        // Host capabilities that write into guest memory call back into `__new`
        wasmtime_config.async_support(true);

        wasmtime_config.consume_fuel(config.fuel_metering);
        wasmtime_config.epoch_interruption(config.epoch_interruption);

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                pool_slots = config.pool_slots,
                memory_limit_pages = config.memory_limit_pages,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            SandboxError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            epoch_interruption = config.epoch_interruption,
            fuel_metering = config.fuel_metering,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        // Each guest is a single core module with one memory and one table
        pooling.total_core_instances(config.pool_slots);
        pooling.total_memories(config.pool_slots);
        pooling.total_tables(config.pool_slots);

        pooling.max_memory_size(config.memory_limit_bytes());

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    ///
    /// Called by the epoch ticker every `execution.epoch_tick_ms`.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("memory_limit_pages", &self.config.memory_limit_pages)
            .finish_non_exhaustive()
    }
}
