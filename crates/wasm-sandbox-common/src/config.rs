//! Configuration structures for wasm-sandbox.
//!
//! This module defines configuration options for various components:
//! - [`SandboxConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, memory, interruption)
//! - [`ExecutionConfig`]: Per-call execution budget (deadline, fuel, loader timeout)
//! - [`StoreConfig`]: Instance cache capacity and idle reclamation
//! - [`ProtocolConfig`]: Guest-visible string conventions

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SandboxError;

/// Size of a WebAssembly page in bytes.
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Top-level sandbox configuration.
///
/// It can be loaded from files (TOML, JSON); every section falls back to its
/// defaults when omitted.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Instance store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Host/guest protocol configuration.
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl SandboxConfig {
    /// Check the configuration for values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.store.max_active_instances == 0 {
            return Err(SandboxError::invalid_config(
                "store.max_active_instances must be at least 1",
            ));
        }
        if self.execution.max_execution_ms == 0 {
            return Err(SandboxError::invalid_config(
                "execution.max_execution_ms must be non-zero",
            ));
        }
        if self.execution.epoch_tick_ms == 0 {
            return Err(SandboxError::invalid_config(
                "execution.epoch_tick_ms must be non-zero",
            ));
        }
        if self.engine.memory_limit_pages == 0 {
            return Err(SandboxError::invalid_config(
                "engine.memory_limit_pages must be non-zero",
            ));
        }
        if self.engine.cache_compiled_modules && self.engine.max_cached_modules == 0 {
            return Err(SandboxError::invalid_config(
                "engine.max_cached_modules must be at least 1 when caching is enabled",
            ));
        }
        if self.engine.pooling_allocator
            && (self.engine.pool_slots as usize) < self.store.max_active_instances
        {
            return Err(SandboxError::invalid_config(format!(
                "engine.pool_slots ({}) is smaller than store.max_active_instances ({})",
                self.engine.pool_slots, self.store.max_active_instances
            )));
        }
        Ok(())
    }
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior shared by every
/// instance the store holds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for instance creation.
    ///
    /// Slots are pre-allocated up front; draining instances keep their slot
    /// until they are closed, so leave headroom above the store capacity.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Number of instance slots in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::pool_slots")]
    pub pool_slots: u32,

    /// Maximum linear memory per instance, in 64 KiB pages.
    #[serde(default = "defaults::memory_limit_pages")]
    pub memory_limit_pages: u32,

    /// Enable epoch-based interruption.
    ///
    /// When enabled, a guest call that outlives its deadline is cancelled by
    /// the engine. When disabled, the overrun is only reported after the call
    /// returns on its own.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Enable fuel metering.
    ///
    /// When enabled, each call is refuelled with `execution.max_fuel`.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Cache compiled modules by content hash.
    ///
    /// Reloading an evicted instance then skips compilation.
    #[serde(default = "defaults::cache_compiled_modules")]
    pub cache_compiled_modules: bool,

    /// Maximum number of compiled modules kept in the cache.
    ///
    /// The least recently used module is dropped first.
    #[serde(default = "defaults::max_cached_modules")]
    pub max_cached_modules: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            pool_slots: defaults::pool_slots(),
            memory_limit_pages: defaults::memory_limit_pages(),
            epoch_interruption: defaults::epoch_interruption(),
            fuel_metering: defaults::fuel_metering(),
            cache_compiled_modules: defaults::cache_compiled_modules(),
            max_cached_modules: defaults::max_cached_modules(),
        }
    }
}

impl EngineConfig {
    /// Maximum linear memory per instance in bytes.
    pub fn memory_limit_bytes(&self) -> usize {
        usize::try_from(u64::from(self.memory_limit_pages) * WASM_PAGE_SIZE).unwrap_or(usize::MAX)
    }
}

/// Per-call execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Deadline for a single guest call in milliseconds.
    #[serde(default = "defaults::max_execution_ms")]
    pub max_execution_ms: u64,

    /// Deadline for a single module loader call in milliseconds.
    #[serde(default = "defaults::fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Fuel granted to each call when fuel metering is enabled.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Interval between engine epoch increments in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_execution_ms: defaults::max_execution_ms(),
            fetch_timeout_ms: defaults::fetch_timeout_ms(),
            max_fuel: defaults::max_fuel(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
        }
    }
}

impl ExecutionConfig {
    /// Get the call deadline as a `Duration`.
    pub fn max_execution(&self) -> Duration {
        Duration::from_millis(self.max_execution_ms)
    }

    /// Get the loader deadline as a `Duration`.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms)
    }
}

/// Instance store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Maximum number of live instances held at once.
    #[serde(default = "defaults::max_active_instances")]
    pub max_active_instances: usize,

    /// Idle time after which an instance is reclaimed, in milliseconds.
    ///
    /// `0` disables idle reclamation.
    #[serde(default)]
    pub max_idle_ms: u64,

    /// Interval between reclamation sweeps, in milliseconds.
    ///
    /// `0` disables idle reclamation.
    #[serde(default)]
    pub cleanup_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_active_instances: defaults::max_active_instances(),
            max_idle_ms: 0,
            cleanup_interval_ms: 0,
        }
    }
}

impl StoreConfig {
    /// Idle threshold and sweep interval, if background reclamation is enabled.
    pub fn reclamation(&self) -> Option<(Duration, Duration)> {
        if self.max_idle_ms == 0 || self.cleanup_interval_ms == 0 {
            return None;
        }
        Some((
            Duration::from_millis(self.max_idle_ms),
            Duration::from_millis(self.cleanup_interval_ms),
        ))
    }
}

/// Host/guest protocol configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Prefix host-written strings with a `+`/`-` status code unit.
    ///
    /// Older guest SDKs inspect the first UTF-16 unit of strings returned by
    /// `get` and `fetch` to tell values from errors.
    #[serde(default)]
    pub status_prefix: bool,
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn pool_slots() -> u32 {
        100
    }

    pub const fn memory_limit_pages() -> u32 {
        10
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn fuel_metering() -> bool {
        false
    }

    pub const fn cache_compiled_modules() -> bool {
        true
    }

    pub const fn max_cached_modules() -> usize {
        50
    }

    pub const fn max_execution_ms() -> u64 {
        5_000
    }

    pub const fn fetch_timeout_ms() -> u64 {
        5_000
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn epoch_tick_ms() -> u64 {
        10
    }

    pub const fn max_active_instances() -> usize {
        25
    }
}
