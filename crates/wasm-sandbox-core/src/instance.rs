//! Live guest instances.
//!
//! This module provides:
//! - [`Instance`]: one loaded guest with its store, in-flight counter, and
//!   drain notification
//! - [`InstanceRunner`]: compiles (with a content-hash cache) and instantiates
//!   guests against the shared linker

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, instrument};
use wasmtime::{Linker, Store, TypedFunc};

use crate::codec;
use crate::context::{GuestContext, create_store};
use crate::memory::InstanceHeap;
use crate::module::{CompiledModule, compute_hash};
use crate::supervisor::Supervisor;
use crate::WasmEngine;
use wasm_sandbox_common::{EventRecord, GuestEvent, ProtocolConfig, SandboxError};

/// A loaded, callable guest bound to an instance id.
///
/// The store is held behind an async mutex so that calls into one guest are
/// serialized. Once [`Instance::close`] has run the store is gone and every
/// later call fails with [`SandboxError::InstanceClosed`].
pub struct Instance {
    id: String,
    handle: wasmtime::Instance,
    store: Mutex<Option<Store<GuestContext>>>,
    status_prefix: bool,
    last_used: parking_lot::Mutex<Instant>,
    in_flight: AtomicUsize,
    drained: Notify,
    closed_at: parking_lot::Mutex<Option<Instant>>,
}

impl Instance {
    /// Wrap an instantiated guest.
    pub fn new(id: impl Into<String>, handle: wasmtime::Instance, store: Store<GuestContext>) -> Self {
        Self {
            id: id.into(),
            handle,
            store: Mutex::new(Some(store)),
            status_prefix: false,
            last_used: parking_lot::Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            closed_at: parking_lot::Mutex::new(None),
        }
    }

    /// Mark event buffers with the success status code unit.
    #[must_use]
    pub fn with_status_prefix(mut self, status_prefix: bool) -> Self {
        self.status_prefix = status_prefix;
        self
    }

    /// The instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the instance last completed a dispatch.
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// How long the instance has been idle.
    pub fn idle_for(&self) -> Duration {
        self.last_used().elapsed()
    }

    /// Record a successful dispatch.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Number of dispatches currently holding the instance.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Register a dispatch; the returned guard releases it on drop.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            instance: Arc::clone(self),
        }
    }

    /// Wait until no dispatch holds the instance.
    ///
    /// Callers must have removed the instance from the live map first so the
    /// counter can only go down.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Release the guest's store and memory.
    ///
    /// Returns `false` if the instance was already closed.
    pub async fn close(&self) -> bool {
        let store = self.store.lock().await.take();
        let Some(store) = store else {
            return false;
        };
        drop(store);

        *self.closed_at.lock() = Some(Instant::now());
        debug!(instance_id = %self.id, "Instance closed");
        true
    }

    /// Whether the instance has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed_at.lock().is_some()
    }

    /// When the instance was closed.
    pub fn closed_at(&self) -> Option<Instant> {
        *self.closed_at.lock()
    }

    /// Deliver an event to the guest export matching its type.
    ///
    /// The record is written through the guest allocator as a string array
    /// (with a leading `+` when status prefixes are on) and the
    /// export is called with `(ptr, len)` under the supervisor's budget. The
    /// call identity is visible to host capabilities for the duration of the
    /// call.
    #[instrument(skip_all, fields(instance_id = %self.id, export = event.event_type.export_name()))]
    pub async fn invoke(
        &self,
        supervisor: &Supervisor,
        event: &EventRecord<GuestEvent>,
    ) -> Result<(), SandboxError> {
        let export = event.event_type.export_name();

        let mut guard = self.store.lock().await;
        let store = guard
            .as_mut()
            .ok_or_else(|| SandboxError::instance_closed(&self.id))?;

        let func = self
            .handle
            .get_typed_func::<(u32, u32), ()>(&mut *store, export)
            .map_err(|_| SandboxError::missing_export(export))?;

        store.data_mut().begin_call(event.call_context());
        let result = self.call(store, supervisor, func, event).await;
        store.data_mut().end_call();

        result
    }

    async fn call(
        &self,
        store: &mut Store<GuestContext>,
        supervisor: &Supervisor,
        func: TypedFunc<(u32, u32), ()>,
        event: &EventRecord<GuestEvent>,
    ) -> Result<(), SandboxError> {
        supervisor.arm(store)?;

        let slice = {
            let mut heap = InstanceHeap::for_instance(store, &self.handle)?;
            codec::write_string_array(&mut heap, &event.wire_fields(), self.status_prefix)
                .await
                .map_err(|e| supervisor.classify_codec(e))?
        };

        supervisor
            .run(
                event.event_type.export_name(),
                func.call_async(&mut *store, (slice.ptr, slice.len)),
            )
            .await
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Marks a dispatch as in flight on an instance.
#[derive(Debug)]
pub struct InFlightGuard {
    instance: Arc<Instance>,
}

impl InFlightGuard {
    /// The instance this guard holds.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.instance.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.instance.drained.notify_waiters();
        }
    }
}

/// Instance factory.
///
/// This struct owns the shared linker (with every host capability already
/// registered) and a cache of compiled modules keyed by content hash, so a
/// guest that is evicted and loaded again skips compilation. The cache holds
/// at most `engine.max_cached_modules` entries and drops the least recently
/// used one first.
///
/// # Thread Safety
///
/// `InstanceRunner` is thread-safe and can be shared across tasks. Each
/// instance gets its own [`Store`] for isolation.
pub struct InstanceRunner {
    engine: WasmEngine,
    linker: Linker<GuestContext>,
    modules: DashMap<String, CachedModule>,
    status_prefix: bool,
}

struct CachedModule {
    module: CompiledModule,
    last_used: Instant,
}

impl InstanceRunner {
    /// Create a runner that instantiates guests against `linker`.
    pub fn new(engine: WasmEngine, linker: Linker<GuestContext>) -> Self {
        Self {
            engine,
            linker,
            modules: DashMap::new(),
            status_prefix: false,
        }
    }

    /// Apply the guest protocol settings to every instance created.
    #[must_use]
    pub fn with_protocol(mut self, protocol: &ProtocolConfig) -> Self {
        self.status_prefix = protocol.status_prefix;
        self
    }

    /// Get the engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Number of compiled modules held in the cache.
    pub fn cached_modules(&self) -> usize {
        self.modules.len()
    }

    /// Whether a compilation of `bytes` is cached.
    pub fn is_cached(&self, bytes: &[u8]) -> bool {
        self.modules.contains_key(&compute_hash(bytes))
    }

    /// Drop every cached compilation.
    pub fn clear_cache(&self) {
        self.modules.clear();
    }

    /// Compile module bytes, reusing a cached compilation when enabled.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::CompilationFailed`] for invalid modules.
    pub fn compile(&self, bytes: &[u8]) -> Result<CompiledModule, SandboxError> {
        let config = self.engine.config();
        if !config.cache_compiled_modules {
            return CompiledModule::compile(self.engine.inner(), bytes);
        }

        let hash = compute_hash(bytes);
        if let Some(mut cached) = self.modules.get_mut(&hash) {
            debug!(content_hash = %hash, "Compiled module cache hit");
            cached.last_used = Instant::now();
            return Ok(cached.module.clone());
        }

        let module = CompiledModule::compile(self.engine.inner(), bytes)?;

        while self.modules.len() >= config.max_cached_modules {
            let victim = self
                .modules
                .iter()
                .min_by_key(|entry| entry.last_used)
                .map(|entry| entry.key().clone());
            let Some(victim) = victim else {
                break;
            };
            self.modules.remove(&victim);
            debug!(content_hash = %victim, "Compiled module dropped from cache");
        }

        self.modules.insert(
            hash,
            CachedModule {
                module: module.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(module)
    }

    /// Compile and instantiate a guest for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::CompilationFailed`] if the bytes do not compile
    /// or the module's imports cannot be satisfied, or the classified error if
    /// the module's start function fails.
    #[instrument(skip(self, bytes, supervisor), fields(bytes_len = bytes.len()))]
    pub async fn instantiate(
        &self,
        id: &str,
        bytes: &[u8],
        supervisor: &Supervisor,
    ) -> Result<Instance, SandboxError> {
        let start = Instant::now();
        let module = self.compile(bytes)?;

        let mut store = create_store(&self.engine, id);
        supervisor.arm(&mut store)?;

        let handle = self
            .linker
            .instantiate_async(&mut store, module.as_module())
            .await
            .map_err(|e| match e.downcast_ref::<wasmtime::Trap>() {
                Some(_) => supervisor.classify(&e),
                None => SandboxError::compilation_failed(format!("Instantiation failed: {e}")),
            })?;

        info!(
            instance_id = id,
            content_hash = module.content_hash(),
            duration_ms = start.elapsed().as_millis(),
            "Instance created"
        );

        Ok(Instance::new(id, handle, store).with_status_prefix(self.status_prefix))
    }
}

impl std::fmt::Debug for InstanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRunner")
            .field("cached_modules", &self.modules.len())
            .finish_non_exhaustive()
    }
}
