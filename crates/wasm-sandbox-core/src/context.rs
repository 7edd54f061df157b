//! Per-instance store data and store creation.
//!
//! This module provides:
//! - [`GuestContext`]: state owned by an instance's Wasmtime store and visible
//!   to host capabilities through [`wasmtime::Caller`]
//! - [`create_store`]: builds a store with memory limits and deadline traps

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};

use crate::WasmEngine;
use wasm_sandbox_common::CallContext;

/// Store data for one guest instance.
///
/// Unlike a per-request context, a `GuestContext` lives as long as its
/// instance. The call identity is swapped in and out around every guest call
/// so capabilities can attribute the events they raise.
pub struct GuestContext {
    /// The instance this store belongs to.
    instance_id: String,

    /// Identity of the call in progress, if any.
    call: Option<CallContext>,

    /// Memory and table limits enforced by the store.
    limits: StoreLimits,
}

impl GuestContext {
    /// Create a context for the given instance.
    pub fn new(instance_id: impl Into<String>, limits: StoreLimits) -> Self {
        Self {
            instance_id: instance_id.into(),
            call: None,
            limits,
        }
    }

    /// The instance this store belongs to.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Install the identity of the call about to run.
    pub fn begin_call(&mut self, call: CallContext) {
        self.call = Some(call);
    }

    /// Clear the identity of the finished call.
    pub fn end_call(&mut self) -> Option<CallContext> {
        self.call.take()
    }

    /// Whether a guest call is in progress.
    pub fn in_call(&self) -> bool {
        self.call.is_some()
    }

    /// Identity of the current caller.
    ///
    /// Outside a dispatch (for example while a start function runs during
    /// instantiation) only the instance id is known.
    pub fn call_context(&self) -> CallContext {
        self.call
            .clone()
            .unwrap_or_else(|| CallContext::for_instance(self.instance_id.clone()))
    }
}

impl std::fmt::Debug for GuestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestContext")
            .field("instance_id", &self.instance_id)
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

/// Create a new Wasmtime store for an instance.
///
/// The store enforces the engine's memory page limit and traps (rather than
/// yields) when its epoch deadline passes. Fuel and the deadline itself are
/// set by the supervisor before each call.
pub fn create_store(engine: &WasmEngine, instance_id: &str) -> Store<GuestContext> {
    let limits = StoreLimitsBuilder::new()
        .memory_size(engine.config().memory_limit_bytes())
        .instances(1)
        .build();

    let mut store = Store::new(engine.inner(), GuestContext::new(instance_id, limits));
    store.limiter(|ctx| &mut ctx.limits);

    if engine.config().epoch_interruption {
        store.epoch_deadline_trap();
    }

    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_sandbox_common::{EngineConfig, EventRecord, GuestEvent};

    #[test]
    fn test_call_context_lifecycle() {
        let mut ctx = GuestContext::new("mod-a", StoreLimits::default());
        assert!(!ctx.in_call());
        assert_eq!(ctx.call_context(), CallContext::for_instance("mod-a"));

        let record = EventRecord::new("conn", "room", "mod-a", GuestEvent::OnJoin, vec![]);
        ctx.begin_call(record.call_context());
        assert!(ctx.in_call());
        assert_eq!(ctx.call_context().connection_id, "conn");
        assert_eq!(ctx.call_context().room_id, "room");

        let finished = ctx.end_call().unwrap();
        assert_eq!(finished.instance_id, "mod-a");
        assert!(!ctx.in_call());
    }

    #[test]
    fn test_store_creation() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let store = create_store(&engine, "mod-a");

        assert_eq!(store.data().instance_id(), "mod-a");
        assert!(!store.data().in_call());
    }

    #[test]
    fn test_memory_limit_enforced() {
        let engine = WasmEngine::new(&EngineConfig {
            memory_limit_pages: 2,
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap();
        let mut store = create_store(&engine, "mod-a");

        let memory_type = wasmtime::MemoryType::new(1, None);
        let memory = tokio_test::block_on(wasmtime::Memory::new_async(&mut store, memory_type))
            .unwrap();

        assert!(tokio_test::block_on(memory.grow_async(&mut store, 1)).is_ok());
        assert!(tokio_test::block_on(memory.grow_async(&mut store, 1)).is_err());
    }
}
