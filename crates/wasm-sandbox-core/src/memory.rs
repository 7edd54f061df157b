//! Wasmtime-backed guest heap.
//!
//! [`InstanceHeap`] binds an instance's exported `memory` and `__new`
//! allocator to a store context so the codec can read, write, and allocate
//! without knowing about Wasmtime.

use async_trait::async_trait;
use wasmtime::{AsContextMut, Caller, Extern, Memory, Store, StoreContextMut, Trap, TypedFunc};

use crate::codec::{GuestHeap, GuestMemory};
use crate::context::GuestContext;
use wasm_sandbox_common::CodecError;

/// Name of the exported linear memory.
pub const MEMORY_EXPORT: &str = "memory";

/// Name of the exported guest allocator, `(size, type_id) -> ptr`.
pub const ALLOCATOR_EXPORT: &str = "__new";

type Allocator = TypedFunc<(u32, u32), u32>;

/// A guest's memory and allocator, bound to its store.
pub struct InstanceHeap<'a> {
    store: StoreContextMut<'a, GuestContext>,
    memory: Memory,
    allocator: Option<Allocator>,
}

impl<'a> InstanceHeap<'a> {
    /// Bind the heap of the guest calling a host capability.
    ///
    /// Returns `None` if the guest exports no memory, which happens while a
    /// module is still initializing.
    pub fn from_caller(caller: &'a mut Caller<'_, GuestContext>) -> Option<Self> {
        let memory = caller
            .get_export(MEMORY_EXPORT)
            .and_then(Extern::into_memory)?;
        let allocator = caller
            .get_export(ALLOCATOR_EXPORT)
            .and_then(Extern::into_func)
            .and_then(|func| func.typed::<(u32, u32), u32>(&*caller).ok());

        Some(Self {
            store: caller.as_context_mut(),
            memory,
            allocator,
        })
    }

    /// Bind the heap of an instantiated guest.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingExport`] if the guest exports no memory.
    pub fn for_instance(
        store: &'a mut Store<GuestContext>,
        instance: &wasmtime::Instance,
    ) -> Result<Self, CodecError> {
        let memory = instance
            .get_memory(&mut *store, MEMORY_EXPORT)
            .ok_or_else(|| CodecError::missing_export(MEMORY_EXPORT))?;
        let allocator = instance
            .get_typed_func::<(u32, u32), u32>(&mut *store, ALLOCATOR_EXPORT)
            .ok();

        Ok(Self {
            store: store.as_context_mut(),
            memory,
            allocator,
        })
    }

    /// Current size of the guest's linear memory in bytes.
    pub fn size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    /// Whether the guest exports a usable allocator.
    pub fn has_allocator(&self) -> bool {
        self.allocator.is_some()
    }

    /// The store data of the guest.
    pub fn context(&self) -> &GuestContext {
        self.store.data()
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<(), CodecError> {
        let end = offset as usize + len;
        if end > self.size() {
            return Err(CodecError::out_of_bounds(
                offset,
                u32::try_from(len).unwrap_or(u32::MAX),
            ));
        }
        Ok(())
    }
}

impl GuestMemory for InstanceHeap<'_> {
    fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>, CodecError> {
        self.check_range(offset, len as usize)?;

        let mut buf = vec![0; len as usize];
        self.memory
            .read(&self.store, offset as usize, &mut buf)
            .map_err(|_| CodecError::out_of_bounds(offset, len))?;
        Ok(buf)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), CodecError> {
        self.check_range(offset, bytes.len())?;

        self.memory
            .write(&mut self.store, offset as usize, bytes)
            .map_err(|_| {
                CodecError::out_of_bounds(offset, u32::try_from(bytes.len()).unwrap_or(u32::MAX))
            })
    }
}

#[async_trait]
impl GuestHeap for InstanceHeap<'_> {
    async fn alloc(&mut self, size: u32, type_id: u32) -> Result<u32, CodecError> {
        let allocator = self
            .allocator
            .clone()
            .ok_or_else(|| CodecError::missing_export(ALLOCATOR_EXPORT))?;

        allocator
            .call_async(&mut self.store, (size, type_id))
            .await
            .map_err(|e| match e.downcast_ref::<Trap>() {
                Some(Trap::Interrupt) => CodecError::Interrupted,
                Some(Trap::OutOfFuel) => CodecError::OutOfFuel,
                _ => CodecError::AllocationFailed {
                    reason: e.to_string(),
                },
            })
    }
}
