//! Host capabilities imported by guests from the `env` module.
//!
//! Every capability is a thin adapter between guest memory and the
//! application's [`HandlerRegistry`]:
//!
//! | Import        | Signature                                  | Result            |
//! |---------------|--------------------------------------------|-------------------|
//! | `abort`       | `(msg, file, line, column)`                | logged only       |
//! | `broadcast`   | `(ptr, len)`                               | none              |
//! | `set`         | `(key_ptr, key_len, val_ptr, val_len)`     | none              |
//! | `get`         | `(key_ptr, key_len) -> ptr`                | guest string or 0 |
//! | `log`         | `(ptr, len)`                               | none              |
//! | `debug`       | `(ptr, len)`                               | none              |
//! | `getUsers`    | `() -> ptr`                                | string array or 0 |
//! | `sendMessage` | `(user_ptr, user_len, msg_ptr, msg_len)`   | none              |
//! | `fetch`       | `(url, url_len, method, method_len, body, body_len) -> ptr` | guest string or 0 |
//!
//! # Memory Protocol
//!
//! Arguments are raw UTF-8 byte ranges. Returned strings are managed guest
//! strings allocated through the guest's `__new` export; the returned
//! pointer is the payload pointer.
//!
//! Capabilities never trap. Any failure (no memory, unreadable argument,
//! handler error, failed write) is logged and turned into the capability's
//! zero value. A guest without a `memory` export gets no registry calls at
//! all. Caller identity always comes from the [`CallContext`] installed by
//! the store, never from guest arguments.
//!
//! [`CallContext`]: wasm_sandbox_common::CallContext

use std::sync::Arc;

use tracing::{debug, warn};
use wasmtime::{Caller, Linker};

use wasm_sandbox_common::{
    HandlerRegistry, HostEvent, HostFunctionError, ProtocolConfig, SandboxError,
};
use wasm_sandbox_core::codec::{self, Status};
use wasm_sandbox_core::{GuestContext, InstanceHeap};

use crate::logging::{GuestLogLevel, LoggingHost};

/// Module name guests import capabilities from.
pub const HOST_MODULE: &str = "env";

/// Host capability set bound to one handler registry.
#[derive(Debug, Clone)]
pub struct HostBridge {
    registry: Arc<HandlerRegistry>,
    status_prefix: bool,
}

impl HostBridge {
    /// Create a bridge forwarding to `registry`.
    pub fn new(registry: Arc<HandlerRegistry>, protocol: &ProtocolConfig) -> Self {
        Self {
            registry,
            status_prefix: protocol.status_prefix,
        }
    }

    /// Register every capability on `linker`.
    ///
    /// # Errors
    ///
    /// Returns an error if a capability is already defined on the linker.
    pub fn register(&self, linker: &mut Linker<GuestContext>) -> Result<(), SandboxError> {
        register_abort(linker)?;
        self.register_text(linker, HostEvent::Broadcast)?;
        self.register_text(linker, HostEvent::Log)?;
        self.register_text(linker, HostEvent::Debug)?;
        self.register_pair(linker, HostEvent::Set)?;
        self.register_pair(linker, HostEvent::SendMessage)?;
        self.register_get(linker)?;
        self.register_get_users(linker)?;
        self.register_fetch(linker)?;
        Ok(())
    }

    /// `(ptr, len)` capabilities forwarding a single text field.
    fn register_text(
        &self,
        linker: &mut Linker<GuestContext>,
        kind: HostEvent,
    ) -> Result<(), SandboxError> {
        let registry = Arc::clone(&self.registry);
        let level = GuestLogLevel::from_event(kind);

        linker
            .func_wrap(
                HOST_MODULE,
                kind.import_name(),
                move |mut caller: Caller<'_, GuestContext>, ptr: u32, len: u32| {
                    let Some(heap) = InstanceHeap::from_caller(&mut caller) else {
                        debug!(capability = %kind, "Guest has no memory; skipping");
                        return;
                    };
                    let Some(payload) = read_args(&heap, kind, &[(ptr, len)]) else {
                        return;
                    };

                    let ctx = heap.context().call_context();
                    if let Some(level) = level {
                        LoggingHost::log(&ctx, level, &payload[0]);
                    }
                    let _ = forward(&registry, &ctx, kind, payload);
                },
            )
            .map_err(|e| registration_failed(kind, &e))?;

        Ok(())
    }

    /// `(ptr, len, ptr, len)` capabilities forwarding two text fields.
    fn register_pair(
        &self,
        linker: &mut Linker<GuestContext>,
        kind: HostEvent,
    ) -> Result<(), SandboxError> {
        let registry = Arc::clone(&self.registry);

        linker
            .func_wrap(
                HOST_MODULE,
                kind.import_name(),
                move |mut caller: Caller<'_, GuestContext>,
                      first_ptr: u32,
                      first_len: u32,
                      second_ptr: u32,
                      second_len: u32| {
                    let Some(heap) = InstanceHeap::from_caller(&mut caller) else {
                        debug!(capability = %kind, "Guest has no memory; skipping");
                        return;
                    };
                    let ranges = [(first_ptr, first_len), (second_ptr, second_len)];
                    let Some(payload) = read_args(&heap, kind, &ranges) else {
                        return;
                    };

                    let _ = forward(&registry, &heap.context().call_context(), kind, payload);
                },
            )
            .map_err(|e| registration_failed(kind, &e))?;

        Ok(())
    }

    fn register_get(&self, linker: &mut Linker<GuestContext>) -> Result<(), SandboxError> {
        let registry = Arc::clone(&self.registry);
        let status_prefix = self.status_prefix;

        linker
            .func_wrap_async(
                HOST_MODULE,
                HostEvent::Get.import_name(),
                move |mut caller: Caller<'_, GuestContext>, (key_ptr, key_len): (u32, u32)| {
                    let registry = Arc::clone(&registry);
                    Box::new(async move {
                        let Some(mut heap) = InstanceHeap::from_caller(&mut caller) else {
                            return 0;
                        };
                        let Some(payload) = read_args(&heap, HostEvent::Get, &[(key_ptr, key_len)])
                        else {
                            return 0;
                        };

                        let ctx = heap.context().call_context();
                        let Ok(value) = forward(&registry, &ctx, HostEvent::Get, payload) else {
                            return 0;
                        };

                        codec::write_guest_string(&mut heap, &value, Status::Success, status_prefix)
                            .await
                            .map_or_else(|e| write_failed(HostEvent::Get, &e), |slice| slice.ptr)
                    })
                },
            )
            .map_err(|e| registration_failed(HostEvent::Get, &e))?;

        Ok(())
    }

    fn register_get_users(&self, linker: &mut Linker<GuestContext>) -> Result<(), SandboxError> {
        let registry = Arc::clone(&self.registry);
        let status_prefix = self.status_prefix;

        linker
            .func_wrap_async(
                HOST_MODULE,
                HostEvent::GetUsers.import_name(),
                move |mut caller: Caller<'_, GuestContext>, (): ()| {
                    let registry = Arc::clone(&registry);
                    Box::new(async move {
                        let Some(mut heap) = InstanceHeap::from_caller(&mut caller) else {
                            return 0;
                        };

                        let ctx = heap.context().call_context();
                        let users = forward(&registry, &ctx, HostEvent::GetUsers, Vec::new())
                            .map(|raw| parse_users(&raw))
                            .unwrap_or_default();

                        codec::write_string_array(&mut heap, &users, status_prefix)
                            .await
                            .map_or_else(
                                |e| write_failed(HostEvent::GetUsers, &e),
                                |slice| slice.ptr,
                            )
                    })
                },
            )
            .map_err(|e| registration_failed(HostEvent::GetUsers, &e))?;

        Ok(())
    }

    fn register_fetch(&self, linker: &mut Linker<GuestContext>) -> Result<(), SandboxError> {
        let registry = Arc::clone(&self.registry);
        let status_prefix = self.status_prefix;

        linker
            .func_wrap_async(
                HOST_MODULE,
                HostEvent::Fetch.import_name(),
                move |mut caller: Caller<'_, GuestContext>,
                      (url_ptr, url_len, method_ptr, method_len, body_ptr, body_len): (
                    u32,
                    u32,
                    u32,
                    u32,
                    u32,
                    u32,
                )| {
                    let registry = Arc::clone(&registry);
                    Box::new(async move {
                        let Some(mut heap) = InstanceHeap::from_caller(&mut caller) else {
                            return 0;
                        };
                        let ranges = [
                            (url_ptr, url_len),
                            (method_ptr, method_len),
                            (body_ptr, body_len),
                        ];
                        let Some(payload) = read_args(&heap, HostEvent::Fetch, &ranges) else {
                            return 0;
                        };

                        let ctx = heap.context().call_context();
                        let written = match forward(&registry, &ctx, HostEvent::Fetch, payload) {
                            Ok(body) => {
                                codec::write_guest_string(
                                    &mut heap,
                                    &body,
                                    Status::Success,
                                    status_prefix,
                                )
                                .await
                            }
                            Err(e) => codec::write_guest_error(&mut heap, &e, status_prefix).await,
                        };

                        written.map_or_else(|e| write_failed(HostEvent::Fetch, &e), |slice| slice.ptr)
                    })
                },
            )
            .map_err(|e| registration_failed(HostEvent::Fetch, &e))?;

        Ok(())
    }
}

/// Register every capability on `linker`, forwarding to `registry`.
///
/// # Errors
///
/// Returns an error if a capability is already defined on the linker.
pub fn register_all(
    linker: &mut Linker<GuestContext>,
    registry: Arc<HandlerRegistry>,
    protocol: &ProtocolConfig,
) -> Result<(), SandboxError> {
    HostBridge::new(registry, protocol).register(linker)
}

/// `abort(msg, file, line, column)`: diagnostics only, never reaches the registry.
fn register_abort(linker: &mut Linker<GuestContext>) -> Result<(), SandboxError> {
    linker
        .func_wrap(
            HOST_MODULE,
            HostEvent::Abort.import_name(),
            |mut caller: Caller<'_, GuestContext>,
             message_ptr: u32,
             file_ptr: u32,
             line: u32,
             column: u32| {
                let Some(heap) = InstanceHeap::from_caller(&mut caller) else {
                    return;
                };

                let message = codec::decode_guest_string_lossy(&heap, message_ptr);
                let file = codec::decode_guest_string_lossy(&heap, file_ptr);
                LoggingHost::abort(&heap.context().call_context(), &message, &file, line, column);
            },
        )
        .map_err(|e| registration_failed(HostEvent::Abort, &e))?;

    Ok(())
}

/// Read UTF-8 argument ranges, logging and giving up on the first bad one.
fn read_args(heap: &InstanceHeap<'_>, kind: HostEvent, ranges: &[(u32, u32)]) -> Option<Vec<String>> {
    ranges
        .iter()
        .map(|&(ptr, len)| codec::read_utf8(heap, ptr, len))
        .collect::<Result<Vec<_>, _>>()
        .inspect_err(|e| warn!(capability = %kind, error = %e, "Failed to read guest argument"))
        .ok()
}

fn forward(
    registry: &HandlerRegistry,
    ctx: &wasm_sandbox_common::CallContext,
    kind: HostEvent,
    payload: Vec<String>,
) -> Result<String, HostFunctionError> {
    let record = ctx.record(kind, payload);
    registry.call_handler(&record).inspect_err(|e| {
        warn!(
            capability = %kind,
            instance_id = ctx.instance_id.as_str(),
            error = %e,
            "Host capability handler failed"
        );
    })
}

/// Decode the `getUsers` handler result, a JSON array of user ids.
fn parse_users(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        debug!(error = %e, "getUsers handler returned no user list");
        Vec::new()
    })
}

fn write_failed(kind: HostEvent, error: &wasm_sandbox_common::CodecError) -> u32 {
    warn!(capability = %kind, error = %error, "Failed to write result into guest memory");
    0
}

fn registration_failed(kind: HostEvent, error: &wasmtime::Error) -> SandboxError {
    SandboxError::invalid_config(format!("Failed to register {kind} function: {error}"))
}
