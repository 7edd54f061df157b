//! Guest diagnostics forwarded to `tracing`.
//!
//! Guest `log` and `debug` lines, and `abort` reports, are emitted as host
//! log events tagged with the calling instance so they can be filtered with
//! `RUST_LOG` like any other runtime output. The registry still receives
//! `log`/`debug` events; this is in addition to it.

use tracing::{debug, error, info};

use wasm_sandbox_common::{CallContext, HostEvent};

/// Level of a guest log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLogLevel {
    Debug,
    Info,
}

impl GuestLogLevel {
    /// The level a capability logs at, if it is a logging capability.
    pub fn from_event(kind: HostEvent) -> Option<Self> {
        match kind {
            HostEvent::Log => Some(Self::Info),
            HostEvent::Debug => Some(Self::Debug),
            _ => None,
        }
    }
}

/// Emits guest diagnostics through `tracing`.
pub struct LoggingHost;

impl LoggingHost {
    /// Emit a guest log line.
    pub fn log(ctx: &CallContext, level: GuestLogLevel, message: &str) {
        let instance_id = ctx.instance_id.as_str();
        let room_id = ctx.room_id.as_str();

        match level {
            GuestLogLevel::Debug => debug!(instance_id, room_id, guest_log = true, "{}", message),
            GuestLogLevel::Info => info!(instance_id, room_id, guest_log = true, "{}", message),
        }
    }

    /// Report a guest abort.
    pub fn abort(ctx: &CallContext, message: &str, file: &str, line: u32, column: u32) {
        error!(
            instance_id = ctx.instance_id.as_str(),
            file,
            line,
            column,
            "Guest aborted: {}",
            message
        );
    }
}
