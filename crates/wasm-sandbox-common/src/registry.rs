//! Application callbacks for host capability events.
//!
//! The registry is built once by the embedding application and shared with
//! the host bridge; the sandbox only ever reads it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{EventRecord, HostEvent, HostFunctionError};

/// Callback invoked for a host capability event.
pub type Handler =
    Arc<dyn Fn(&EventRecord<HostEvent>) -> Result<String, HostFunctionError> + Send + Sync>;

/// Lookup table from [`HostEvent`] to application callback.
///
/// # Example
///
/// ```ignore
/// let registry = HandlerRegistry::new()
///     .with_handler(HostEvent::Broadcast, |event| {
///         println!("broadcast from {}: {:?}", event.instance_id, event.payload);
///         Ok(String::new())
///     })
///     .with_handler(HostEvent::Get, |_| Ok("value".into()));
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HostEvent, Handler>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback, replacing any previous one for the same kind.
    #[must_use]
    pub fn with_handler<F>(mut self, kind: HostEvent, handler: F) -> Self
    where
        F: Fn(&EventRecord<HostEvent>) -> Result<String, HostFunctionError> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Look up the callback for an event kind.
    pub fn lookup(&self, kind: HostEvent) -> Option<&Handler> {
        self.handlers.get(&kind)
    }

    /// Check whether a callback is registered for an event kind.
    pub fn contains(&self, kind: HostEvent) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Invoke the callback registered for the record's kind.
    ///
    /// # Errors
    ///
    /// Returns [`HostFunctionError::NoHandlerRegistered`] if nothing is
    /// registered, or whatever the callback itself reports.
    pub fn call_handler(&self, event: &EventRecord<HostEvent>) -> Result<String, HostFunctionError> {
        let handler =
            self.lookup(event.event_type)
                .ok_or_else(|| HostFunctionError::NoHandlerRegistered {
                    event: event.event_type.to_string(),
                })?;
        handler(event)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(|k| k.import_name()).collect();
        kinds.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &kinds)
            .finish()
    }
}
