//! Event model shared by the host and its guests.
//!
//! - [`GuestEvent`]: inbound room events delivered into a guest export
//! - [`HostEvent`]: capability calls a guest makes back into the host
//! - [`EventRecord`]: the canonical cross-boundary message
//! - [`CallContext`]: identity of the guest call currently in progress

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::SandboxError;

/// Inbound events delivered to a guest module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuestEvent {
    /// A connection sent a message to the room.
    OnMessage,
    /// A connection joined the room.
    OnJoin,
    /// A connection left the room.
    OnLeave,
}

impl GuestEvent {
    /// Every guest event, in code order.
    pub const ALL: [GuestEvent; 3] = [Self::OnMessage, Self::OnJoin, Self::OnLeave];

    /// Wire code of this event.
    pub const fn code(self) -> u32 {
        match self {
            Self::OnMessage => 0,
            Self::OnJoin => 1,
            Self::OnLeave => 2,
        }
    }

    /// Name of the guest export that handles this event.
    pub const fn export_name(self) -> &'static str {
        match self {
            Self::OnMessage => "__onMessage",
            Self::OnJoin => "__onJoin",
            Self::OnLeave => "__onLeave",
        }
    }
}

impl TryFrom<u32> for GuestEvent {
    type Error = SandboxError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|event| event.code() == code)
            .ok_or(SandboxError::InvalidEvent { code })
    }
}

impl From<GuestEvent> for u32 {
    fn from(event: GuestEvent) -> Self {
        event.code()
    }
}

impl fmt::Display for GuestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_name())
    }
}

/// Capability calls made by guest code into the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostEvent {
    Abort,
    Broadcast,
    Set,
    Get,
    Log,
    Debug,
    GetUsers,
    SendMessage,
    Fetch,
}

impl HostEvent {
    /// Every host event.
    pub const ALL: [HostEvent; 9] = [
        Self::Abort,
        Self::Broadcast,
        Self::Set,
        Self::Get,
        Self::Log,
        Self::Debug,
        Self::GetUsers,
        Self::SendMessage,
        Self::Fetch,
    ];

    /// Name under which the capability is imported from the `env` module.
    pub const fn import_name(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Broadcast => "broadcast",
            Self::Set => "set",
            Self::Get => "get",
            Self::Log => "log",
            Self::Debug => "debug",
            Self::GetUsers => "getUsers",
            Self::SendMessage => "sendMessage",
            Self::Fetch => "fetch",
        }
    }
}

impl fmt::Display for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.import_name())
    }
}

/// Canonical message exchanged across the host/guest boundary.
///
/// `K` is the event kind: the raw `u32` code for unvalidated inbound events,
/// [`GuestEvent`] once validated, and [`HostEvent`] for capability calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord<K> {
    /// The unique ID of the connection that caused the event.
    pub connection_id: String,

    /// The room the event belongs to. Empty when the connection is not in a room.
    pub room_id: String,

    /// The instance the event is routed to.
    pub instance_id: String,

    /// The kind of event.
    pub event_type: K,

    /// Ordered payload fields.
    pub payload: Vec<String>,

    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl<K> EventRecord<K> {
    /// Build a record stamped with the current time.
    pub fn new(
        connection_id: impl Into<String>,
        room_id: impl Into<String>,
        instance_id: impl Into<String>,
        event_type: K,
        payload: Vec<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            room_id: room_id.into(),
            instance_id: instance_id.into(),
            event_type,
            payload,
            timestamp: now_millis(),
        }
    }

    /// Replace the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Positional fields as the guest decodes them:
    /// `[connection_id, room_id, timestamp, payload...]`.
    pub fn wire_fields(&self) -> Vec<String> {
        let mut fields = Vec::with_capacity(3 + self.payload.len());
        fields.push(self.connection_id.clone());
        fields.push(self.room_id.clone());
        fields.push(self.timestamp.to_string());
        fields.extend(self.payload.iter().cloned());
        fields
    }

    /// Identity of the caller this record describes.
    pub fn call_context(&self) -> CallContext {
        CallContext {
            connection_id: self.connection_id.clone(),
            room_id: self.room_id.clone(),
            instance_id: self.instance_id.clone(),
        }
    }
}

impl EventRecord<u32> {
    /// Validate the raw event code against [`GuestEvent`].
    pub fn validate(self) -> Result<EventRecord<GuestEvent>, SandboxError> {
        let event_type = GuestEvent::try_from(self.event_type)?;
        Ok(EventRecord {
            connection_id: self.connection_id,
            room_id: self.room_id,
            instance_id: self.instance_id,
            event_type,
            payload: self.payload,
            timestamp: self.timestamp,
        })
    }
}

impl From<EventRecord<GuestEvent>> for EventRecord<u32> {
    fn from(record: EventRecord<GuestEvent>) -> Self {
        Self {
            connection_id: record.connection_id,
            room_id: record.room_id,
            instance_id: record.instance_id,
            event_type: record.event_type.code(),
            payload: record.payload,
            timestamp: record.timestamp,
        }
    }
}

/// Identity of the guest call in progress.
///
/// The supervisor installs one before every call into a guest so that host
/// capabilities can attribute the events they raise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub connection_id: String,
    pub room_id: String,
    pub instance_id: String,
}

impl CallContext {
    /// Context for host calls made outside any dispatch (e.g. during start-up).
    pub fn for_instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    /// Build a capability record attributed to this caller.
    pub fn record(&self, kind: HostEvent, payload: Vec<String>) -> EventRecord<HostEvent> {
        EventRecord::new(
            self.connection_id.clone(),
            self.room_id.clone(),
            self.instance_id.clone(),
            kind,
            payload,
        )
    }
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}
