//! Boundary between the status cache and the remote session core
//!
//! The cache never talks to a socket directly. Everything it needs from the
//! core goes through [`RemoteClient`]: batched and single status fetches, the
//! initial session snapshot, and event subscription. [`crate::client::CoreClient`]
//! implements it over TCP, [`memory::InMemoryCore`] implements it in-process.

pub mod memory;

use crate::proxy::status::{StatusDict, StatusFilter, StatusMap};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use tokio::sync::mpsc;

/// Channel an event subscriber receives core events on
///
/// All kinds a subscriber registers for may share one sender; events are then
/// delivered in the order the transport received them.
pub type EventHandler = mpsc::UnboundedSender<CoreEvent>;

/// Handle returned by [`RemoteClient::subscribe`], used to unsubscribe
pub type SubscriptionId = u64;

/// Event categories the core publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChanged,
    Removed,
    Added,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::StateChanged, EventKind::Removed, EventKind::Added];

    /// Event name as published by the core
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::StateChanged => "SessionStateChangedEvent",
            EventKind::Removed => "SessionRemovedEvent",
            EventKind::Added => "SessionAddedEvent",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Notification pushed by the core, independent of any request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    /// A session changed state; applied to the cache as field `"state"`
    StateChanged { id: String, state: String },
    /// A single status field changed
    FieldChanged {
        id: String,
        field: String,
        value: serde_json::Value,
    },
    Removed { id: String },
    Added {
        id: String,
        #[serde(default)]
        from_state: bool,
    },
}

impl CoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CoreEvent::StateChanged { .. } | CoreEvent::FieldChanged { .. } => EventKind::StateChanged,
            CoreEvent::Removed { .. } => EventKind::Removed,
            CoreEvent::Added { .. } => EventKind::Added,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CoreEvent::StateChanged { id, .. }
            | CoreEvent::FieldChanged { id, .. }
            | CoreEvent::Removed { id }
            | CoreEvent::Added { id, .. } => id,
        }
    }
}

impl Display for CoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreEvent::StateChanged { id, state } => write!(f, "{} state -> {}", id, state),
            CoreEvent::FieldChanged { id, field, .. } => write!(f, "{} field {} changed", id, field),
            CoreEvent::Removed { id } => write!(f, "{} removed", id),
            CoreEvent::Added { id, .. } => write!(f, "{} added", id),
        }
    }
}

/// Remote procedure calls the status cache issues against the session core
///
/// An empty `fields` slice asks the core for every field it knows. With `diff`
/// set the core only returns fields whose value changed since this client last
/// asked for them.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch status for every session matching `filter`
    async fn fetch_status(
        &self,
        filter: &StatusFilter,
        fields: &[String],
        diff: bool,
    ) -> crate::Result<StatusMap>;

    /// Fetch status for one session
    async fn fetch_entity_status(
        &self,
        id: &str,
        fields: &[String],
        diff: bool,
    ) -> crate::Result<StatusDict>;

    /// Ids of every session currently known to the core
    async fn fetch_session_ids(&self) -> crate::Result<Vec<String>>;

    /// Register `handler` for events of `kind`
    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId;

    /// Drop a handler previously registered with [`RemoteClient::subscribe`]
    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId);
}
