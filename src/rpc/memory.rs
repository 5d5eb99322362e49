//! In-process session core
//!
//! Holds session status in memory and answers [`RemoteClient`] calls the way
//! the remote core does, including filter evaluation and diff tracking. Every
//! call is recorded so callers can assert how often the core was asked. Calls
//! can be made to fail per session, or held back until released.

use crate::proxy::status::{StatusDict, StatusFilter, StatusMap};
use crate::rpc::{CoreEvent, EventHandler, EventKind, RemoteClient, SubscriptionId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Derived state matching sessions that currently move data
pub const ACTIVE_STATE: &str = "Active";

/// A call received by [`InMemoryCore`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Status {
        filter: StatusFilter,
        fields: Vec<String>,
        diff: bool,
    },
    EntityStatus {
        id: String,
        fields: Vec<String>,
        diff: bool,
    },
    SessionIds,
}

#[derive(Default)]
struct CoreState {
    sessions: BTreeMap<String, StatusDict>,
    /// values last handed out, per session
    reported: HashMap<String, StatusDict>,
    calls: Vec<RecordedCall>,
    failing: HashSet<String>,
    offline: bool,
    subscribers: HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>,
}

impl CoreState {
    fn check_failures<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> crate::Result<()> {
        if self.offline {
            return Err("core unreachable".into());
        }
        for id in ids {
            if self.failing.contains(id) {
                return Err(format!("status of session {} unavailable", id).into());
            }
        }
        Ok(())
    }

    fn matches(&self, status: &StatusDict, filter: &StatusFilter) -> bool {
        if let Some(state) = &filter.state {
            let matched = if state == ACTIVE_STATE {
                is_active(status)
            } else {
                status.get("state").and_then(Value::as_str) == Some(state.as_str())
            };
            if !matched {
                return false;
            }
        }
        filter
            .extra
            .iter()
            .all(|(field, expected)| status.get(field) == Some(expected))
    }

    fn select(&self, status: &StatusDict, fields: &[String]) -> StatusDict {
        if fields.is_empty() {
            return status.clone();
        }
        fields
            .iter()
            .filter_map(|field| status.get(field).map(|v| (field.clone(), v.clone())))
            .collect()
    }

    /// Requested fields of a session, reduced to changes when `diff` is set
    ///
    /// Every report becomes the baseline for the next diff request.
    fn report(&mut self, id: &str, fields: &[String], diff: bool) -> Option<StatusDict> {
        let status = self.sessions.get(id)?;
        let selected = self.select(status, fields);
        let reported = self.reported.entry(id.to_string()).or_default();
        if !diff {
            reported.extend(selected.clone());
            return Some(selected);
        }

        let changed: StatusDict = selected
            .into_iter()
            .filter(|(field, value)| reported.get(field) != Some(value))
            .collect();
        for (field, value) in &changed {
            reported.insert(field.clone(), value.clone());
        }
        Some(changed)
    }

    fn emit(&mut self, event: CoreEvent) {
        if let Some(handlers) = self.subscribers.get_mut(&event.kind()) {
            handlers.retain(|(_, handler)| handler.send(event.clone()).is_ok());
        }
    }
}

fn is_active(status: &StatusDict) -> bool {
    ["download_rate", "upload_rate"]
        .iter()
        .any(|field| status.get(*field).and_then(Value::as_f64).is_some_and(|rate| rate > 0.0))
}

pub struct InMemoryCore {
    state: Mutex<CoreState>,
    next_subscription: AtomicU64,
    /// responses are only released while this is open
    gate: watch::Sender<bool>,
}

impl InMemoryCore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoreState::default()),
            next_subscription: AtomicU64::new(1),
            gate: watch::Sender::new(true),
        }
    }

    pub fn with_sessions<I>(sessions: I) -> Self
    where
        I: IntoIterator<Item = (String, StatusDict)>,
    {
        let core = Self::new();
        core.state().sessions.extend(sessions);
        core
    }

    fn state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a session and publish the added event
    pub fn add_session(&self, id: &str, status: StatusDict) {
        let mut state = self.state();
        state.sessions.insert(id.to_string(), status);
        state.emit(CoreEvent::Added {
            id: id.to_string(),
            from_state: false,
        });
    }

    /// Remove a session and publish the removed event
    pub fn remove_session(&self, id: &str) -> bool {
        let mut state = self.state();
        state.reported.remove(id);
        let removed = state.sessions.remove(id).is_some();
        if removed {
            state.emit(CoreEvent::Removed { id: id.to_string() });
        }
        removed
    }

    /// Change a field silently, as the core does for rates and progress
    pub fn set_field(&self, id: &str, field: &str, value: Value) {
        if let Some(status) = self.state().sessions.get_mut(id) {
            status.insert(field.to_string(), value);
        }
    }

    /// Change a session's state and publish the state changed event
    pub fn set_state(&self, id: &str, new_state: &str) {
        let mut state = self.state();
        let Some(status) = state.sessions.get_mut(id) else {
            return;
        };
        status.insert("state".to_string(), Value::String(new_state.to_string()));
        state.emit(CoreEvent::StateChanged {
            id: id.to_string(),
            state: new_state.to_string(),
        });
    }

    pub fn emit(&self, event: CoreEvent) {
        self.state().emit(event);
    }

    pub fn session(&self, id: &str) -> Option<StatusDict> {
        self.state().sessions.get(id).cloned()
    }

    /// Make every call touching `id` fail
    pub fn fail_session(&self, id: &str) {
        self.state().failing.insert(id.to_string());
    }

    pub fn heal_session(&self, id: &str) {
        self.state().failing.remove(id);
    }

    /// Make every call fail
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Hold back responses until [`InMemoryCore::release`]
    ///
    /// Responses are computed when the call arrives and delivered on release.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Number of status fetches, batched or single
    pub fn status_calls(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| !matches!(call, RecordedCall::SessionIds))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.state().subscribers.get(&kind).map_or(0, Vec::len)
    }

    async fn delivered<T>(&self, result: T) -> T {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        result
    }
}

impl Default for InMemoryCore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteClient for InMemoryCore {
    async fn fetch_status(
        &self,
        filter: &StatusFilter,
        fields: &[String],
        diff: bool,
    ) -> crate::Result<StatusMap> {
        let result: crate::Result<StatusMap> = {
            let mut state = self.state();
            state.calls.push(RecordedCall::Status {
                filter: filter.clone(),
                fields: fields.to_vec(),
                diff,
            });

            let candidates: Vec<String> = match &filter.ids {
                Some(ids) => ids
                    .iter()
                    .filter(|id| state.sessions.contains_key(*id))
                    .cloned()
                    .collect(),
                None => state.sessions.keys().cloned().collect(),
            };

            match state.check_failures(&candidates) {
                Err(e) => Err(e),
                Ok(()) => {
                    let mut status = StatusMap::new();
                    for id in candidates {
                        let matched = state
                            .sessions
                            .get(&id)
                            .is_some_and(|s| state.matches(s, filter));
                        if !matched {
                            continue;
                        }
                        if let Some(values) = state.report(&id, fields, diff) {
                            status.insert(id, values);
                        }
                    }
                    Ok(status)
                }
            }
        };
        self.delivered(result).await
    }

    async fn fetch_entity_status(
        &self,
        id: &str,
        fields: &[String],
        diff: bool,
    ) -> crate::Result<StatusDict> {
        let result: crate::Result<StatusDict> = {
            let mut state = self.state();
            state.calls.push(RecordedCall::EntityStatus {
                id: id.to_string(),
                fields: fields.to_vec(),
                diff,
            });
            let id = id.to_string();
            match state.check_failures([&id]) {
                Err(e) => Err(e),
                Ok(()) => state
                    .report(&id, fields, diff)
                    .ok_or_else(|| format!("unknown session {}", id).into()),
            }
        };
        self.delivered(result).await
    }

    async fn fetch_session_ids(&self) -> crate::Result<Vec<String>> {
        let result: crate::Result<Vec<String>> = {
            let mut state = self.state();
            state.calls.push(RecordedCall::SessionIds);
            match state.check_failures(std::iter::empty()) {
                Err(e) => Err(e),
                Ok(()) => Ok(state.sessions.keys().cloned().collect()),
            }
        };
        self.delivered(result).await
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.state().subscribers.entry(kind).or_default().push((id, handler));
        id
    }

    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        if let Some(handlers) = self.state().subscribers.get_mut(&kind) {
            handlers.retain(|(subscription, _)| *subscription != id);
        }
    }
}
