//! Status dictionaries handed to callers and the filter they query with

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Field name -> last known value for one session
pub type StatusDict = HashMap<String, serde_json::Value>;

/// Session id -> status fields
pub type StatusMap = HashMap<String, StatusDict>;

/// Result of a status query
///
/// A query naming exactly one session yields its flat field mapping; anything
/// else is keyed by session id. Both serialize to the bare JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Status {
    Single(StatusDict),
    Many(StatusMap),
}

impl Status {
    /// Flat mapping for a single-session result
    pub fn single(&self) -> Option<&StatusDict> {
        match self {
            Status::Single(dict) => Some(dict),
            Status::Many(_) => None,
        }
    }

    /// Per-session mapping for a multi-session result
    pub fn many(&self) -> Option<&StatusMap> {
        match self {
            Status::Single(_) => None,
            Status::Many(map) => Some(map),
        }
    }

    pub fn into_single(self) -> Option<StatusDict> {
        match self {
            Status::Single(dict) => Some(dict),
            Status::Many(_) => None,
        }
    }

    pub fn into_many(self) -> Option<StatusMap> {
        match self {
            Status::Single(_) => None,
            Status::Many(map) => Some(map),
        }
    }

    /// Number of sessions described by this result
    pub fn session_count(&self) -> usize {
        match self {
            Status::Single(_) => 1,
            Status::Many(map) => map.len(),
        }
    }
}

/// Session filter accepted by the core
///
/// `ids` restricts to a list of sessions, `state` to a session state (the core
/// also understands the derived state `"Active"`). Keys the cache does not know
/// about are kept in `extra` and forwarded untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusFilter {
    #[serde(default, rename = "id", skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl StatusFilter {
    pub fn by_ids(ids: Vec<String>) -> Self {
        Self {
            ids: Some(ids),
            ..Default::default()
        }
    }

    pub fn by_state(state: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_none() && self.state.is_none() && self.extra.is_empty()
    }

    /// True when the filter carries nothing but an id list
    pub fn is_ids_only(&self) -> bool {
        self.ids.is_some() && self.state.is_none() && self.extra.is_empty()
    }
}
