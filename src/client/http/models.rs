//! HTTP API request and response models

use serde::{Deserialize, Serialize};

/// Query string of `GET /status`
///
/// Lists are comma separated: `/status?ids=t1,t2&fields=name,state`.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct StatusQuery {
    pub ids: Option<String>,
    pub fields: Option<String>,
    /// Session state to filter on; always answered by the core
    pub state: Option<String>,
}

impl StatusQuery {
    pub fn ids(&self) -> Option<Vec<String>> {
        self.ids.as_deref().map(split_list)
    }

    pub fn fields(&self) -> Option<Vec<String>> {
        self.fields.as_deref().map(split_list)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Health check response
#[derive(Serialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub running: bool,
    pub sessions: usize,
}

/// Body returned when a query fails outright
#[derive(Serialize, Debug, Clone)]
pub struct ErrorResponse {
    pub error: String,
}
