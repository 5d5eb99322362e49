//! Cached status of a single session

use crate::proxy::status::StatusDict;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// What a query needs from the core for one cached session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refresh {
    /// Everything asked for is within the freshness window
    Fresh,
    /// These fields are missing or expired
    Fields(Vec<String>),
    /// Never refreshed and no field list given: ask the core for everything
    All,
}

/// Last known status of a session plus the time each field was last updated
///
/// Every key in `values` has a matching key in `field_times`. `refreshed_at`
/// only moves forward; `None` means the session was seeded but never filled
/// by a response, so it counts as stale regardless of the window.
#[derive(Debug, Clone, Default)]
pub struct StatusEntry {
    values: StatusDict,
    field_times: HashMap<String, Instant>,
    refreshed_at: Option<Instant>,
}

impl StatusEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partial merge of a core response
    ///
    /// Overwrites only the fields present in `values`; anything else already
    /// cached is left as is.
    pub fn merge(&mut self, values: StatusDict, now: Instant) {
        self.refreshed_at = Some(match self.refreshed_at {
            Some(t) if t > now => t,
            _ => now,
        });
        for (field, value) in values {
            self.set_field(field, value, now);
        }
    }

    /// Update one field without counting as a full refresh
    pub fn set_field(&mut self, field: String, value: serde_json::Value, now: Instant) {
        self.field_times.insert(field.clone(), now);
        self.values.insert(field, value);
    }

    /// Mark cached fields as current without changing their values
    ///
    /// An empty `fields` slice confirms every cached field. Fields that are not
    /// cached are ignored.
    pub fn confirm(&mut self, fields: &[String], now: Instant) {
        if fields.is_empty() {
            for t in self.field_times.values_mut() {
                *t = now;
            }
            return;
        }
        for field in fields {
            if let Some(t) = self.field_times.get_mut(field) {
                *t = now;
            }
        }
    }

    pub fn is_field_fresh(&self, field: &str, now: Instant, window: Duration) -> bool {
        match self.field_times.get(field) {
            Some(t) => now.saturating_duration_since(*t) <= window,
            None => false,
        }
    }

    /// Fields of this session a query for `requested` has to fetch
    ///
    /// With no requested fields the currently cached field set is checked;
    /// fields never asked for are not pulled in.
    pub fn refresh_needed(&self, requested: &[String], now: Instant, window: Duration) -> Refresh {
        if requested.is_empty() && self.refreshed_at.is_none() {
            return Refresh::All;
        }

        let stale: Vec<String> = if requested.is_empty() {
            let mut cached: Vec<String> = self
                .field_times
                .keys()
                .filter(|field| !self.is_field_fresh(field, now, window))
                .cloned()
                .collect();
            cached.sort();
            cached
        } else {
            requested
                .iter()
                .filter(|field| !self.is_field_fresh(field, now, window))
                .cloned()
                .collect()
        };

        if stale.is_empty() {
            Refresh::Fresh
        } else {
            Refresh::Fields(stale)
        }
    }

    /// Copy of the cached values restricted to `fields` (all when empty)
    pub fn snapshot(&self, fields: &[String]) -> StatusDict {
        if fields.is_empty() {
            return self.values.clone();
        }
        fields
            .iter()
            .filter_map(|field| self.values.get(field).map(|v| (field.clone(), v.clone())))
            .collect()
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.values.get(field)
    }

    pub fn field_updated_at(&self, field: &str) -> Option<Instant> {
        self.field_times.get(field).copied()
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WINDOW: Duration = Duration::from_millis(1500);

    fn dict(pairs: &[(&str, serde_json::Value)]) -> StatusDict {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_merge_is_partial() {
        let t0 = Instant::now();
        let mut entry = StatusEntry::new();
        entry.merge(dict(&[("name", json!("Foo")), ("state", json!("Seeding"))]), t0);

        let t1 = t0 + Duration::from_secs(1);
        entry.merge(dict(&[("name", json!("Bar"))]), t1);

        assert_eq!(entry.get("name"), Some(&json!("Bar")));
        assert_eq!(entry.get("state"), Some(&json!("Seeding")));
        assert_eq!(entry.field_updated_at("name"), Some(t1));
        assert_eq!(entry.field_updated_at("state"), Some(t0));
        assert_eq!(entry.refreshed_at(), Some(t1));
    }

    #[test]
    fn test_refreshed_at_never_moves_back() {
        let t0 = Instant::now();
        let mut entry = StatusEntry::new();
        entry.merge(dict(&[("name", json!("Foo"))]), t0 + Duration::from_secs(5));
        entry.merge(dict(&[("name", json!("Bar"))]), t0);
        assert_eq!(entry.refreshed_at(), Some(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_seeded_entry_needs_everything() {
        let entry = StatusEntry::new();
        assert_eq!(entry.refresh_needed(&[], Instant::now(), WINDOW), Refresh::All);
        assert_eq!(
            entry.refresh_needed(&fields(&["state"]), Instant::now(), WINDOW),
            Refresh::Fields(fields(&["state"]))
        );
    }

    #[test]
    fn test_freshness_is_per_field() {
        let t0 = Instant::now();
        let mut entry = StatusEntry::new();
        entry.merge(dict(&[("name", json!("Foo")), ("state", json!("Paused"))]), t0);
        entry.set_field("state".to_string(), json!("Seeding"), t0 + Duration::from_secs(2));

        let now = t0 + Duration::from_secs(3);
        assert!(!entry.is_field_fresh("name", now, WINDOW));
        assert!(entry.is_field_fresh("state", now, WINDOW));
        assert_eq!(
            entry.refresh_needed(&fields(&["name", "state"]), now, WINDOW),
            Refresh::Fields(fields(&["name"]))
        );
        assert_eq!(entry.refresh_needed(&[], now, WINDOW), Refresh::Fields(fields(&["name"])));
    }

    #[test]
    fn test_window_boundary_is_fresh() {
        let t0 = Instant::now();
        let mut entry = StatusEntry::new();
        entry.merge(dict(&[("name", json!("Foo"))]), t0);
        assert!(entry.is_field_fresh("name", t0 + WINDOW, WINDOW));
        assert!(!entry.is_field_fresh("name", t0 + WINDOW + Duration::from_millis(1), WINDOW));
    }

    #[test]
    fn test_no_field_list_never_pulls_new_fields() {
        let t0 = Instant::now();
        let mut entry = StatusEntry::new();
        entry.merge(dict(&[("name", json!("Foo"))]), t0);
        assert_eq!(entry.refresh_needed(&[], t0, WINDOW), Refresh::Fresh);
    }

    #[test]
    fn test_confirm_touches_only_cached_fields() {
        let t0 = Instant::now();
        let mut entry = StatusEntry::new();
        entry.merge(dict(&[("name", json!("Foo"))]), t0);

        let t1 = t0 + Duration::from_secs(10);
        entry.confirm(&fields(&["name", "progress"]), t1);
        assert_eq!(entry.field_updated_at("name"), Some(t1));
        assert_eq!(entry.field_updated_at("progress"), None);
        assert!(entry.get("progress").is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut entry = StatusEntry::new();
        entry.merge(dict(&[("name", json!("Foo")), ("state", json!("Paused"))]), Instant::now());

        let mut snap = entry.snapshot(&fields(&["name", "missing"]));
        assert_eq!(snap.len(), 1);
        snap.insert("name".to_string(), json!("Changed"));
        assert_eq!(entry.get("name"), Some(&json!("Foo")));
        assert_eq!(entry.snapshot(&[]).len(), 2);
    }
}
