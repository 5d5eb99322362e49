use crate::proxy::entry::{Refresh, StatusEntry};
use crate::proxy::errors::ProxyError;
use crate::proxy::events;
use crate::proxy::status::{Status, StatusDict, StatusFilter, StatusMap};
use crate::proxy::CacheConfig;
use crate::rpc::{CoreEvent, EventKind, RemoteClient, SubscriptionId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

/// Future returned by every status query
///
/// Cache hits come back already resolved, so a caller polling once gets the
/// answer without a runtime having to make progress.
pub type StatusFuture = Pin<Box<dyn Future<Output = Result<Status, ProxyError>> + Send>>;

/// Future returned by [`StatusCache::query_one`]
pub type EntityFuture = Pin<Box<dyn Future<Output = Result<StatusDict, ProxyError>> + Send>>;

/// Issued to every fetch before it goes out
///
/// Responses are only merged for sessions that were not removed after `seq`,
/// and only while the cache is still in the lifecycle `epoch` it was issued in.
#[derive(Debug, Clone, Copy)]
struct FetchTicket {
    seq: u64,
    epoch: u64,
}

enum MergeOrigin {
    /// Response to a fetch issued with this ticket
    Fetch(FetchTicket),
    /// Status handed in by the caller
    Direct,
    /// Field update from a core event; never creates a session
    Event,
}

#[derive(Default)]
struct CacheState {
    /// session id -> cached status
    entries: HashMap<String, StatusEntry>,

    /// session id -> seq of its removal, kept while fetches are in flight
    tombstones: HashMap<String, u64>,

    /// advanced on every removal
    seq: u64,

    /// advanced on every stop
    epoch: u64,

    in_flight: usize,

    /// session id -> fields a failed fetch may have reported (`None`: all)
    ///
    /// The core may have moved its diff baseline for a request whose
    /// response never arrived, so these are fetched in full next time.
    resync: HashMap<String, Option<BTreeSet<String>>>,
}

impl CacheState {
    fn issue_ticket(&mut self) -> FetchTicket {
        self.in_flight += 1;
        FetchTicket {
            seq: self.seq,
            epoch: self.epoch,
        }
    }

    fn retire_ticket(&mut self, ticket: FetchTicket) {
        if ticket.epoch != self.epoch {
            return;
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight == 0 {
            self.tombstones.clear();
        }
    }

    fn is_current(&self, ticket: FetchTicket) -> bool {
        ticket.epoch == self.epoch
    }

    fn accepts(&self, id: &str, ticket: FetchTicket) -> bool {
        self.is_current(ticket)
            && self
                .tombstones
                .get(id)
                .is_none_or(|removed_at| *removed_at <= ticket.seq)
    }

    /// Every write of status values goes through here
    fn merge(&mut self, id: &str, values: StatusDict, origin: MergeOrigin, now: Instant) -> bool {
        match origin {
            MergeOrigin::Fetch(ticket) => {
                if !self.accepts(id, ticket) {
                    return false;
                }
                self.entries.entry(id.to_string()).or_default().merge(values, now);
            }
            MergeOrigin::Direct => {
                self.entries.entry(id.to_string()).or_default().merge(values, now);
            }
            MergeOrigin::Event => {
                let Some(entry) = self.entries.get_mut(id) else {
                    return false;
                };
                for (field, value) in values {
                    entry.set_field(field, value, now);
                }
            }
        }
        true
    }

    fn confirm(&mut self, id: &str, fields: &[String], ticket: FetchTicket, now: Instant) {
        if !self.accepts(id, ticket) {
            return;
        }
        if let Some(entry) = self.entries.get_mut(id) {
            entry.confirm(fields, now);
        }
    }

    fn mark_unsynced(&mut self, id: &str, fields: &[String]) {
        let pending = self
            .resync
            .entry(id.to_string())
            .or_insert_with(|| Some(BTreeSet::new()));
        if fields.is_empty() {
            *pending = None;
        } else if let Some(pending) = pending {
            pending.extend(fields.iter().cloned());
        }
    }

    /// A full response for `fields` arrived for `id`
    fn mark_synced(&mut self, id: &str, fields: &[String]) {
        let Some(pending) = self.resync.get_mut(id) else {
            return;
        };
        let done = match pending {
            _ if fields.is_empty() => true,
            None => false,
            Some(pending) => {
                for field in fields {
                    pending.remove(field);
                }
                pending.is_empty()
            }
        };
        if done {
            self.resync.remove(id);
        }
    }

    fn seed(&mut self, id: &str) {
        self.entries.entry(id.to_string()).or_default();
    }

    fn insert_placeholder(&mut self, id: &str) {
        self.entries.insert(id.to_string(), StatusEntry::new());
    }

    fn remove(&mut self, id: &str) -> bool {
        self.seq += 1;
        if self.in_flight > 0 {
            self.tombstones.insert(id.to_string(), self.seq);
        }
        self.resync.remove(id);
        self.entries.remove(id).is_some()
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.tombstones.clear();
        self.resync.clear();
        self.in_flight = 0;
        self.epoch += 1;
    }
}

/// Sessions a query covers
enum Selection {
    All,
    One(String),
    Many(Vec<String>),
}

impl Selection {
    fn new(ids: Option<&[String]>) -> Self {
        let Some(ids) = ids.filter(|ids| !ids.is_empty()) else {
            return Selection::All;
        };
        let mut seen = HashSet::new();
        let mut unique: Vec<String> = ids.iter().filter(|id| seen.insert(*id)).cloned().collect();
        if unique.len() == 1 {
            return Selection::One(unique.remove(0));
        }
        Selection::Many(unique)
    }
}

/// Keeps a fetch counted as in flight until it is dropped
struct TicketGuard {
    cache: StatusCache,
    ticket: FetchTicket,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        self.cache.state().retire_ticket(self.ticket);
    }
}

struct FetchPlan {
    ids: Vec<String>,
    /// union of stale fields; empty asks for everything
    fields: Vec<String>,
    diff: bool,
    guard: TicketGuard,
}

#[derive(Default)]
struct FetchOutcome {
    merged: usize,
    failed: Vec<String>,
    error: Option<crate::Error>,
}

impl FetchOutcome {
    fn fail(&mut self, ids: Vec<String>, e: crate::Error) {
        tracing::warn!("status fetch for {} sessions failed: {}", ids.len(), e);
        self.failed.extend(ids);
        if self.error.is_none() {
            self.error = Some(e);
        }
    }

    fn finish(self, status: Status) -> Result<Status, ProxyError> {
        match self.error {
            None => Ok(status),
            Some(source) if self.merged == 0 => Err(ProxyError::Transport(source)),
            Some(source) => Err(ProxyError::Partial {
                status,
                failed: self.failed,
                source,
            }),
        }
    }
}

struct Lifecycle {
    subscriptions: Vec<(EventKind, SubscriptionId)>,
    event_loop: JoinHandle<()>,
}

pub(crate) struct Inner {
    client: Arc<dyn RemoteClient>,
    config: CacheConfig,
    state: Mutex<CacheState>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

/// Client-side cache of session status
///
/// Clones share the same cache. All mutation of the cached sessions is
/// serialized through one lock that is never held across an await, so event
/// handlers and query completions apply one after another.
#[derive(Clone)]
pub struct StatusCache {
    inner: Arc<Inner>,
}

impl StatusCache {
    pub fn new(client: Arc<dyn RemoteClient>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                state: Mutex::new(CacheState::default()),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<Lifecycle>> {
        self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Status of `ids` (all cached sessions when `None` or empty)
    ///
    /// `fields` of `None` or empty returns every field cached for each session
    /// and only refreshes fields that are already cached. Exactly one requested
    /// id yields [`Status::Single`].
    pub fn query(&self, ids: Option<&[String]>, fields: Option<&[String]>) -> StatusFuture {
        let selection = Selection::new(ids);
        let fields = fields.map(<[String]>::to_vec).unwrap_or_default();

        let Some(plan) = self.plan(&selection, &fields) else {
            return Box::pin(std::future::ready(Ok(self.assemble(&selection, &fields))));
        };

        let cache = self.clone();
        Box::pin(async move {
            let outcome = cache.execute(&plan).await;
            drop(plan);
            let status = cache.assemble(&selection, &fields);
            outcome.finish(status)
        })
    }

    /// Flat status of a single session; empty if the session is unknown
    pub fn query_one(&self, id: &str, fields: Option<&[String]>) -> EntityFuture {
        let query = self.query(Some(&[id.to_string()]), fields);
        Box::pin(async move { query.await.map(|status| status.into_single().unwrap_or_default()) })
    }

    /// Status of the sessions matching `filter`
    ///
    /// An empty or id-only filter is answered like [`StatusCache::query`]. Any
    /// other filter depends on state only the core can evaluate, so it always
    /// goes to the core and the response is merged before it is returned.
    pub fn query_filtered(&self, filter: &StatusFilter, fields: Option<&[String]>) -> StatusFuture {
        if filter.is_empty() {
            return self.query(None, fields);
        }
        if filter.is_ids_only() {
            return self.query(filter.ids.as_deref(), fields);
        }

        let filter = filter.clone();
        let fields = fields.map(<[String]>::to_vec).unwrap_or_default();
        let diff = self.inner.config.diff_only && self.state().resync.is_empty();
        let guard = self.ticket_guard();
        let cache = self.clone();
        Box::pin(async move {
            let status = cache
                .inner
                .client
                .fetch_status(&filter, &fields, diff)
                .await
                .map_err(ProxyError::Transport)?;

            let mut ids: Vec<String> = status.keys().cloned().collect();
            ids.sort();
            cache.merge_fetched(status, &fields, diff, guard.ticket);
            drop(guard);
            Ok(cache.assemble(&Selection::Many(ids), &fields))
        })
    }

    /// Merge a status response into the cache
    ///
    /// Only fields present in `status` are written; each written field and the
    /// session's refresh time are stamped with the current time.
    pub fn merge_status(&self, status: StatusMap) {
        let now = Instant::now();
        let mut state = self.state();
        for (id, values) in status {
            state.merge(&id, values, MergeOrigin::Direct, now);
        }
    }

    pub fn merge_entity_status(&self, id: &str, values: StatusDict) {
        self.merge_status(HashMap::from([(id.to_string(), values)]));
    }

    /// A session was added on the core
    ///
    /// Installs an empty, never-refreshed entry right away and fetches the
    /// full status in the background. Must be called within a tokio runtime.
    pub fn on_added(&self, id: &str) -> JoinHandle<()> {
        let ticket = {
            let mut state = self.state();
            state.insert_placeholder(id);
            state.issue_ticket()
        };
        let guard = TicketGuard {
            cache: self.clone(),
            ticket,
        };

        let cache = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            match cache.inner.client.fetch_entity_status(&id, &[], false).await {
                Ok(values) => {
                    tracing::debug!("fetched {} fields for added session {}", values.len(), id);
                    cache.merge_fetched(HashMap::from([(id, values)]), &[], false, guard.ticket);
                }
                Err(e) => {
                    tracing::warn!("status fetch for added session {} failed: {}", id, e);
                    let mut state = cache.state();
                    if state.accepts(&id, guard.ticket) {
                        state.mark_unsynced(&id, &[]);
                    }
                }
            }
            drop(guard);
        })
    }

    /// A session was removed on the core
    ///
    /// Fetches already in flight will not bring it back.
    pub fn on_removed(&self, id: &str) {
        if self.state().remove(id) {
            tracing::debug!("removed session {} from cache", id);
        }
    }

    /// One status field of a session changed; ignored for uncached sessions
    pub fn on_changed(&self, id: &str, field: &str, value: serde_json::Value) {
        let values = StatusDict::from([(field.to_string(), value)]);
        self.state().merge(id, values, MergeOrigin::Event, Instant::now());
    }

    pub fn handle_event(&self, event: CoreEvent) {
        tracing::debug!("core event: {}", event);
        match event {
            CoreEvent::StateChanged { id, state } => {
                self.on_changed(&id, "state", serde_json::Value::String(state))
            }
            CoreEvent::FieldChanged { id, field, value } => self.on_changed(&id, &field, value),
            CoreEvent::Removed { id } => self.on_removed(&id),
            CoreEvent::Added { id, .. } => {
                self.on_added(&id);
            }
        }
    }

    /// Subscribe to core events and load the status of every session
    ///
    /// Sessions are seeded as empty entries before their status is fetched so
    /// queries racing the startup see them. If a fetch fails the error is
    /// returned and the cache stays running with whatever it loaded. Sessions
    /// removed while the id snapshot is in flight are not seeded, and a stop
    /// during startup ends it without loading anything.
    pub async fn start(&self) -> Result<(), ProxyError> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.is_some() {
                return Err(ProxyError::AlreadyRunning);
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let subscriptions = EventKind::ALL
                .iter()
                .map(|kind| (*kind, self.inner.client.subscribe(*kind, tx.clone())))
                .collect();
            let event_loop = tokio::spawn(events::run(self.downgrade(), rx));
            *lifecycle = Some(Lifecycle {
                subscriptions,
                event_loop,
            });
        }

        // taken before the snapshot so removals during it leave tombstones
        // and a stop during it is noticed
        let guard = self.ticket_guard();
        let ticket = guard.ticket;

        let ids = self
            .inner
            .client
            .fetch_session_ids()
            .await
            .map_err(ProxyError::Transport)?;

        let ids: Vec<String> = {
            let mut state = self.state();
            if !state.is_current(ticket) {
                tracing::info!("status cache stopped during startup");
                return Ok(());
            }
            let ids: Vec<String> = ids.into_iter().filter(|id| state.accepts(id, ticket)).collect();
            for id in &ids {
                state.seed(id);
            }
            ids
        };
        tracing::info!("status cache seeded with {} sessions", ids.len());

        // nothing is cached yet, so ask for full status
        for chunk in ids.chunks(self.inner.config.effective_chunk_size()) {
            let filter = StatusFilter::by_ids(chunk.to_vec());
            let status = match self.inner.client.fetch_status(&filter, &[], false).await {
                Ok(status) => status,
                Err(e) => {
                    let mut state = self.state();
                    if state.is_current(ticket) {
                        for id in chunk {
                            state.mark_unsynced(id, &[]);
                        }
                    }
                    return Err(ProxyError::Transport(e));
                }
            };
            if !self.state().is_current(ticket) {
                tracing::info!("status cache stopped during startup");
                return Ok(());
            }
            self.merge_fetched(status, &[], false, ticket);
        }
        drop(guard);

        tracing::info!("status cache started");
        Ok(())
    }

    /// Unsubscribe from core events and drop every cached session
    ///
    /// The cache can be started again afterwards. Responses to fetches issued
    /// before the stop are discarded.
    pub fn stop(&self) {
        let lifecycle = self.lifecycle().take();
        if let Some(lifecycle) = lifecycle {
            for (kind, id) in lifecycle.subscriptions {
                self.inner.client.unsubscribe(kind, id);
            }
            lifecycle.event_loop.abort();
        }
        self.state().reset();
        tracing::info!("status cache stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle().is_some()
    }

    /// Ids of all cached sessions, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Copy of the cached entry of a session
    pub fn entry(&self, id: &str) -> Option<StatusEntry> {
        self.state().entries.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    fn ticket_guard(&self) -> TicketGuard {
        let ticket = self.state().issue_ticket();
        TicketGuard {
            cache: self.clone(),
            ticket,
        }
    }

    /// Work out which sessions and fields have to come from the core
    fn plan(&self, selection: &Selection, fields: &[String]) -> Option<FetchPlan> {
        let window = self.inner.config.cache_time();
        let now = Instant::now();

        let (ticket, ids, fields, diff) = {
            let mut state = self.state();
            let targets: Vec<String> = match selection {
                Selection::All => state.entries.keys().cloned().collect(),
                Selection::One(id) => vec![id.clone()],
                Selection::Many(ids) => ids.clone(),
            };

            let mut to_fetch = Vec::new();
            let mut stale_fields = BTreeSet::new();
            let mut fetch_all = false;
            for id in targets {
                let refresh = match state.entries.get(&id) {
                    Some(entry) => entry.refresh_needed(fields, now, window),
                    None if fields.is_empty() => Refresh::All,
                    None => Refresh::Fields(fields.to_vec()),
                };
                match refresh {
                    Refresh::Fresh => continue,
                    Refresh::Fields(stale) => stale_fields.extend(stale),
                    Refresh::All => fetch_all = true,
                }
                to_fetch.push(id);
            }

            if to_fetch.is_empty() {
                return None;
            }
            to_fetch.sort();
            let fields = if fetch_all {
                Vec::new()
            } else {
                stale_fields.into_iter().collect()
            };
            let diff = self.inner.config.diff_only
                && !to_fetch.iter().any(|id| state.resync.contains_key(id));
            (state.issue_ticket(), to_fetch, fields, diff)
        };

        tracing::debug!("fetching {:?} for {} stale sessions", fields, ids.len());
        Some(FetchPlan {
            ids,
            fields,
            diff,
            guard: TicketGuard {
                cache: self.clone(),
                ticket,
            },
        })
    }

    /// Fetch the planned sessions in chunks, merging each chunk as it lands
    async fn execute(&self, plan: &FetchPlan) -> FetchOutcome {
        let diff = plan.diff;
        let ticket = plan.guard.ticket;
        let mut outcome = FetchOutcome::default();

        let mut chunks = JoinSet::new();
        for chunk in plan.ids.chunks(self.inner.config.effective_chunk_size()) {
            let client = self.inner.client.clone();
            let chunk = chunk.to_vec();
            let fields = plan.fields.clone();
            chunks.spawn(async move {
                let filter = StatusFilter::by_ids(chunk);
                let result = client.fetch_status(&filter, &fields, diff).await;
                (filter.ids.unwrap_or_default(), result)
            });
        }

        while let Some(joined) = chunks.join_next().await {
            match joined {
                Ok((_, Ok(status))) => {
                    self.merge_fetched(status, &plan.fields, diff, ticket);
                    outcome.merged += 1;
                }
                Ok((ids, Err(e))) => {
                    let mut state = self.state();
                    if state.is_current(ticket) {
                        for id in &ids {
                            state.mark_unsynced(id, &plan.fields);
                        }
                    }
                    drop(state);
                    outcome.fail(ids, e);
                }
                Err(e) => outcome.fail(Vec::new(), e.into()),
            }
        }
        outcome
    }

    fn merge_fetched(&self, status: StatusMap, fields: &[String], diff: bool, ticket: FetchTicket) {
        let now = Instant::now();
        let mut state = self.state();
        for (id, values) in status {
            if !state.merge(&id, values, MergeOrigin::Fetch(ticket), now) {
                tracing::debug!("dropping late status of removed session {}", id);
                continue;
            }
            // a diff response leaves out fields that did not change
            if diff {
                state.confirm(&id, fields, ticket, now);
            } else {
                state.mark_synced(&id, fields);
            }
        }
    }

    /// Build the caller's copy of the cached status
    fn assemble(&self, selection: &Selection, fields: &[String]) -> Status {
        let state = self.state();
        match selection {
            Selection::One(id) => Status::Single(
                state
                    .entries
                    .get(id)
                    .map(|entry| entry.snapshot(fields))
                    .unwrap_or_default(),
            ),
            Selection::Many(ids) => Status::Many(
                ids.iter()
                    .filter_map(|id| state.entries.get(id).map(|entry| (id.clone(), entry.snapshot(fields))))
                    .collect(),
            ),
            Selection::All => Status::Many(
                state
                    .entries
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.snapshot(fields)))
                    .collect(),
            ),
        }
    }
}
