//! In-process store backend.
//!
//! [`MemoryDatabase`] is the shared "server": one JSON tree plus its
//! subscribers. Each client talks to it through its own
//! [`MemoryConnection`], which carries the connection state, the
//! on-disconnect writes and a simulated clock offset.
//!
//! Transactions are an explicit compare-and-swap loop: read a snapshot,
//! run the handler outside the lock, then commit only if the value at the
//! path is still the snapshot. On conflict the loop backs off
//! exponentially (1 ms doubling to 64 ms) and retries with a fresh read,
//! up to [`MAX_TX_ATTEMPTS`] times.
//!
//! Subscribers are notified after a commit by diffing their last seen
//! value, so a handler's speculative results are never observable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{
    ChildEvent, ChildEventKind, KeyValueStore, Subscription, TxDecision, TxHandler, TxOutcome,
};
use crate::error::StoreError;
use crate::path;

/// Attempts before a conflicting transaction gives up.
pub const MAX_TX_ATTEMPTS: u32 = 25;
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(64);

type Segments = Vec<String>;

struct ValueWatcher {
    path: Segments,
    last: Value,
    tx: mpsc::UnboundedSender<Value>,
}

struct ChildWatcher {
    path: Segments,
    last: Map<String, Value>,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

#[derive(Default)]
struct DbState {
    root: Value,
    value_watchers: Vec<ValueWatcher>,
    child_watchers: Vec<ChildWatcher>,
    /// Connection id → writes to apply when it drops
    on_disconnect: HashMap<u64, Vec<(Segments, Value)>>,
    next_connection: u64,
    commits: u64,
}

impl DbState {
    fn commit(&mut self, writes: Vec<(Segments, Value)>) {
        let now = now_ms();
        for (path, value) in writes {
            set_at(&mut self.root, &path, resolve_timestamps(value, now));
        }
        self.commits += 1;
        self.notify();
    }

    /// Deliver changes to every watcher and drop the ones whose receiver is gone.
    fn notify(&mut self) {
        let root = &self.root;

        self.value_watchers.retain_mut(|w| {
            let current = value_at(root, &w.path);
            if current == w.last {
                return !w.tx.is_closed();
            }
            w.last = current.clone();
            w.tx.send(current).is_ok()
        });

        self.child_watchers.retain_mut(|w| {
            let current = children_at(root, &w.path);
            let events = diff_children(&w.last, &current);
            w.last = current;
            events.into_iter().all(|e| w.tx.send(e).is_ok()) && !w.tx.is_closed()
        });
    }
}

/// Shared in-memory database.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DbState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection.
    pub fn connect(&self) -> MemoryConnection {
        let id = match self.lock() {
            Ok(mut state) => {
                state.next_connection += 1;
                state.next_connection
            }
            Err(_) => 0,
        };
        let (connected, _) = watch::channel(true);
        MemoryConnection {
            db: self.clone(),
            id,
            connected,
            clock_offset: 0,
        }
    }

    /// Value at `path` as the server sees it (`Null` when absent or invalid).
    pub fn snapshot(&self, path: &str) -> Value {
        match (path::segments(path), self.lock()) {
            (Ok(segments), Ok(state)) => value_at(&state.root, &segments),
            _ => Value::Null,
        }
    }

    /// Number of committed writes so far.
    pub fn commit_count(&self) -> u64 {
        self.lock().map(|s| s.commits).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, DbState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory database lock poisoned".into()))
    }

    fn read_at(&self, path: &[String]) -> Result<Value, StoreError> {
        Ok(value_at(&self.lock()?.root, path))
    }

    fn apply(&self, writes: Vec<(Segments, Value)>) -> Result<(), StoreError> {
        self.lock()?.commit(writes);
        Ok(())
    }

    /// Commit `value` only if the path still holds `expected`.
    fn compare_and_set(
        &self,
        path: &[String],
        expected: &Value,
        value: Value,
    ) -> Result<Option<Value>, StoreError> {
        let mut state = self.lock()?;
        if value_at(&state.root, path) != *expected {
            return Ok(None);
        }
        state.commit(vec![(path.to_vec(), value)]);
        Ok(Some(value_at(&state.root, path)))
    }

    fn watch_value(&self, path: Segments) -> Result<Subscription<Value>, StoreError> {
        let mut state = self.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let current = value_at(&state.root, &path);
        let _ = tx.send(current.clone());
        state.value_watchers.push(ValueWatcher {
            path,
            last: current,
            tx,
        });
        Ok(Subscription::new(rx))
    }

    fn watch_children(&self, path: Segments) -> Result<Subscription<ChildEvent>, StoreError> {
        let mut state = self.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let current = children_at(&state.root, &path);
        for event in diff_children(&Map::new(), &current) {
            let _ = tx.send(event);
        }
        state.child_watchers.push(ChildWatcher {
            path,
            last: current,
            tx,
        });
        Ok(Subscription::new(rx))
    }
}

/// One client's connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    db: MemoryDatabase,
    id: u64,
    connected: watch::Sender<bool>,
    clock_offset: i64,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simulate a client clock that lags the server by `offset_ms`.
    pub fn with_clock_offset(mut self, offset_ms: i64) -> Self {
        self.clock_offset = offset_ms;
        self
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    /// Drop the connection: run the on-disconnect writes and fail further operations.
    pub fn disconnect(&self) -> Result<(), StoreError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.connected.send_replace(false);

        let mut state = self.db.lock()?;
        let writes = state.on_disconnect.remove(&self.id).unwrap_or_default();
        if !writes.is_empty() {
            log::debug!("Connection {} dropped, applying {} on-disconnect writes", self.id, writes.len());
            state.commit(writes);
        }
        Ok(())
    }

    pub fn reconnect(&self) {
        self.connected.send_replace(true);
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::Disconnected)
        }
    }
}

impl KeyValueStore for MemoryConnection {
    fn read<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Value, StoreError>> {
        async move {
            self.ensure_connected()?;
            self.db.read_at(&path::segments(path)?)
        }
        .boxed()
    }

    fn write<'a>(&'a self, path: &'a str, value: Value) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.ensure_connected()?;
            self.db.apply(vec![(path::segments(path)?, value)])
        }
        .boxed()
    }

    fn merge<'a>(
        &'a self,
        path: &'a str,
        fields: Map<String, Value>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.ensure_connected()?;
            let base = path::segments(path)?;
            let mut writes = Vec::with_capacity(fields.len());
            for (key, value) in fields {
                let mut target = base.clone();
                target.extend(path::segments(&key)?);
                writes.push((target, value));
            }
            self.db.apply(writes)
        }
        .boxed()
    }

    fn push<'a>(&'a self, path: &'a str, value: Value) -> BoxFuture<'a, Result<String, StoreError>> {
        async move {
            self.ensure_connected()?;
            let key = self.generate_id();
            let mut target = path::segments(path)?;
            target.push(key.clone());
            self.db.apply(vec![(target, value)])?;
            Ok(key)
        }
        .boxed()
    }

    fn transaction<'a>(
        &'a self,
        path: &'a str,
        mut handler: TxHandler,
    ) -> BoxFuture<'a, Result<TxOutcome, StoreError>> {
        async move {
            let segments = path::segments(path)?;
            let mut backoff = INITIAL_BACKOFF;

            for attempt in 1..=MAX_TX_ATTEMPTS {
                self.ensure_connected()?;
                let snapshot = self.db.read_at(&segments)?;
                let proposed = match handler(&snapshot) {
                    TxDecision::Abort => {
                        return Ok(TxOutcome {
                            committed: false,
                            value: snapshot,
                        })
                    }
                    TxDecision::Commit(value) => value,
                };

                // Other writers may land between the read and the commit.
                tokio::task::yield_now().await;

                if let Some(value) = self.db.compare_and_set(&segments, &snapshot, proposed)? {
                    if attempt > 1 {
                        log::debug!("Transaction at {path} committed on attempt {attempt}");
                    }
                    return Ok(TxOutcome {
                        committed: true,
                        value,
                    });
                }

                log::debug!("Transaction at {path} conflicted on attempt {attempt}, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }

            log::warn!("Transaction at {path} gave up after {MAX_TX_ATTEMPTS} attempts");
            Err(StoreError::RetriesExhausted {
                path: path.to_string(),
                attempts: MAX_TX_ATTEMPTS,
            })
        }
        .boxed()
    }

    fn subscribe_value<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Subscription<Value>, StoreError>> {
        async move {
            self.ensure_connected()?;
            self.db.watch_value(path::segments(path)?)
        }
        .boxed()
    }

    fn subscribe_child_events<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Subscription<ChildEvent>, StoreError>> {
        async move {
            self.ensure_connected()?;
            self.db.watch_children(path::segments(path)?)
        }
        .boxed()
    }

    fn subscribe_connection_state(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn on_disconnect_set<'a>(
        &'a self,
        path: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.ensure_connected()?;
            let segments = path::segments(path)?;
            let mut state = self.db.lock()?;
            let pending = state.on_disconnect.entry(self.id).or_default();
            pending.retain(|(p, _)| *p != segments);
            pending.push((segments, value));
            Ok(())
        }
        .boxed()
    }

    fn cancel_on_disconnect<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.ensure_connected()?;
            let segments = path::segments(path)?;
            let mut state = self.db.lock()?;
            if let Some(pending) = state.on_disconnect.get_mut(&self.id) {
                pending.retain(|(p, _)| *p != segments);
            }
            Ok(())
        }
        .boxed()
    }

    fn generate_id(&self) -> String {
        Uuid::now_v7().simple().to_string()
    }

    fn server_time_offset(&self) -> i64 {
        self.clock_offset
    }
}

// ─── Tree helpers ───────────────────────────────────────────────

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn value_at(root: &Value, path: &[String]) -> Value {
    let mut node = root;
    for segment in path {
        match node.get(segment) {
            Some(child) => node = child,
            None => return Value::Null,
        }
    }
    node.clone()
}

fn children_at(root: &Value, path: &[String]) -> Map<String, Value> {
    match value_at(root, path) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Write `value` at `path`, creating parents and pruning emptied ones.
fn set_at(node: &mut Value, path: &[String], value: Value) {
    let value = normalize(value);
    let Some((head, rest)) = path.split_first() else {
        *node = value;
        return;
    };
    if value.is_null() && !node.is_object() {
        return;
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };
    let child = map.entry(head.clone()).or_insert(Value::Null);
    set_at(child, rest, value);
    if child.is_null() {
        map.remove(head);
    }
    if map.is_empty() {
        *node = Value::Null;
    }
}

/// Drop `null` members and empty objects, which the tree never stores.
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if cleaned.is_empty() {
                Value::Null
            } else {
                Value::Object(cleaned)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        other => other,
    }
}

fn is_timestamp_marker(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.get(".sv").and_then(Value::as_str) == Some("timestamp")
}

fn resolve_timestamps(value: Value, now: u64) -> Value {
    match value {
        Value::Object(map) if is_timestamp_marker(&map) => Value::from(now),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_timestamps(v, now)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| resolve_timestamps(v, now))
                .collect(),
        ),
        other => other,
    }
}

fn diff_children(old: &Map<String, Value>, new: &Map<String, Value>) -> Vec<ChildEvent> {
    let mut events = Vec::new();
    for (key, value) in new {
        let kind = match old.get(key) {
            None => ChildEventKind::Added,
            Some(previous) if previous != value => ChildEventKind::Changed,
            Some(_) => continue,
        };
        events.push(ChildEvent {
            kind,
            key: key.clone(),
            value: value.clone(),
        });
    }
    for (key, value) in old {
        if !new.contains_key(key) {
            events.push(ChildEvent {
                kind: ChildEventKind::Removed,
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    events
}
