//! Key-value store contract.
//!
//! Everything Tandem persists goes through [`KeyValueStore`]: a tree of
//! JSON values addressed by slash-separated paths, with an atomic
//! read-modify-write primitive and push subscriptions. The trait is
//! object-safe so a client can hold any backend as `Arc<dyn KeyValueStore>`.
//!
//! ```text
//! SessionRegistry ──transaction──┐
//! StateSync ───merge / write─────┤
//! PresenceMonitor ─onDisconnect──┼──► KeyValueStore ──► Subscription<Value>
//! Recorder ──push────────────────┘                  └─► Subscription<ChildEvent>
//! ```
//!
//! Transaction contract: the handler may run several times per call, each
//! time against a fresh read, and values from attempts that did not commit
//! are never delivered to subscribers.

mod memory;

pub use memory::{MemoryConnection, MemoryDatabase, MAX_TX_ATTEMPTS};

use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};

use crate::error::StoreError;

/// Kind of change to a direct child of a subscribed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    Added,
    Changed,
    Removed,
}

/// A change to one child of a subscribed path.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    pub key: String,
    /// New value; the last known value for `Removed`
    pub value: Value,
}

/// Handler verdict for one transaction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TxDecision {
    Commit(Value),
    Abort,
}

/// Result of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxOutcome {
    pub committed: bool,
    /// Value at the path after the call (the last snapshot when aborted)
    pub value: Value,
}

/// Transaction handler. Must be a pure function of its input.
pub type TxHandler = Box<dyn FnMut(&Value) -> TxDecision + Send>;

/// Stream of notifications for one subscription.
///
/// Dropping it unsubscribes; the store prunes the sender on its next
/// notification.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next notification if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Placeholder resolved to the store's clock when a write commits.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

/// Backing store used by every Tandem component.
pub trait KeyValueStore: Send + Sync {
    /// Value at `path`, `Null` when absent.
    fn read<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Value, StoreError>>;

    /// Replace the value at `path`. `Null` deletes the subtree.
    fn write<'a>(&'a self, path: &'a str, value: Value) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Shallow field update: each entry replaces (or, when `Null`, deletes)
    /// one child of `path`; other children are untouched.
    fn merge<'a>(
        &'a self,
        path: &'a str,
        fields: Map<String, Value>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Append under a fresh chronologically ordered key, returning the key.
    fn push<'a>(&'a self, path: &'a str, value: Value) -> BoxFuture<'a, Result<String, StoreError>>;

    /// Atomic read-modify-write of the value at `path`.
    fn transaction<'a>(
        &'a self,
        path: &'a str,
        handler: TxHandler,
    ) -> BoxFuture<'a, Result<TxOutcome, StoreError>>;

    /// Current value at `path`, then every committed change to it.
    fn subscribe_value<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Subscription<Value>, StoreError>>;

    /// One `Added` per existing child of `path`, then incremental changes.
    fn subscribe_child_events<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Subscription<ChildEvent>, StoreError>>;

    /// `true` while connected.
    fn subscribe_connection_state(&self) -> watch::Receiver<bool>;

    /// Write `value` at `path` when this connection drops.
    fn on_disconnect_set<'a>(
        &'a self,
        path: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Cancel pending on-disconnect writes at `path`.
    fn cancel_on_disconnect<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Collision-resistant id, ordered by creation time.
    fn generate_id(&self) -> String;

    /// Server clock minus local clock, in milliseconds.
    fn server_time_offset(&self) -> i64;

    fn server_timestamp(&self) -> Value {
        server_timestamp()
    }
}
