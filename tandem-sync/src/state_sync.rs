//! Shared per-session state tree.
//!
//! Two write disciplines, both relative to `<study>/states/<sessionId>/`:
//!
//! - **direct**: fire-and-forget. `null` deletes the subtree, an object is
//!   shallow-merged, a scalar replaces. Last write wins. Writes are queued
//!   to a single writer task so one client's writes land in call order.
//! - **transactional**: read-validate-write through the store's atomic
//!   transaction, validated by [`SessionHandler::evaluate_update`]. A
//!   rejected update commits nothing and notifies nobody.
//!
//! ```text
//! direct_update ──► mpsc ──► writer task ──► store.merge / write ──┐
//! transactional_update ──────────────────► store.transaction ──────┤
//!                                                                  ▼
//! event loop ◄── StateChange ◄── listener tasks ◄── child events (per path)
//! ```

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tandem_core::{PlayerId, SessionId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{StoreError, SyncError};
use crate::handler::{SessionHandler, StateChange};
use crate::path;
use crate::recorder::Recorder;
use crate::store::{KeyValueStore, TxDecision};

enum WriteOp {
    Direct {
        session_id: SessionId,
        path: String,
        value: Value,
        record: bool,
    },
    Flush(oneshot::Sender<()>),
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    study_id: String,
    player_id: PlayerId,
    handler: Arc<dyn SessionHandler>,
    recorder: Recorder,
    /// Session whose state tree is attached
    session: watch::Sender<Option<SessionId>>,
    writer_tx: mpsc::UnboundedSender<WriteOp>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut handles) = self.listeners.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Handle to the state tree of this client's current session.
#[derive(Clone)]
pub struct StateSync {
    inner: Arc<Inner>,
}

impl StateSync {
    /// Create the handle and spawn its writer task. Requires a tokio runtime.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        study_id: &str,
        player_id: &str,
        handler: Arc<dyn SessionHandler>,
        recorder: Recorder,
    ) -> Self {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (session, _) = watch::channel(None);

        tokio::spawn(write_loop(
            store.clone(),
            recorder.clone(),
            study_id.to_string(),
            player_id.to_string(),
            writer_rx,
        ));

        Self {
            inner: Arc::new(Inner {
                store,
                study_id: study_id.to_string(),
                player_id: player_id.to_string(),
                handler,
                recorder,
                session,
                writer_tx,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Session that writes go to, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session.borrow().clone()
    }

    fn require_session(&self) -> Result<SessionId, SyncError> {
        self.session_id().ok_or(SyncError::NoActiveSession)
    }

    /// Unconditional write at `path`; see the module docs for the merge rules.
    pub fn direct_update(&self, path: &str, value: Value) -> Result<(), SyncError> {
        self.enqueue(path, value, true)
    }

    /// Like [`direct_update`](Self::direct_update) but kept out of the audit log.
    pub fn direct_update_unrecorded(&self, path: &str, value: Value) -> Result<(), SyncError> {
        self.enqueue(path, value, false)
    }

    fn enqueue(&self, path: &str, value: Value, record: bool) -> Result<(), SyncError> {
        let session_id = self.require_session()?;
        self.inner
            .writer_tx
            .send(WriteOp::Direct {
                session_id,
                path: path.to_string(),
                value,
                record,
            })
            .map_err(|_| SyncError::ClientClosed)
    }

    /// Wait until every direct update queued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.writer_tx.send(WriteOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Validated atomic update of the subtree at `path`.
    ///
    /// Returns `Ok(false)` when the evaluator declines.
    pub async fn transactional_update(
        &self,
        path: &str,
        action: &str,
        args: Value,
    ) -> Result<bool, SyncError> {
        let session_id = self.require_session()?;
        let full_path = path::state(&self.inner.study_id, &session_id, path);

        let handler = self.inner.handler.clone();
        let relative = path.to_string();
        let action_name = action.to_string();
        let action_args = args.clone();
        let evaluate = Box::new(move |current: &Value| {
            let evaluation = handler.evaluate_update(&relative, current, &action_name, &action_args);
            if evaluation.is_allowed {
                TxDecision::Commit(evaluation.new_value)
            } else {
                TxDecision::Abort
            }
        });

        let outcome = match self.inner.store.transaction(&full_path, evaluate).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("State transaction {action} at {full_path} failed: {e}");
                return Err(e.into());
            }
        };

        if outcome.committed {
            log::debug!("State transaction {action} at {full_path} committed");
            self.inner
                .recorder
                .record_state(
                    &session_id,
                    &self.inner.player_id,
                    path,
                    &outcome.value,
                    Some((action, &args)),
                )
                .await;
        } else {
            log::debug!("State transaction {action} at {full_path} declined");
        }
        Ok(outcome.committed)
    }

    /// Current value at `path` in the attached session.
    pub async fn read(&self, path: &str) -> Result<Value, SyncError> {
        let session_id = self.require_session()?;
        let value = self
            .inner
            .store
            .read(&path::state(&self.inner.study_id, &session_id, path))
            .await?;
        Ok(value)
    }

    /// Route writes to `session_id` without listening. Used from the waiting
    /// room on, so a client can seed its own state before the session starts.
    pub fn bind(&self, session_id: &str) {
        self.detach();
        self.inner.session.send_replace(Some(session_id.to_string()));
        log::debug!("Bound state writes to session {session_id}");
    }

    /// Bind to `session_id` and forward child events of each listener path.
    pub async fn attach(
        &self,
        session_id: &str,
        listener_paths: &[String],
        events: mpsc::UnboundedSender<StateChange>,
    ) -> Result<(), SyncError> {
        self.detach();
        self.inner.session.send_replace(Some(session_id.to_string()));

        for listener_path in listener_paths {
            let full_path = path::state(&self.inner.study_id, session_id, listener_path);
            let mut subscription = self.inner.store.subscribe_child_events(&full_path).await?;

            let events = events.clone();
            let session_id = session_id.to_string();
            let listener_path = listener_path.clone();
            let handle = tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    log::trace!("State {:?} {}/{}", event.kind, listener_path, event.key);
                    let change = StateChange {
                        session_id: session_id.clone(),
                        path: listener_path.clone(),
                        key: event.key,
                        value: event.value,
                        kind: event.kind,
                    };
                    if events.send(change).is_err() {
                        break;
                    }
                }
            });

            if let Ok(mut handles) = self.inner.listeners.lock() {
                handles.push(handle);
            }
        }

        log::debug!(
            "Attached state of session {session_id} ({} listener paths)",
            listener_paths.len()
        );
        Ok(())
    }

    /// Stop forwarding and unbind from the session.
    pub fn detach(&self) {
        self.inner.session.send_replace(None);
        if let Ok(mut handles) = self.inner.listeners.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Applies queued direct updates in order.
async fn write_loop(
    store: Arc<dyn KeyValueStore>,
    recorder: Recorder,
    study_id: String,
    player_id: PlayerId,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Direct {
                session_id,
                path: relative,
                value,
                record,
            } => {
                let full_path = path::state(&study_id, &session_id, &relative);
                match apply_direct(store.as_ref(), &full_path, value.clone()).await {
                    Ok(()) => {
                        if record {
                            recorder
                                .record_state(&session_id, &player_id, &relative, &value, None)
                                .await;
                        }
                    }
                    Err(e) => log::error!("Direct update at {full_path} failed: {e}"),
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn apply_direct(store: &dyn KeyValueStore, path: &str, value: Value) -> Result<(), StoreError> {
    match value {
        Value::Object(fields) => store.merge(path, fields).await,
        other => store.write(path, other).await,
    }
}
