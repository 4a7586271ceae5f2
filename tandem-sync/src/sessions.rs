//! Async session registry: the pure transitions run inside store transactions.
//!
//! Each call fixes the estimated server time and a candidate session id
//! up front and hands the store a handler that only maps a snapshot to a
//! [`Transition`]. Store-induced retries therefore replay the exact same
//! function on a fresher snapshot.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tandem_core::registry::{self, RegistryAction, Transition, TransitionContext};
use tandem_core::{FinishStatus, FocusStatus, ModelError, PlayerId, Registry, SessionConfig, SessionId};

use crate::error::SyncError;
use crate::path;
use crate::recorder::Recorder;
use crate::store::{KeyValueStore, TxDecision};

/// Outcome of one registry call.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryUpdate {
    /// Whether the transaction committed
    pub success: bool,
    pub action: RegistryAction,
    /// Player the action applied to
    pub player: PlayerId,
    /// Player whose client issued the call
    pub initiating_player: PlayerId,
    /// Session the player joined or left
    pub session_id: Option<SessionId>,
    /// Registry after the call
    pub registry: Registry,
    /// Replacement pulled into the session: (player, source session)
    pub replacement: Option<(PlayerId, SessionId)>,
    /// Sessions deleted by this call
    pub released: Vec<SessionId>,
}

/// Local clock in milliseconds since the epoch.
pub fn local_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Local clock corrected by the store's reported offset.
pub fn estimated_server_time(store: &dyn KeyValueStore) -> u64 {
    (local_now_ms() as i64)
        .saturating_add(store.server_time_offset())
        .max(0) as u64
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn KeyValueStore>,
    config: Arc<SessionConfig>,
    path: String,
    recorder: Recorder,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        study_id: &str,
        config: SessionConfig,
        recorder: Recorder,
    ) -> Self {
        Self {
            store,
            config: Arc::new(config),
            path: path::sessions(study_id),
            recorder,
        }
    }

    /// Store path of the registry document.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current registry.
    pub async fn read(&self) -> Result<Registry, SyncError> {
        let value = self.store.read(&self.path).await?;
        Ok(Registry::from_value(&value)?)
    }

    /// Seat `player_id` in a session.
    pub async fn join(&self, player_id: &str, focus: FocusStatus) -> Result<RegistryUpdate, SyncError> {
        self.apply(RegistryAction::Join, player_id, player_id, focus).await
    }

    /// Remove `player_id`; `initiating_player` is the caller (differs on eviction).
    pub async fn remove(
        &self,
        player_id: &str,
        finish: FinishStatus,
        initiating_player: &str,
    ) -> Result<RegistryUpdate, SyncError> {
        self.apply(
            RegistryAction::Remove(finish),
            player_id,
            initiating_player,
            FocusStatus::Focus,
        )
        .await
    }

    pub async fn set_focus(&self, player_id: &str, status: FocusStatus) -> Result<RegistryUpdate, SyncError> {
        self.apply(RegistryAction::Focus(status), player_id, player_id, status)
            .await
    }

    async fn apply(
        &self,
        action: RegistryAction,
        player_id: &str,
        initiating_player: &str,
        focus: FocusStatus,
    ) -> Result<RegistryUpdate, SyncError> {
        let now = estimated_server_time(self.store.as_ref());
        let new_session_id = self.store.generate_id();

        // Last transition computed by the handler, read back after the store returns.
        let slot: Arc<Mutex<Option<Result<Transition, ModelError>>>> = Arc::new(Mutex::new(None));
        let handler_slot = slot.clone();
        let config = self.config.clone();
        let player = player_id.to_string();

        let handler = Box::new(move |current: &Value| {
            let result = Registry::from_value(current).and_then(|snapshot| {
                let ctx = TransitionContext {
                    config: &config,
                    now,
                    new_session_id: &new_session_id,
                    focus,
                };
                let transition = registry::apply(&snapshot, &player, action, &ctx);
                // Encode up front so a bad document aborts instead of committing.
                transition.registry.to_value().map(|value| (transition, value))
            });
            let decision = match &result {
                Ok((transition, value)) if transition.allowed => TxDecision::Commit(value.clone()),
                _ => TxDecision::Abort,
            };
            if let Ok(mut guard) = handler_slot.lock() {
                *guard = Some(result.map(|(transition, _)| transition));
            }
            decision
        });

        let outcome = match self.store.transaction(&self.path, handler).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Registry {} for {player_id} failed: {e}", action.name());
                return Err(e.into());
            }
        };

        let transition = slot.lock().ok().and_then(|mut guard| guard.take());
        let update = match transition {
            Some(Ok(transition)) => {
                let registry = if outcome.committed {
                    Registry::from_value(&outcome.value)?
                } else {
                    transition.registry
                };
                RegistryUpdate {
                    success: outcome.committed,
                    action,
                    player: player_id.to_string(),
                    initiating_player: initiating_player.to_string(),
                    session_id: transition.session_id.or_else(|| {
                        registry.session_of(player_id).cloned()
                    }),
                    registry,
                    replacement: transition.replacement,
                    released: transition.released,
                }
            }
            Some(Err(e)) => {
                log::error!("Registry document at {} is malformed: {e}", self.path);
                return Err(e.into());
            }
            None => {
                return Err(SyncError::Model(ModelError::Decode(
                    "registry handler did not run".into(),
                )))
            }
        };

        if update.success {
            log::debug!(
                "Registry {} for {player_id} committed (session {:?})",
                action.name(),
                update.session_id
            );
            if let Some((moved, from)) = &update.replacement {
                log::info!("Moved {moved} from waiting room {from} into {:?}", update.session_id);
            }
        } else {
            log::debug!("Registry {} for {player_id} declined", action.name());
        }

        self.recorder.record_session_update(&update).await;
        Ok(update)
    }
}
