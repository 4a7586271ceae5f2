//! Cooperative disconnect detection.
//!
//! Each seated player arms an on-disconnect write of a marker at
//! `<study>/presence/<playerId>`. When the store drops that connection the
//! marker appears, and any other seated client that sees it removes the
//! player from the registry with `abnormal` finish status, then clears the
//! marker.
//!
//! ```text
//!  client A                     store                         client B
//!  arm() ──onDisconnect(set)──►   │
//!  (connection lost) ───────────► presence/A = "disconnected" ──► child Added
//!                                 │  ◄── registry.remove(A, abnormal) ── evict(A)
//!                                 │  ◄── presence/A = null ───────────────┘
//! ```
//!
//! Several clients may evict the same player; removal of an absent player
//! is declined by the registry, so the race is harmless.

use std::sync::Arc;

use serde_json::{json, Value};
use tandem_core::{FinishStatus, PlayerId};

use crate::error::SyncError;
use crate::path;
use crate::sessions::{RegistryUpdate, SessionRegistry};
use crate::store::{ChildEvent, ChildEventKind, KeyValueStore, Subscription};

/// Marker value written when a connection drops.
pub const DISCONNECTED_MARKER: &str = "disconnected";

#[derive(Clone)]
pub struct PresenceMonitor {
    store: Arc<dyn KeyValueStore>,
    study_id: String,
    player_id: PlayerId,
    registry: SessionRegistry,
}

impl PresenceMonitor {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        study_id: &str,
        player_id: &str,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            store,
            study_id: study_id.to_string(),
            player_id: player_id.to_string(),
            registry,
        }
    }

    /// This player's marker path.
    pub fn marker_path(&self) -> String {
        path::presence(&self.study_id, &self.player_id)
    }

    /// Clear any stale marker of ours and arm the on-disconnect write.
    pub async fn arm(&self) -> Result<(), SyncError> {
        let marker = self.marker_path();
        self.store.write(&marker, Value::Null).await?;
        self.store
            .on_disconnect_set(&marker, json!(DISCONNECTED_MARKER))
            .await?;
        log::debug!("Presence armed for {}", self.player_id);
        Ok(())
    }

    /// Cancel the on-disconnect write (clean departure).
    pub async fn disarm(&self) -> Result<(), SyncError> {
        self.store.cancel_on_disconnect(&self.marker_path()).await?;
        log::debug!("Presence disarmed for {}", self.player_id);
        Ok(())
    }

    /// Subscribe to every player's marker.
    pub async fn watch(&self) -> Result<Subscription<ChildEvent>, SyncError> {
        let subscription = self
            .store
            .subscribe_child_events(&path::presence_root(&self.study_id))
            .await?;
        Ok(subscription)
    }

    /// React to a marker event. Returns the registry update when a player
    /// was evicted.
    pub async fn handle(&self, event: &ChildEvent) -> Result<Option<RegistryUpdate>, SyncError> {
        match event.kind {
            ChildEventKind::Added | ChildEventKind::Changed if event.key != self.player_id => {
                self.evict(&event.key).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Remove a vanished player and clear its marker.
    pub async fn evict(&self, player_id: &str) -> Result<RegistryUpdate, SyncError> {
        let update = self
            .registry
            .remove(player_id, FinishStatus::Abnormal, &self.player_id)
            .await?;
        if update.success {
            log::info!(
                "{} evicted disconnected player {player_id} from {:?}",
                self.player_id,
                update.session_id
            );
        }
        self.store
            .write(&path::presence(&self.study_id, player_id), Value::Null)
            .await?;
        Ok(update)
    }
}
