//! Audit log for session transitions and state writes (`recordData`).
//!
//! ```text
//! <study>/data/sessions/<sessionId>/<pushId>        {isSuccess, action, sessionsState,
//!                                                    player, initiatingPlayer, timestamp}
//! <study>/recordedData/states/<sessionId>/<pushId>  {state, timestamp, playerId, path,
//!                                                    action?, actionArgs?}
//! ```
//!
//! Records are best effort: a failed push is logged and dropped, it never
//! fails the operation being recorded.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::path;
use crate::sessions::RegistryUpdate;
use crate::store::KeyValueStore;

/// Session id used for records made outside any session.
pub const UNASSIGNED_SESSION: &str = "unassigned";

#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn KeyValueStore>,
    study_id: String,
    enabled: bool,
}

impl Recorder {
    pub fn new(store: Arc<dyn KeyValueStore>, study_id: impl Into<String>, enabled: bool) -> Self {
        Self {
            store,
            study_id: study_id.into(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Log the outcome of a registry transaction under the session it concerns.
    pub async fn record_session_update(&self, update: &RegistryUpdate) {
        if !self.enabled {
            return;
        }
        let sessions_state = update.registry.to_value().unwrap_or(Value::Null);
        let record = json!({
            "isSuccess": update.success,
            "action": update.action.name(),
            "sessionsState": sessions_state,
            "player": update.player,
            "initiatingPlayer": update.initiating_player,
            "timestamp": self.store.server_timestamp(),
        });
        let session_id = update.session_id.as_deref().unwrap_or(UNASSIGNED_SESSION);
        self.push(path::session_log(&self.study_id, session_id), record).await;
    }

    /// Log a committed state write. `action` is set for transactional updates.
    pub async fn record_state(
        &self,
        session_id: &str,
        player_id: &str,
        state_path: &str,
        state: &Value,
        action: Option<(&str, &Value)>,
    ) {
        if !self.enabled {
            return;
        }
        let mut record = json!({
            "state": state,
            "timestamp": self.store.server_timestamp(),
            "playerId": player_id,
            "path": state_path,
        });
        if let (Some((action, args)), Some(fields)) = (action, record.as_object_mut()) {
            fields.insert("action".into(), json!(action));
            fields.insert("actionArgs".into(), args.clone());
        }
        self.push(path::state_log(&self.study_id, session_id), record).await;
    }

    async fn push(&self, log_path: String, record: Value) {
        match self.store.push(&log_path, record).await {
            Ok(key) => log::trace!("Recorded {log_path}/{key}"),
            Err(e) => log::warn!("Failed to record to {log_path}: {e}"),
        }
    }
}
