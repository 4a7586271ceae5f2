//! Registry document model.
//!
//! The registry is a single document holding every session of a study:
//!
//! ```text
//! sessions/
//! ├── <sessionId>
//! │   ├── status               "waiting" | "active"
//! │   ├── sessionIndex         matchmaking priority (lower first)
//! │   ├── players/<playerId>   current occupants
//! │   ├── allPlayersEver/...   every player that ever sat here (latest stint)
//! │   ├── previousStints/...   earlier stints of players who came back
//! │   ├── playerControl        the single controlling player
//! │   ├── numPlayersEverJoined source of arrival indices
//! │   ├── waitingRoomStartedAt
//! │   └── sessionStartedAt     0 until promoted
//! └── ...
//! ```
//!
//! Timestamps are milliseconds of client-estimated server time (local clock
//! plus the store's reported offset, fixed when the transition runs); 0
//! means unset.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub type SessionId = String;
pub type PlayerId = String;

/// Generate a random player id, stable for the lifetime of one client.
pub fn generate_player_id() -> PlayerId {
    format!("_{}", Uuid::new_v4().simple())
}

/// Session status. Transitions waiting → active exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
}

/// Browser-focus proxy used for control eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FocusStatus {
    #[default]
    Focus,
    Blur,
}

/// How a player's stay in a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FinishStatus {
    #[default]
    Na,
    Normal,
    Abnormal,
}

/// Per (session, player) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSessionState {
    /// 1-based, drawn from the session's `numPlayersEverJoined`
    pub arrival_index: u64,
    pub status: FocusStatus,
    /// Number of times this player lost focus (control tie-break)
    pub num_blurred: u64,
    pub waiting_room_started_at: u64,
    #[serde(default)]
    pub session_started_at: u64,
    #[serde(default)]
    pub left_game_at: u64,
    #[serde(default)]
    pub finish_status: FinishStatus,
    /// Destination session when this player was moved out as a replacement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_to: Option<SessionId>,
}

impl PlayerSessionState {
    /// Fresh record for a player entering a waiting room.
    pub fn arriving(arrival_index: u64, status: FocusStatus, now: u64) -> Self {
        Self {
            arrival_index,
            status,
            num_blurred: 0,
            waiting_room_started_at: now,
            session_started_at: 0,
            left_game_at: 0,
            finish_status: FinishStatus::Na,
            moved_to: None,
        }
    }
}

/// One session (waiting room or active game).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub status: SessionStatus,
    pub session_index: u64,
    #[serde(default)]
    pub players: BTreeMap<PlayerId, PlayerSessionState>,
    #[serde(default)]
    pub all_players_ever: BTreeMap<PlayerId, PlayerSessionState>,
    /// Finished stints displaced from `all_players_ever` by a re-entry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub previous_stints: BTreeMap<PlayerId, Vec<PlayerSessionState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_control: Option<PlayerId>,
    pub num_players_ever_joined: u64,
    pub waiting_room_started_at: u64,
    #[serde(default)]
    pub session_started_at: u64,
}

impl Session {
    /// Empty waiting room.
    pub fn waiting(session_index: u64, now: u64) -> Self {
        Self {
            status: SessionStatus::Waiting,
            session_index,
            players: BTreeMap::new(),
            all_players_ever: BTreeMap::new(),
            previous_stints: BTreeMap::new(),
            player_control: None,
            num_players_ever_joined: 0,
            waiting_room_started_at: now,
            session_started_at: 0,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn has_player(&self, player_id: &str) -> bool {
        self.players.contains_key(player_id)
    }

    /// Current player ids ordered by arrival.
    pub fn players_by_arrival(&self) -> Vec<PlayerId> {
        let mut ids: Vec<(&PlayerId, u64)> = self
            .players
            .iter()
            .map(|(id, p)| (id, p.arrival_index))
            .collect();
        ids.sort_by_key(|(_, arrival)| *arrival);
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Copy the current record of `player_id` into the history map.
    pub fn record_history(&mut self, player_id: &str) {
        if let Some(state) = self.players.get(player_id) {
            self.all_players_ever
                .insert(player_id.to_string(), state.clone());
        }
    }

    /// Insert a player with the next arrival index, returning that index.
    ///
    /// The record's `arrival_index` is overwritten; everything else is kept,
    /// which is what a replacement migration needs.
    pub fn admit(&mut self, player_id: &str, mut state: PlayerSessionState) -> u64 {
        if let Some(earlier) = self.all_players_ever.remove(player_id) {
            self.previous_stints
                .entry(player_id.to_string())
                .or_default()
                .push(earlier);
        }
        self.num_players_ever_joined += 1;
        state.arrival_index = self.num_players_ever_joined;
        state.session_started_at = 0;
        state.left_game_at = 0;
        state.finish_status = FinishStatus::Na;
        state.moved_to = None;
        self.players.insert(player_id.to_string(), state);
        self.record_history(player_id);
        self.num_players_ever_joined
    }

    /// Promote to active once quorum is reached.
    ///
    /// A waiting session flips to active and stamps every occupant; an
    /// already active session only stamps the newcomer.
    pub fn promote_if_quorum(&mut self, min_players: usize, newcomer: &str, now: u64) {
        if self.players.len() < min_players {
            return;
        }
        match self.status {
            SessionStatus::Waiting => {
                self.status = SessionStatus::Active;
                self.session_started_at = now;
                let ids: Vec<PlayerId> = self.players.keys().cloned().collect();
                for id in ids {
                    if let Some(p) = self.players.get_mut(&id) {
                        p.session_started_at = now;
                    }
                    self.record_history(&id);
                }
            }
            SessionStatus::Active => {
                if let Some(p) = self.players.get_mut(newcomer) {
                    p.session_started_at = now;
                }
                self.record_history(newcomer);
            }
        }
    }
}

/// The whole sessions collection; the unit of compare-and-swap.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    pub sessions: BTreeMap<SessionId, Session>,
}

impl Registry {
    /// Decode a registry document. `null` is an empty registry.
    pub fn from_value(value: &Value) -> Result<Self, ModelError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone()).map_err(|e| ModelError::Decode(e.to_string()))
    }

    /// Encode as a document. An empty registry encodes as `null` (deleted).
    pub fn to_value(&self) -> Result<Value, ModelError> {
        if self.sessions.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::to_value(self).map_err(|e| ModelError::Encode(e.to_string()))
    }

    /// Session ids ordered by `sessionIndex` (then id).
    pub fn sorted_session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<(&SessionId, u64)> = self
            .sessions
            .iter()
            .map(|(id, s)| (id, s.session_index))
            .collect();
        ids.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// The session currently listing `player_id`, if any.
    pub fn session_of(&self, player_id: &str) -> Option<&SessionId> {
        self.sessions
            .iter()
            .find(|(_, s)| s.has_player(player_id))
            .map(|(id, _)| id)
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Next free `sessionIndex` (monotonic over the live sessions).
    pub fn next_session_index(&self) -> u64 {
        self.sessions
            .values()
            .map(|s| s.session_index)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Check the structural invariants every committed registry must hold.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut seen = BTreeMap::new();
        for (id, session) in &self.sessions {
            if session.players.is_empty() {
                return Err(ModelError::Invariant(format!("session {id} has no players")));
            }
            match &session.player_control {
                Some(control) if session.players.contains_key(control) => {}
                other => {
                    return Err(ModelError::Invariant(format!(
                        "session {id} control {other:?} is not a current player"
                    )));
                }
            }
            let mut arrivals: Vec<u64> = session
                .all_players_ever
                .values()
                .map(|p| p.arrival_index)
                .collect();
            arrivals.sort_unstable();
            if arrivals.windows(2).any(|w| w[0] == w[1]) || arrivals.first() == Some(&0) {
                return Err(ModelError::Invariant(format!(
                    "session {id} has duplicate or zero arrival indices"
                )));
            }
            if arrivals.last().copied().unwrap_or(0) > session.num_players_ever_joined {
                return Err(ModelError::Invariant(format!(
                    "session {id} arrival index exceeds numPlayersEverJoined"
                )));
            }
            for player in session.players.keys() {
                if !session.all_players_ever.contains_key(player) {
                    return Err(ModelError::Invariant(format!(
                        "player {player} in session {id} missing from allPlayersEver"
                    )));
                }
                if let Some(other) = seen.insert(player.clone(), id.clone()) {
                    return Err(ModelError::Invariant(format!(
                        "player {player} listed in sessions {other} and {id}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Errors decoding or checking the registry document.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    Decode(String),
    Encode(String),
    Invariant(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Decode(e) => write!(f, "Registry decode error: {e}"),
            ModelError::Encode(e) => write!(f, "Registry encode error: {e}"),
            ModelError::Invariant(e) => write!(f, "Registry invariant violated: {e}"),
        }
    }
}

impl std::error::Error for ModelError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session_with(players: &[(&str, u64)]) -> Session {
        let mut s = Session::waiting(1, 100);
        for (id, _) in players {
            s.admit(id, PlayerSessionState::arriving(0, FocusStatus::Focus, 100));
        }
        s.player_control = players.first().map(|(id, _)| id.to_string());
        s
    }

    #[test]
    fn test_registry_null_is_empty() {
        let registry = Registry::from_value(&Value::Null).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.to_value().unwrap(), Value::Null);
    }

    #[test]
    fn test_registry_camel_case_shape() {
        let mut registry = Registry::default();
        registry.sessions.insert("s1".into(), session_with(&[("alice", 1)]));

        let value = registry.to_value().unwrap();
        let s1 = &value["s1"];
        assert_eq!(s1["status"], json!("waiting"));
        assert_eq!(s1["sessionIndex"], json!(1));
        assert_eq!(s1["numPlayersEverJoined"], json!(1));
        assert_eq!(s1["playerControl"], json!("alice"));
        assert_eq!(s1["players"]["alice"]["arrivalIndex"], json!(1));
        assert_eq!(s1["players"]["alice"]["status"], json!("focus"));
        assert_eq!(s1["players"]["alice"]["finishStatus"], json!("na"));
        assert!(s1["players"]["alice"].get("movedTo").is_none());
        assert!(s1.get("previousStints").is_none());

        let decoded = Registry::from_value(&value).unwrap();
        assert_eq!(decoded, registry);
    }

    #[test]
    fn test_registry_decode_error() {
        let err = Registry::from_value(&json!({ "s1": { "status": "bogus" } })).unwrap_err();
        assert!(matches!(err, ModelError::Decode(_)));
    }

    #[test]
    fn test_admit_assigns_increasing_arrivals() {
        let mut s = Session::waiting(1, 0);
        let a = s.admit("a", PlayerSessionState::arriving(0, FocusStatus::Focus, 1));
        let b = s.admit("b", PlayerSessionState::arriving(0, FocusStatus::Blur, 2));
        assert_eq!((a, b), (1, 2));
        assert_eq!(s.players_by_arrival(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(s.all_players_ever.len(), 2);
    }

    #[test]
    fn test_readmit_keeps_earlier_stint() {
        let mut s = session_with(&[("a", 1), ("b", 2)]);
        s.players.remove("a");
        if let Some(history) = s.all_players_ever.get_mut("a") {
            history.left_game_at = 300;
            history.finish_status = FinishStatus::Abnormal;
        }

        let arrival = s.admit("a", PlayerSessionState::arriving(0, FocusStatus::Focus, 400));
        assert_eq!(arrival, 3);
        assert_eq!(s.all_players_ever["a"].arrival_index, 3);
        assert_eq!(s.all_players_ever["a"].finish_status, FinishStatus::Na);

        let earlier = &s.previous_stints["a"];
        assert_eq!(earlier.len(), 1);
        assert_eq!(earlier[0].arrival_index, 1);
        assert_eq!(earlier[0].left_game_at, 300);
        assert_eq!(earlier[0].finish_status, FinishStatus::Abnormal);

        let value = serde_json::to_value(&s).unwrap();
        assert_eq!(value["previousStints"]["a"][0]["leftGameAt"], json!(300));
        assert_eq!(serde_json::from_value::<Session>(value).unwrap(), s);
    }

    #[test]
    fn test_promote_waiting_stamps_everyone() {
        let mut s = session_with(&[("a", 1), ("b", 2)]);
        s.promote_if_quorum(2, "b", 500);
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.session_started_at, 500);
        assert!(s.players.values().all(|p| p.session_started_at == 500));
        assert!(s.all_players_ever.values().all(|p| p.session_started_at == 500));
    }

    #[test]
    fn test_promote_below_quorum_is_noop() {
        let mut s = session_with(&[("a", 1)]);
        s.promote_if_quorum(2, "a", 500);
        assert_eq!(s.status, SessionStatus::Waiting);
        assert_eq!(s.session_started_at, 0);
    }

    #[test]
    fn test_next_session_index_is_monotonic() {
        let mut registry = Registry::default();
        assert_eq!(registry.next_session_index(), 1);
        let mut s = session_with(&[("a", 1)]);
        s.session_index = 4;
        registry.sessions.insert("s4".into(), s);
        assert_eq!(registry.next_session_index(), 5);
    }

    #[test]
    fn test_validate_rejects_empty_session() {
        let mut registry = Registry::default();
        registry.sessions.insert("s1".into(), Session::waiting(1, 0));
        assert!(matches!(registry.validate(), Err(ModelError::Invariant(_))));
    }

    #[test]
    fn test_validate_rejects_foreign_controller() {
        let mut registry = Registry::default();
        let mut s = session_with(&[("a", 1)]);
        s.player_control = Some("ghost".into());
        registry.sessions.insert("s1".into(), s);
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_player_in_two_sessions() {
        let mut registry = Registry::default();
        registry.sessions.insert("s1".into(), session_with(&[("a", 1)]));
        registry.sessions.insert("s2".into(), session_with(&[("a", 1)]));
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_generated_player_ids_are_distinct() {
        let a = generate_player_id();
        let b = generate_player_id();
        assert!(a.starts_with('_'));
        assert_ne!(a, b);
    }
}
