//! Consumer callbacks.
//!
//! A game implements [`SessionHandler`]; every method has a no-op default
//! so a consumer only overrides what it needs. Callbacks run on the
//! client's event loop, one at a time, and must not block.

use serde_json::Value;
use tandem_core::{SessionId, SessionInfo};

use crate::state_sync::StateSync;
use crate::store::ChildEventKind;

/// What a callback gets to look at.
pub struct SessionContext<'a> {
    pub info: &'a SessionInfo,
    /// Shared state of the current session
    pub state: &'a StateSync,
    pub has_control: bool,
}

/// A change to the shared state tree, as delivered to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub session_id: SessionId,
    /// Listener path the change was observed under ("" = state root)
    pub path: String,
    /// Child key under `path`
    pub key: String,
    pub value: Value,
    pub kind: ChildEventKind,
}

/// Verdict of [`SessionHandler::evaluate_update`].
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub is_allowed: bool,
    pub new_value: Value,
}

impl Evaluation {
    pub fn allow(new_value: Value) -> Self {
        Self {
            is_allowed: true,
            new_value,
        }
    }

    pub fn reject() -> Self {
        Self {
            is_allowed: false,
            new_value: Value::Null,
        }
    }
}

pub trait SessionHandler: Send + Sync {
    fn joined_waiting_room(&self, _ctx: &SessionContext<'_>) {}

    /// Player count or countdown changed while waiting.
    fn update_waiting_room(&self, _ctx: &SessionContext<'_>) {}

    fn start_session(&self, _ctx: &SessionContext<'_>) {}

    /// Player count changed in a started session.
    fn update_ongoing_session(&self, _ctx: &SessionContext<'_>) {}

    /// The session is over; `ctx.info.end_reason` says why.
    fn end_session(&self, _ctx: &SessionContext<'_>) {}

    fn gained_control(&self, _ctx: &SessionContext<'_>) {}

    fn lost_control(&self, _ctx: &SessionContext<'_>) {}

    /// Last chance to clear this player's own state entries before it leaves.
    fn remove_player_state(&self, _ctx: &SessionContext<'_>) {}

    fn receive_state_change(&self, _ctx: &SessionContext<'_>, _change: &StateChange) {}

    /// Validate a transactional update against the current value at `path`.
    ///
    /// Runs inside a store transaction and may be called several times for
    /// one update, so it must be a pure function of its arguments.
    fn evaluate_update(&self, _path: &str, _current: &Value, _action: &str, _args: &Value) -> Evaluation {
        Evaluation::reject()
    }
}
