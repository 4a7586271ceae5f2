//! Pure registry transitions: matchmaking, promotion, replacement, control.
//!
//! Every operation is a function of `(snapshot, player, context)` returning
//! a [`Transition`]. The store may run the same handler several times while
//! resolving a conflicting commit, so nothing here reads a clock, draws an
//! id or touches shared state: the estimated server time and the id for a
//! possibly created session are fixed in the [`TransitionContext`] once per
//! logical call.
//!
//! ```text
//! join(p)      ──► first session (by sessionIndex) with a free seat and
//!                  hours left ─► admit ─► promote? ─► elect
//!                  └─ none ─► new waiting session (if under the cap)
//! remove(p)    ──► drop from players, stamp history
//!                  ├─ empty ─► delete session
//!                  └─ replacements ─► pull longest waiter of the first
//!                                     other waiting room ─► promote? ─► elect
//! set_focus(p) ──► status / numBlurred ─► elect
//! ```
//!
//! Reference: Kleppmann — DDIA, Chapter 7 (compare-and-set, lost updates)

use crate::config::SessionConfig;
use crate::model::{
    FinishStatus, FocusStatus, PlayerId, PlayerSessionState, Registry, Session, SessionId,
    SessionStatus,
};

/// Inputs fixed for the duration of one logical registry call.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub config: &'a SessionConfig,
    /// Estimated server time in milliseconds
    pub now: u64,
    /// Id used if this call has to create a session
    pub new_session_id: &'a str,
    /// Focus status a joining player starts with
    pub focus: FocusStatus,
}

/// Registry mutation requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryAction {
    Join,
    Remove(FinishStatus),
    Focus(FocusStatus),
}

impl RegistryAction {
    /// Name used in the audit log.
    pub fn name(&self) -> &'static str {
        match self {
            RegistryAction::Join => "join",
            RegistryAction::Remove(_) => "remove",
            RegistryAction::Focus(FocusStatus::Focus) => "focus",
            RegistryAction::Focus(FocusStatus::Blur) => "blur",
        }
    }
}

/// Outcome of a registry transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Whether the new registry should be committed
    pub allowed: bool,
    /// Registry to commit (the input, unchanged, when not allowed)
    pub registry: Registry,
    /// Session the player ended up in or was removed from
    pub session_id: Option<SessionId>,
    /// Sessions deleted because they emptied
    pub released: Vec<SessionId>,
    /// Replacement that was pulled in: (player, source session)
    pub replacement: Option<(PlayerId, SessionId)>,
}

impl Transition {
    fn declined(registry: &Registry) -> Self {
        Self {
            allowed: false,
            registry: registry.clone(),
            session_id: None,
            released: Vec::new(),
            replacement: None,
        }
    }

    fn committed(registry: Registry, session_id: SessionId) -> Self {
        Self {
            allowed: true,
            registry,
            session_id: Some(session_id),
            released: Vec::new(),
            replacement: None,
        }
    }
}

/// Dispatch an action to its transition.
pub fn apply(
    registry: &Registry,
    player_id: &str,
    action: RegistryAction,
    ctx: &TransitionContext<'_>,
) -> Transition {
    match action {
        RegistryAction::Join => join(registry, player_id, ctx),
        RegistryAction::Remove(finish) => remove(registry, player_id, finish, ctx),
        RegistryAction::Focus(status) => set_focus(registry, player_id, status),
    }
}

/// Seat a player in the best available session, creating one if allowed.
pub fn join(registry: &Registry, player_id: &str, ctx: &TransitionContext<'_>) -> Transition {
    if let Some(existing) = registry.session_of(player_id) {
        // Already seated: committing the unchanged registry keeps join idempotent.
        return Transition::committed(registry.clone(), existing.clone());
    }

    let config = ctx.config;
    let mut next = registry.clone();

    for session_id in registry.sorted_session_ids() {
        let Some(session) = next.sessions.get_mut(&session_id) else {
            continue;
        };
        if !config.within_session_hours(session.session_started_at, ctx.now) {
            continue;
        }
        if session.player_count() >= config.max_players_needed {
            continue;
        }
        seat(session, player_id, config, ctx);
        return Transition::committed(next, session_id);
    }

    let under_cap =
        config.max_parallel_sessions == 0 || next.len() < config.max_parallel_sessions;
    if !under_cap || next.sessions.contains_key(ctx.new_session_id) {
        return Transition::declined(registry);
    }

    let mut session = Session::waiting(next.next_session_index(), ctx.now);
    seat(&mut session, player_id, config, ctx);
    next.sessions.insert(ctx.new_session_id.to_string(), session);
    Transition::committed(next, ctx.new_session_id.to_string())
}

fn seat(session: &mut Session, player_id: &str, config: &SessionConfig, ctx: &TransitionContext<'_>) {
    session.admit(player_id, PlayerSessionState::arriving(0, ctx.focus, ctx.now));
    session.promote_if_quorum(config.min_players_needed, player_id, ctx.now);
    elect_controller(session);
}

/// Remove a player, deleting or backfilling the session it leaves.
pub fn remove(
    registry: &Registry,
    player_id: &str,
    finish: FinishStatus,
    ctx: &TransitionContext<'_>,
) -> Transition {
    let Some(session_id) = registry.session_of(player_id).cloned() else {
        return Transition::declined(registry);
    };

    let mut next = registry.clone();
    let mut transition = Transition::committed(Registry::default(), session_id.clone());

    let (now_empty, started_at) = match next.sessions.get_mut(&session_id) {
        Some(session) => {
            session.players.remove(player_id);
            if let Some(history) = session.all_players_ever.get_mut(player_id) {
                history.left_game_at = ctx.now;
                history.finish_status = finish;
            }
            (session.players.is_empty(), session.session_started_at)
        }
        None => return Transition::declined(registry),
    };

    if now_empty {
        next.sessions.remove(&session_id);
        transition.released.push(session_id);
        transition.registry = next;
        return transition;
    }

    let config = ctx.config;
    if config.allow_replacements && config.within_session_hours(started_at, ctx.now) {
        if let Some((source_id, candidate)) = find_replacement(&next, &session_id) {
            if let Some(state) = take_from_source(&mut next, &source_id, &candidate, &session_id, ctx.now) {
                if next.sessions.get(&source_id).is_none() {
                    transition.released.push(source_id.clone());
                }
                if let Some(destination) = next.sessions.get_mut(&session_id) {
                    destination.admit(&candidate, state);
                    destination.promote_if_quorum(config.min_players_needed, &candidate, ctx.now);
                }
                transition.replacement = Some((candidate, source_id));
            }
        }
    }

    if let Some(session) = next.sessions.get_mut(&session_id) {
        elect_controller(session);
    }
    transition.registry = next;
    transition
}

/// First other waiting room (by sessionIndex) and its longest-waiting player.
fn find_replacement(registry: &Registry, destination: &str) -> Option<(SessionId, PlayerId)> {
    registry
        .sorted_session_ids()
        .into_iter()
        .filter(|id| id != destination)
        .find_map(|id| {
            let session = registry.sessions.get(&id)?;
            if session.status != SessionStatus::Waiting {
                return None;
            }
            let candidate = session
                .players
                .iter()
                .min_by(|(ida, a), (idb, b)| {
                    a.waiting_room_started_at
                        .cmp(&b.waiting_room_started_at)
                        .then(a.arrival_index.cmp(&b.arrival_index))
                        .then_with(|| ida.cmp(idb))
                })
                .map(|(pid, _)| pid.clone())?;
            Some((id, candidate))
        })
}

/// Detach `player_id` from its waiting room, keeping the room's history.
fn take_from_source(
    registry: &mut Registry,
    source_id: &str,
    player_id: &str,
    destination: &str,
    now: u64,
) -> Option<PlayerSessionState> {
    let source = registry.sessions.get_mut(source_id)?;
    let state = source.players.remove(player_id)?;
    if let Some(history) = source.all_players_ever.get_mut(player_id) {
        history.left_game_at = now;
        history.moved_to = Some(destination.to_string());
    }
    if source.players.is_empty() {
        registry.sessions.remove(source_id);
    } else {
        elect_controller(source);
    }
    Some(state)
}

/// Record a focus change and re-elect the controller.
pub fn set_focus(registry: &Registry, player_id: &str, status: FocusStatus) -> Transition {
    let Some(session_id) = registry.session_of(player_id).cloned() else {
        return Transition::declined(registry);
    };

    let mut next = registry.clone();
    let Some(session) = next.sessions.get_mut(&session_id) else {
        return Transition::declined(registry);
    };
    if let Some(player) = session.players.get_mut(player_id) {
        player.status = status;
        if status == FocusStatus::Blur {
            player.num_blurred += 1;
        }
    }
    session.record_history(player_id);
    elect_controller(session);
    Transition::committed(next, session_id)
}

/// Pick the controlling player: focused before blurred, then fewer blurs,
/// then earlier arrival. Returns the new controller.
pub fn elect_controller(session: &mut Session) -> Option<PlayerId> {
    session.player_control = session
        .players
        .iter()
        .min_by(|(ida, a), (idb, b)| {
            a.status
                .cmp(&b.status)
                .then(a.num_blurred.cmp(&b.num_blurred))
                .then(a.arrival_index.cmp(&b.arrival_index))
                .then_with(|| ida.cmp(idb))
        })
        .map(|(id, _)| id.clone());
    session.player_control.clone()
}
