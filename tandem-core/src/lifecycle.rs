//! Per-client session lifecycle state machine.
//!
//! The controller never performs I/O. Registry notifications, countdown
//! ticks, timer expiry and connection loss go in; a list of [`Effect`]s
//! comes out for the owning event loop to carry out in order.
//!
//! ```text
//!   idle ──waiting──► waitingRoomStarted ──active──► (waitingRoomCountdown)* ──► sessionStarted
//!                          │  count change: updateWaitingRoom              │  count change: updateOngoingSession
//!                          └──────────────────────────┬────────────────────┘  below quorum: leave / grace timer
//!                                                     ▼
//!                                              leaveSession (endSession)
//! ```
//!
//! Registry notifications carry the whole document every time, so every
//! transition is guarded by the `session_initiated` / `session_started`
//! flags and repeated deliveries are no-ops.

use serde::Serialize;

use crate::config::SessionConfig;
use crate::model::{PlayerId, Registry, SessionId, SessionStatus};

// ─── Session info ───────────────────────────────────────────────

/// Client-local lifecycle label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ClientStatus {
    #[default]
    Idle,
    WaitingRoomStarted,
    WaitingRoomCountdown,
    SessionStarted,
    LeaveSession,
}

/// Why a client's session ended, as reported with `endSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    /// The client left on its own
    Left,
    /// No session slot and the parallel-session cap was reached
    JoinRefused,
    /// Connection to the store was lost, or another client evicted us
    Disconnected,
    /// Player count dropped below quorum
    BelowMinimum,
}

impl EndReason {
    pub fn code(&self) -> u8 {
        match self {
            EndReason::Left => 0,
            EndReason::JoinRefused => 1,
            EndReason::Disconnected => 2,
            EndReason::BelowMinimum => 3,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            EndReason::Left => "",
            EndReason::JoinRefused => "no sessions available",
            EndReason::Disconnected => "session disconnected",
            EndReason::BelowMinimum => "fell below minimum",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Left => write!(f, "left session"),
            other => write!(f, "{} (code {})", other.message(), other.code()),
        }
    }
}

/// A client's cached view of its own session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub player_id: PlayerId,
    pub session_id: Option<SessionId>,
    pub session_index: Option<u64>,
    pub arrival_index: Option<u64>,
    pub status: ClientStatus,
    /// Seconds left in the waiting-room countdown
    pub countdown: Option<u64>,
    pub num_players: usize,
    /// Current players, ordered by arrival
    pub player_ids: Vec<PlayerId>,
    pub arrival_indices: Vec<u64>,
    /// Local clock, milliseconds
    pub waiting_room_started_at: u64,
    /// Local clock, milliseconds
    pub session_started_at: u64,
    pub end_reason: Option<EndReason>,
}

impl SessionInfo {
    pub fn new(player_id: PlayerId) -> Self {
        Self {
            player_id,
            session_id: None,
            session_index: None,
            arrival_index: None,
            status: ClientStatus::Idle,
            countdown: None,
            num_players: 0,
            player_ids: Vec::new(),
            arrival_indices: Vec::new(),
            waiting_room_started_at: 0,
            session_started_at: 0,
            end_reason: None,
        }
    }

    /// Numeric error code (0 = none).
    pub fn error_code(&self) -> u8 {
        self.end_reason.map(|r| r.code()).unwrap_or(0)
    }

    pub fn error_message(&self) -> &'static str {
        self.end_reason.map(|r| r.message()).unwrap_or("")
    }
}

// ─── Events and effects ─────────────────────────────────────────

/// Consumer callbacks the lifecycle asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    JoinedWaitingRoom,
    UpdateWaitingRoom,
    StartSession,
    UpdateOngoingSession,
    EndSession,
    GainedControl,
    LostControl,
}

/// Work the event loop must carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Emit(LifecycleEvent),
    /// Start a 1-second interval feeding `on_countdown_tick`
    StartCountdown(u64),
    StopCountdown,
    /// Route state writes to this session; no listeners yet
    BindState(SessionId),
    /// Subscribe to the session's state tree
    AttachState(SessionId),
    /// One-shot timer in seconds feeding `on_below_min_timeout`
    ArmBelowMinTimer(u64),
    ClearBelowMinTimer,
    /// Run the leave procedure, then call `end`
    Leave(EndReason),
    /// Drop state listeners and the presence hook
    Teardown,
}

// ─── Controller ─────────────────────────────────────────────────

/// Lifecycle state for one client.
pub struct SessionLifecycleController {
    config: SessionConfig,
    info: SessionInfo,
    session_initiated: bool,
    session_started: bool,
    num_players_before: usize,
    control_before: Option<PlayerId>,
    has_control: bool,
    countdown_remaining: Option<u64>,
    below_min_armed: bool,
}

impl SessionLifecycleController {
    pub fn new(player_id: PlayerId, config: SessionConfig) -> Self {
        Self {
            config,
            info: SessionInfo::new(player_id),
            session_initiated: false,
            session_started: false,
            num_players_before: 0,
            control_before: None,
            has_control: false,
            countdown_remaining: None,
            below_min_armed: false,
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn player_id(&self) -> &str {
        &self.info.player_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether this client has been seen in a session since it last ended.
    pub fn is_initiated(&self) -> bool {
        self.session_initiated
    }

    pub fn is_started(&self) -> bool {
        self.session_started
    }

    pub fn has_control(&self) -> bool {
        self.has_control
    }

    /// React to a fresh registry snapshot.
    ///
    /// `server_offset` is server time minus local time in milliseconds.
    pub fn on_registry(&mut self, registry: &Registry, server_offset: i64) -> Vec<Effect> {
        let player_id = self.info.player_id.clone();
        let Some(session_id) = registry.session_of(&player_id).cloned() else {
            if self.session_initiated {
                log::info!("{player_id} no longer listed in session {:?}", self.info.session_id);
                return self.end(EndReason::Disconnected);
            }
            return Vec::new();
        };
        let Some(session) = registry.session(&session_id) else {
            return Vec::new();
        };

        let mut effects = Vec::new();
        let mut leave = None;

        let num_players = session.player_count();
        let player_ids = session.players_by_arrival();
        self.info.arrival_indices = player_ids
            .iter()
            .filter_map(|id| session.players.get(id).map(|p| p.arrival_index))
            .collect();
        self.info.player_ids = player_ids;
        self.info.num_players = num_players;
        if self.countdown_remaining.is_none() {
            self.info.countdown = None;
        }
        self.has_control = session.player_control.as_deref() == Some(player_id.as_str());

        let arrival_index = session.players.get(&player_id).map(|p| p.arrival_index);

        // Moved into another session as a replacement.
        if self.session_initiated && self.info.session_id.as_ref() != Some(&session_id) {
            log::info!(
                "{player_id} moved from session {:?} to {session_id}",
                self.info.session_id
            );
            self.info.session_id = Some(session_id.clone());
            self.info.session_index = Some(session.session_index);
            self.info.arrival_index = arrival_index;
            self.info.waiting_room_started_at = to_local(session.waiting_room_started_at, server_offset);
            effects.push(Effect::BindState(session_id.clone()));
            if session.status == SessionStatus::Waiting {
                effects.push(Effect::Emit(LifecycleEvent::UpdateWaitingRoom));
                self.num_players_before = num_players;
            }
        }

        if session.status == SessionStatus::Waiting && !self.session_initiated {
            self.session_initiated = true;
            self.session_started = false;
            self.info.session_id = Some(session_id.clone());
            self.info.session_index = Some(session.session_index);
            self.info.arrival_index = arrival_index;
            self.info.end_reason = None;
            self.num_players_before = num_players;
            self.info.status = ClientStatus::WaitingRoomStarted;
            self.info.waiting_room_started_at = to_local(session.waiting_room_started_at, server_offset);
            log::info!("{player_id} joined waiting room of session {session_id}");
            effects.push(Effect::BindState(session_id.clone()));
            effects.push(Effect::Emit(LifecycleEvent::JoinedWaitingRoom));
        } else if session.status == SessionStatus::Active && !self.session_started {
            self.session_initiated = true;
            self.session_started = true;
            self.info.session_id = Some(session_id.clone());
            self.info.session_index = Some(session.session_index);
            self.info.arrival_index = arrival_index;
            self.info.end_reason = None;
            self.num_players_before = num_players;
            self.info.session_started_at = to_local(session.session_started_at, server_offset);

            if self.config.exit_delay_waiting_room == 0 {
                self.info.status = ClientStatus::SessionStarted;
                log::info!("{player_id} started session {session_id}");
                effects.push(Effect::AttachState(session_id.clone()));
                effects.push(Effect::Emit(LifecycleEvent::StartSession));
            } else {
                self.countdown_remaining = Some(self.config.exit_delay_waiting_room);
                log::debug!(
                    "{player_id} counting down {}s before session {session_id}",
                    self.config.exit_delay_waiting_room
                );
                effects.push(Effect::BindState(session_id.clone()));
                effects.push(Effect::StartCountdown(self.config.exit_delay_waiting_room));
            }
        } else if num_players != self.num_players_before {
            self.num_players_before = num_players;
            match session.status {
                SessionStatus::Waiting => {
                    self.info.waiting_room_started_at =
                        to_local(session.waiting_room_started_at, server_offset);
                    effects.push(Effect::Emit(LifecycleEvent::UpdateWaitingRoom));
                }
                SessionStatus::Active => {
                    self.info.session_started_at = to_local(session.session_started_at, server_offset);
                    if self.countdown_remaining.is_none() {
                        effects.push(Effect::Emit(LifecycleEvent::UpdateOngoingSession));
                        leave = self.check_quorum(num_players, &mut effects);
                    }
                }
            }
        }

        if session.player_control != self.control_before {
            self.control_before = session.player_control.clone();
            effects.push(Effect::Emit(if self.has_control {
                LifecycleEvent::GainedControl
            } else {
                LifecycleEvent::LostControl
            }));
        }

        if let Some(reason) = leave {
            effects.push(Effect::Leave(reason));
        }
        effects
    }

    fn check_quorum(&mut self, num_players: usize, effects: &mut Vec<Effect>) -> Option<EndReason> {
        if num_players >= self.config.min_players_needed {
            if self.below_min_armed {
                self.below_min_armed = false;
                effects.push(Effect::ClearBelowMinTimer);
            }
            return None;
        }

        let grace = self.config.max_duration_below_min_players_needed;
        if grace == 0 {
            log::info!(
                "{} below quorum ({num_players} < {}), leaving",
                self.info.player_id,
                self.config.min_players_needed
            );
            return Some(EndReason::BelowMinimum);
        }
        if self.has_control && !self.below_min_armed {
            log::info!("{} below quorum, ending in {grace}s unless players return", self.info.player_id);
            self.below_min_armed = true;
            effects.push(Effect::ArmBelowMinTimer(grace));
        }
        None
    }

    /// One tick of the waiting-room countdown.
    pub fn on_countdown_tick(&mut self) -> Vec<Effect> {
        match self.countdown_remaining {
            None => Vec::new(),
            Some(0) => {
                self.countdown_remaining = None;
                self.info.countdown = None;
                self.info.status = ClientStatus::SessionStarted;
                let Some(session_id) = self.info.session_id.clone() else {
                    return vec![Effect::StopCountdown];
                };
                log::info!("{} started session {session_id}", self.info.player_id);
                let mut effects = vec![
                    Effect::StopCountdown,
                    Effect::AttachState(session_id),
                    Effect::Emit(LifecycleEvent::StartSession),
                ];
                // Players may have left while the countdown ran.
                if let Some(reason) = self.check_quorum(self.info.num_players, &mut effects) {
                    effects.push(Effect::Leave(reason));
                }
                effects
            }
            Some(remaining) => {
                self.info.status = ClientStatus::WaitingRoomCountdown;
                self.info.countdown = Some(remaining);
                self.countdown_remaining = Some(remaining - 1);
                vec![Effect::Emit(LifecycleEvent::UpdateWaitingRoom)]
            }
        }
    }

    /// The below-quorum grace period ran out.
    pub fn on_below_min_timeout(&mut self) -> Vec<Effect> {
        if !self.below_min_armed {
            return Vec::new();
        }
        self.below_min_armed = false;
        if self.session_started && self.info.num_players < self.config.min_players_needed {
            vec![Effect::Leave(EndReason::BelowMinimum)]
        } else {
            Vec::new()
        }
    }

    /// The store connection dropped.
    pub fn on_disconnected(&mut self) -> Vec<Effect> {
        if !self.session_initiated {
            return Vec::new();
        }
        log::warn!("{} lost the store connection", self.info.player_id);
        self.end(EndReason::Disconnected)
    }

    /// Finish the current session (or a refused join) and reset.
    pub fn end(&mut self, reason: EndReason) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.countdown_remaining.take().is_some() {
            effects.push(Effect::StopCountdown);
        }
        if std::mem::take(&mut self.below_min_armed) {
            effects.push(Effect::ClearBelowMinTimer);
        }
        if self.session_initiated {
            effects.push(Effect::Teardown);
        }

        self.session_initiated = false;
        self.session_started = false;
        self.has_control = false;
        self.control_before = None;
        self.num_players_before = 0;
        self.info.session_id = None;
        self.info.session_index = None;
        self.info.countdown = None;
        self.info.status = ClientStatus::LeaveSession;
        self.info.end_reason = Some(reason);

        log::info!("{} session ended: {reason}", self.info.player_id);
        effects.push(Effect::Emit(LifecycleEvent::EndSession));
        effects
    }
}

/// Convert a server timestamp to the local clock.
fn to_local(server_ms: u64, server_offset: i64) -> u64 {
    if server_ms == 0 {
        return 0;
    }
    (server_ms as i64).saturating_sub(server_offset).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FinishStatus, FocusStatus, PlayerSessionState, Session};
    use crate::registry::{self, TransitionContext};

    fn step(
        registry: &Registry,
        config: &SessionConfig,
        f: impl FnOnce(&Registry, &TransitionContext<'_>) -> registry::Transition,
    ) -> Registry {
        let ctx = TransitionContext {
            config,
            now: 1_000,
            new_session_id: "s1",
            focus: FocusStatus::Focus,
        };
        let t = f(registry, &ctx);
        assert!(t.allowed);
        t.registry
    }

    fn joined(config: &SessionConfig, players: &[&str]) -> Registry {
        let mut r = Registry::default();
        for p in players {
            r = step(&r, config, |r, c| registry::join(r, p, c));
        }
        r
    }

    fn events(effects: &[Effect]) -> Vec<LifecycleEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(ev) => Some(*ev),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_end_reason_codes() {
        assert_eq!(EndReason::JoinRefused.code(), 1);
        assert_eq!(EndReason::Disconnected.code(), 2);
        assert_eq!(EndReason::BelowMinimum.code(), 3);
        assert_eq!(EndReason::BelowMinimum.message(), "fell below minimum");
        assert_eq!(EndReason::JoinRefused.to_string(), "no sessions available (code 1)");
    }

    #[test]
    fn test_waiting_room_then_start() {
        let config = SessionConfig::for_testing(2, 2);
        let mut x = SessionLifecycleController::new("x".into(), config.clone());

        let r = joined(&config, &["x"]);
        let fx = x.on_registry(&r, 0);
        assert_eq!(
            events(&fx),
            vec![LifecycleEvent::JoinedWaitingRoom, LifecycleEvent::GainedControl]
        );
        assert_eq!(x.info().status, ClientStatus::WaitingRoomStarted);
        assert_eq!(fx[0], Effect::BindState("s1".into()));
        assert_eq!(x.info().arrival_index, Some(1));
        assert_eq!(x.info().session_id.as_deref(), Some("s1"));

        // Same snapshot again: nothing new.
        assert!(x.on_registry(&r, 0).is_empty());

        let r = joined(&config, &["x", "y"]);
        let fx = x.on_registry(&r, 0);
        assert_eq!(
            fx,
            vec![
                Effect::AttachState("s1".into()),
                Effect::Emit(LifecycleEvent::StartSession)
            ]
        );
        assert_eq!(x.info().status, ClientStatus::SessionStarted);
        assert_eq!(x.info().num_players, 2);
        assert_eq!(x.info().player_ids, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(x.info().arrival_indices, vec![1, 2]);
        assert!(x.has_control());
    }

    #[test]
    fn test_second_arrival_sees_active_session_directly() {
        let config = SessionConfig::for_testing(2, 2);
        let mut y = SessionLifecycleController::new("y".into(), config.clone());
        let r = joined(&config, &["x", "y"]);
        let fx = y.on_registry(&r, 0);
        assert_eq!(
            events(&fx),
            vec![LifecycleEvent::StartSession, LifecycleEvent::LostControl]
        );
        assert!(!y.has_control());
    }

    #[test]
    fn test_countdown_ticks_then_starts() {
        let mut config = SessionConfig::for_testing(2, 2);
        config.exit_delay_waiting_room = 3;
        let mut x = SessionLifecycleController::new("x".into(), config.clone());
        x.on_registry(&joined(&config, &["x"]), 0);

        let fx = x.on_registry(&joined(&config, &["x", "y"]), 0);
        assert_eq!(fx, vec![Effect::BindState("s1".into()), Effect::StartCountdown(3)]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            assert_eq!(events(&x.on_countdown_tick()), vec![LifecycleEvent::UpdateWaitingRoom]);
            assert_eq!(x.info().status, ClientStatus::WaitingRoomCountdown);
            seen.push(x.info().countdown.unwrap());
        }
        assert_eq!(seen, vec![3, 2, 1]);

        let fx = x.on_countdown_tick();
        assert_eq!(
            fx,
            vec![
                Effect::StopCountdown,
                Effect::AttachState("s1".into()),
                Effect::Emit(LifecycleEvent::StartSession)
            ]
        );
        assert_eq!(x.info().countdown, None);
        assert!(x.on_countdown_tick().is_empty());
    }

    #[test]
    fn test_count_change_during_countdown_is_quiet() {
        let mut config = SessionConfig::for_testing(2, 3);
        config.exit_delay_waiting_room = 3;
        let mut x = SessionLifecycleController::new("x".into(), config.clone());
        x.on_registry(&joined(&config, &["x", "y"]), 0);
        x.on_countdown_tick();

        let fx = x.on_registry(&joined(&config, &["x", "y", "z"]), 0);
        assert!(events(&fx).is_empty());
        assert_eq!(x.info().num_players, 3);
        assert_eq!(x.info().countdown, Some(3));
    }

    #[test]
    fn test_countdown_ending_below_quorum_leaves() {
        let mut config = SessionConfig::for_testing(2, 2);
        config.exit_delay_waiting_room = 2;
        let mut x = SessionLifecycleController::new("x".into(), config.clone());
        let r = joined(&config, &["x", "y"]);
        assert!(x.on_registry(&r, 0).contains(&Effect::StartCountdown(2)));
        x.on_countdown_tick();

        let r = step(&r, &config, |r, c| registry::remove(r, "y", FinishStatus::Normal, c));
        assert!(events(&x.on_registry(&r, 0)).is_empty());
        assert_eq!(x.info().num_players, 1);

        x.on_countdown_tick();
        let fx = x.on_countdown_tick();
        assert_eq!(
            fx,
            vec![
                Effect::StopCountdown,
                Effect::AttachState("s1".into()),
                Effect::Emit(LifecycleEvent::StartSession),
                Effect::Leave(EndReason::BelowMinimum)
            ]
        );
    }

    #[test]
    fn test_countdown_ending_below_quorum_arms_grace_timer() {
        let mut config = SessionConfig::for_testing(2, 2);
        config.exit_delay_waiting_room = 1;
        config.max_duration_below_min_players_needed = 5;
        let mut x = SessionLifecycleController::new("x".into(), config.clone());
        let r = joined(&config, &["x", "y"]);
        x.on_registry(&r, 0);
        x.on_countdown_tick();

        let r = step(&r, &config, |r, c| registry::remove(r, "y", FinishStatus::Normal, c));
        x.on_registry(&r, 0);
        let fx = x.on_countdown_tick();
        assert!(fx.contains(&Effect::ArmBelowMinTimer(5)));
        assert!(!fx.iter().any(|e| matches!(e, Effect::Leave(_))));
        assert_eq!(x.on_below_min_timeout(), vec![Effect::Leave(EndReason::BelowMinimum)]);
    }

    #[test]
    fn test_moved_between_waiting_rooms_refreshes_info() {
        let mut config = SessionConfig::for_testing(3, 4);
        config.allow_replacements = true;

        let mut s1 = Session::waiting(1, 10);
        s1.admit("a", PlayerSessionState::arriving(0, FocusStatus::Focus, 10));
        s1.admit("b", PlayerSessionState::arriving(0, FocusStatus::Focus, 11));
        registry::elect_controller(&mut s1);
        let mut s2 = Session::waiting(2, 20);
        s2.admit("c", PlayerSessionState::arriving(0, FocusStatus::Focus, 20));
        registry::elect_controller(&mut s2);
        let mut r = Registry::default();
        r.sessions.insert("S1".into(), s1);
        r.sessions.insert("S2".into(), s2);

        let mut c = SessionLifecycleController::new("c".into(), config.clone());
        c.on_registry(&r, 0);
        assert_eq!(c.info().session_id.as_deref(), Some("S2"));
        assert_eq!(c.info().arrival_index, Some(1));

        let r = step(&r, &config, |r, ctx| registry::remove(r, "a", FinishStatus::Normal, ctx));
        assert_eq!(r.session_of("c").map(String::as_str), Some("S1"));

        let fx = c.on_registry(&r, 0);
        assert_eq!(fx[0], Effect::BindState("S1".into()));
        assert_eq!(events(&fx)[0], LifecycleEvent::UpdateWaitingRoom);
        assert_eq!(
            events(&fx).iter().filter(|e| **e == LifecycleEvent::UpdateWaitingRoom).count(),
            1
        );
        assert_eq!(c.info().session_id.as_deref(), Some("S1"));
        assert_eq!(c.info().session_index, Some(1));
        assert_eq!(c.info().arrival_index, Some(3));
        assert_eq!(c.info().waiting_room_started_at, 10);
        assert_eq!(c.info().player_ids, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(c.info().status, ClientStatus::WaitingRoomStarted);
    }

    #[test]
    fn test_below_minimum_leaves_immediately() {
        let config = SessionConfig::for_testing(2, 2);
        let mut y = SessionLifecycleController::new("y".into(), config.clone());
        let r = joined(&config, &["x", "y"]);
        y.on_registry(&r, 0);

        let r = step(&r, &config, |r, c| registry::remove(r, "x", FinishStatus::Normal, c));
        let fx = y.on_registry(&r, 0);
        assert_eq!(
            fx,
            vec![
                Effect::Emit(LifecycleEvent::UpdateOngoingSession),
                Effect::Emit(LifecycleEvent::GainedControl),
                Effect::Leave(EndReason::BelowMinimum)
            ]
        );

        let fx = y.end(EndReason::BelowMinimum);
        assert_eq!(fx, vec![Effect::Teardown, Effect::Emit(LifecycleEvent::EndSession)]);
        assert_eq!(y.info().error_code(), 3);
        assert_eq!(y.info().status, ClientStatus::LeaveSession);
        assert!(!y.is_initiated());
    }

    #[test]
    fn test_grace_timer_armed_by_controller_only() {
        let mut config = SessionConfig::for_testing(3, 4);
        config.max_duration_below_min_players_needed = 10;
        let full = joined(&config, &["x", "y", "z"]);
        let mut x = SessionLifecycleController::new("x".into(), config.clone());
        let mut z = SessionLifecycleController::new("z".into(), config.clone());
        x.on_registry(&full, 0);
        z.on_registry(&full, 0);

        let r = step(&full, &config, |r, c| registry::remove(r, "y", FinishStatus::Normal, c));
        let fx = x.on_registry(&r, 0);
        assert!(fx.contains(&Effect::ArmBelowMinTimer(10)));
        assert!(!fx.iter().any(|e| matches!(e, Effect::Leave(_))));

        // A non-controller below quorum waits for the controller.
        let fx = z.on_registry(&r, 0);
        assert_eq!(events(&fx), vec![LifecycleEvent::UpdateOngoingSession]);
        assert!(!fx.iter().any(|e| matches!(e, Effect::ArmBelowMinTimer(_))));

        assert_eq!(x.on_below_min_timeout(), vec![Effect::Leave(EndReason::BelowMinimum)]);
        assert!(x.on_below_min_timeout().is_empty());
    }

    #[test]
    fn test_grace_timer_cleared_when_quorum_returns() {
        let mut config = SessionConfig::for_testing(2, 3);
        config.max_duration_below_min_players_needed = 10;
        let mut x = SessionLifecycleController::new("x".into(), config.clone());
        let r = joined(&config, &["x", "y"]);
        x.on_registry(&r, 0);

        let r = step(&r, &config, |r, c| registry::remove(r, "y", FinishStatus::Normal, c));
        assert!(x.on_registry(&r, 0).contains(&Effect::ArmBelowMinTimer(10)));

        let r = step(&r, &config, |r, c| registry::join(r, "w", c));
        let fx = x.on_registry(&r, 0);
        assert!(fx.contains(&Effect::ClearBelowMinTimer));
        assert!(x.on_below_min_timeout().is_empty());
    }

    #[test]
    fn test_forced_removal_ends_as_disconnected() {
        let config = SessionConfig::for_testing(2, 2);
        let mut x = SessionLifecycleController::new("x".into(), config.clone());
        x.on_registry(&joined(&config, &["x"]), 0);

        let fx = x.on_registry(&Registry::default(), 0);
        assert_eq!(fx, vec![Effect::Teardown, Effect::Emit(LifecycleEvent::EndSession)]);
        assert_eq!(x.info().end_reason, Some(EndReason::Disconnected));
        assert!(x.on_registry(&Registry::default(), 0).is_empty());
    }

    #[test]
    fn test_disconnect_before_join_is_ignored() {
        let mut x = SessionLifecycleController::new("x".into(), SessionConfig::default());
        assert!(x.on_disconnected().is_empty());
        assert_eq!(x.info().status, ClientStatus::Idle);
    }

    #[test]
    fn test_join_refused_reports_code_one() {
        let mut x = SessionLifecycleController::new("x".into(), SessionConfig::default());
        let fx = x.end(EndReason::JoinRefused);
        assert_eq!(fx, vec![Effect::Emit(LifecycleEvent::EndSession)]);
        assert_eq!(x.info().error_code(), 1);
        assert_eq!(x.info().error_message(), "no sessions available");
    }

    #[test]
    fn test_timestamps_converted_to_local_clock() {
        let config = SessionConfig::for_testing(2, 2);
        let mut x = SessionLifecycleController::new("x".into(), config.clone());
        x.on_registry(&joined(&config, &["x"]), 250);
        assert_eq!(x.info().waiting_room_started_at, 750);
        assert_eq!(to_local(0, 250), 0);
        assert_eq!(to_local(100, 250), 0);
    }

    #[test]
    fn test_session_info_serializes_camel_case() {
        let info = SessionInfo::new("p".into());
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["playerId"], "p");
        assert_eq!(value["status"], "idle");
        assert!(value.get("numPlayers").is_some());
    }
}
