//! Per-client session runtime.
//!
//! [`SessionClient`] is a cheap handle; the work happens on one spawned
//! task that owns the lifecycle controller and multiplexes every input
//! with `tokio::select!`:
//!
//! ```text
//!  SessionClient ──Command──┐
//!  registry subscription ───┤
//!  presence markers ────────┤                    ┌─► SessionHandler callbacks
//!  connection state ────────┼──► event loop ─────┼─► watch<SessionInfo>
//!  countdown interval ──────┤   (controller)     ├─► StateSync attach / detach
//!  below-min timer ─────────┤                    └─► registry / presence calls
//!  state listener changes ──┘
//! ```
//!
//! Registry changes reach the controller only through the store
//! subscription, in commit order. After this client's own join or leave
//! commits, queued snapshots are drained so a stale one cannot re-seat a
//! player that just left.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tandem_core::{
    generate_player_id, Effect, EndReason, FinishStatus, FocusStatus, LifecycleEvent, PlayerId,
    Registry, SessionInfo, SessionLifecycleController,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, Sleep};

use crate::config::ClientConfig;
use crate::error::SyncError;
use crate::handler::{SessionContext, SessionHandler, StateChange};
use crate::presence::PresenceMonitor;
use crate::recorder::Recorder;
use crate::sessions::SessionRegistry;
use crate::state_sync::StateSync;
use crate::store::{ChildEvent, KeyValueStore, Subscription};

/// Capacity of the command channel.
const COMMAND_QUEUE: usize = 32;

/// Countdown tick period.
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

enum Command {
    Join(oneshot::Sender<Result<bool, SyncError>>),
    Leave(oneshot::Sender<Result<(), SyncError>>),
    Focus(FocusStatus, oneshot::Sender<Result<(), SyncError>>),
    Shutdown(oneshot::Sender<()>),
}

enum Event {
    Command(Command),
    /// Every handle is gone
    Closed,
    Registry(Value),
    Presence(ChildEvent),
    ConnectionChanged,
    ConnectionClosed,
    CountdownTick,
    BelowMinTimeout,
    State(StateChange),
}

/// Handle to one player's session runtime.
pub struct SessionClient {
    player_id: PlayerId,
    commands: mpsc::Sender<Command>,
    info: watch::Receiver<SessionInfo>,
    state: StateSync,
    has_control: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SessionClient {
    /// Start a runtime for a freshly generated player id.
    pub async fn spawn(
        store: Arc<dyn KeyValueStore>,
        config: ClientConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, SyncError> {
        Self::spawn_as(generate_player_id(), store, config, handler).await
    }

    /// Start a runtime for a known player id.
    pub async fn spawn_as(
        player_id: impl Into<PlayerId>,
        store: Arc<dyn KeyValueStore>,
        config: ClientConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let player_id = player_id.into();
        let study_id = config.study_id.as_str();

        let recorder = Recorder::new(store.clone(), study_id, config.session_config.record_data);
        let registry = SessionRegistry::new(
            store.clone(),
            study_id,
            config.session_config.clone(),
            recorder.clone(),
        );
        let presence = PresenceMonitor::new(store.clone(), study_id, &player_id, registry.clone());
        let state = StateSync::new(store.clone(), study_id, &player_id, handler.clone(), recorder);

        let registry_rx = store.subscribe_value(registry.path()).await?;
        let connection = store.subscribe_connection_state();

        let lifecycle = SessionLifecycleController::new(player_id.clone(), config.session_config.clone());
        let (info_tx, info_rx) = watch::channel(lifecycle.info().clone());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let has_control = Arc::new(AtomicBool::new(false));

        let runtime = ClientRuntime {
            store,
            handler,
            registry,
            presence,
            state: state.clone(),
            lifecycle,
            listener_paths: config.effective_listener_paths(),
            info_tx,
            has_control: has_control.clone(),
            changes_tx,
            changes_rx,
            registry_rx,
            presence_rx: None,
            connection,
            connection_open: true,
            countdown: None,
            below_min: None,
            focus: FocusStatus::Focus,
            seated: false,
        };
        let task = tokio::spawn(runtime.run(command_rx));

        log::debug!("Session client {player_id} started");
        Ok(Self {
            player_id,
            commands: command_tx,
            info: info_rx,
            state,
            has_control,
            task,
        })
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Ask the registry for a seat. `Ok(false)` means the join was refused
    /// (the handler also gets `end_session` with `JoinRefused`).
    pub async fn join_session(&self) -> Result<bool, SyncError> {
        self.request(Command::Join).await?
    }

    /// Leave the current session. A no-op outside a session.
    pub async fn leave_session(&self) -> Result<(), SyncError> {
        self.request(Command::Leave).await?
    }

    /// Report window focus. Remembered for the next join when not seated.
    pub async fn set_focus(&self, status: FocusStatus) -> Result<(), SyncError> {
        self.request(|reply| Command::Focus(status, reply)).await?
    }

    /// Write to the session state tree. Accepted from the waiting room on;
    /// `NoActiveSession` before a seat is taken or after the session ends.
    pub fn direct_update(&self, path: &str, value: Value) -> Result<(), SyncError> {
        self.state.direct_update(path, value)
    }

    pub fn direct_update_unrecorded(&self, path: &str, value: Value) -> Result<(), SyncError> {
        self.state.direct_update_unrecorded(path, value)
    }

    pub async fn transactional_update(
        &self,
        path: &str,
        action: &str,
        args: Value,
    ) -> Result<bool, SyncError> {
        self.state.transactional_update(path, action, args).await
    }

    /// Wait for queued direct updates to land.
    pub async fn flush(&self) {
        self.state.flush().await;
    }

    pub fn state(&self) -> &StateSync {
        &self.state
    }

    /// Snapshot of the current session info.
    pub fn session_info(&self) -> SessionInfo {
        self.info.borrow().clone()
    }

    /// Receiver updated on every lifecycle event.
    pub fn subscribe_info(&self) -> watch::Receiver<SessionInfo> {
        self.info.clone()
    }

    pub fn has_control(&self) -> bool {
        self.has_control.load(Ordering::SeqCst)
    }

    /// Leave any session and stop the runtime.
    pub async fn shutdown(self) -> Result<(), SyncError> {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = done.await;
        }
        self.task.await.map_err(|_| SyncError::ClientClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::ClientClosed)?;
        response.await.map_err(|_| SyncError::ClientClosed)
    }
}

// ─── Runtime ────────────────────────────────────────────────────

struct ClientRuntime {
    store: Arc<dyn KeyValueStore>,
    handler: Arc<dyn SessionHandler>,
    registry: SessionRegistry,
    presence: PresenceMonitor,
    state: StateSync,
    lifecycle: SessionLifecycleController,
    listener_paths: Vec<String>,
    info_tx: watch::Sender<SessionInfo>,
    has_control: Arc<AtomicBool>,
    changes_tx: mpsc::UnboundedSender<StateChange>,
    changes_rx: mpsc::UnboundedReceiver<StateChange>,
    registry_rx: Subscription<Value>,
    presence_rx: Option<Subscription<ChildEvent>>,
    connection: watch::Receiver<bool>,
    connection_open: bool,
    countdown: Option<Interval>,
    below_min: Option<Pin<Box<Sleep>>>,
    /// Focus to report on the next join
    focus: FocusStatus,
    /// Join committed and not yet left
    seated: bool,
}

impl ClientRuntime {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let event = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => Event::Closed,
                },
                Some(value) = self.registry_rx.recv() => Event::Registry(value),
                Some(event) = next_marker(&mut self.presence_rx) => Event::Presence(event),
                changed = self.connection.changed(), if self.connection_open => match changed {
                    Ok(()) => Event::ConnectionChanged,
                    Err(_) => Event::ConnectionClosed,
                },
                _ = next_tick(&mut self.countdown) => Event::CountdownTick,
                _ = expiry(&mut self.below_min) => Event::BelowMinTimeout,
                Some(change) = self.changes_rx.recv() => Event::State(change),
            };

            match event {
                Event::Command(Command::Join(reply)) => {
                    let result = self.join().await;
                    let _ = reply.send(result);
                }
                Event::Command(Command::Leave(reply)) => {
                    let result = self.leave(EndReason::Left).await;
                    let _ = reply.send(result);
                }
                Event::Command(Command::Focus(status, reply)) => {
                    let result = self.set_focus(status).await;
                    let _ = reply.send(result);
                }
                Event::Command(Command::Shutdown(reply)) => {
                    self.stop().await;
                    let _ = reply.send(());
                    break;
                }
                Event::Closed => {
                    self.stop().await;
                    break;
                }
                Event::Registry(value) => match Registry::from_value(&value) {
                    Ok(registry) => self.apply_registry(&registry).await,
                    Err(e) => log::warn!("Ignoring malformed registry notification: {e}"),
                },
                Event::Presence(marker) => {
                    if let Err(e) = self.presence.handle(&marker).await {
                        log::warn!("Eviction of {} failed: {e}", marker.key);
                    }
                }
                Event::ConnectionChanged => {
                    let connected = *self.connection.borrow_and_update();
                    if !connected {
                        let effects = self.lifecycle.on_disconnected();
                        self.run_effects(effects).await;
                    }
                }
                Event::ConnectionClosed => self.connection_open = false,
                Event::CountdownTick => {
                    let effects = self.lifecycle.on_countdown_tick();
                    self.run_effects(effects).await;
                }
                Event::BelowMinTimeout => {
                    self.below_min = None;
                    let effects = self.lifecycle.on_below_min_timeout();
                    self.run_effects(effects).await;
                }
                Event::State(change) => self.deliver_state_change(change),
            }
            self.publish();
        }

        self.state.detach();
        log::debug!("Session client {} stopped", self.lifecycle.player_id());
    }

    // ─── Commands ───────────────────────────────────────────────

    async fn join(&mut self) -> Result<bool, SyncError> {
        if self.lifecycle.is_initiated() || self.seated {
            return Err(SyncError::AlreadyJoined);
        }
        let player_id = self.lifecycle.player_id().to_string();

        self.presence.arm().await?;
        let update = match self.registry.join(&player_id, self.focus).await {
            Ok(update) => update,
            Err(e) => {
                self.disarm_presence().await;
                return Err(e);
            }
        };

        if !update.success {
            self.disarm_presence().await;
            log::info!("{player_id} could not join: no sessions available");
            let effects = self.lifecycle.end(EndReason::JoinRefused);
            self.run_effects(effects).await;
            return Ok(false);
        }

        self.seated = true;
        match self.presence.watch().await {
            Ok(markers) => self.presence_rx = Some(markers),
            Err(e) => log::warn!("{player_id} cannot watch presence markers: {e}"),
        }
        if let Some(latest) = self.drain_registry() {
            self.apply_registry(&latest).await;
        }
        Ok(true)
    }

    async fn leave(&mut self, reason: EndReason) -> Result<(), SyncError> {
        if !self.lifecycle.is_initiated() && !self.seated {
            return Ok(());
        }
        let (result, effects) = self.depart(reason).await;
        self.run_effects(effects).await;
        result
    }

    async fn set_focus(&mut self, status: FocusStatus) -> Result<(), SyncError> {
        self.focus = status;
        if self.lifecycle.is_initiated() || self.seated {
            self.registry
                .set_focus(self.lifecycle.player_id(), status)
                .await?;
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if let Err(e) = self.leave(EndReason::Left).await {
            log::warn!("{} failed to leave on shutdown: {e}", self.lifecycle.player_id());
        }
    }

    /// Leave the registry and reset the controller. Returns the
    /// controller's end effects for the caller to run.
    async fn depart(&mut self, reason: EndReason) -> (Result<(), SyncError>, Vec<Effect>) {
        let player_id = self.lifecycle.player_id().to_string();

        if self.lifecycle.is_initiated() {
            let ctx = SessionContext {
                info: self.lifecycle.info(),
                state: &self.state,
                has_control: self.lifecycle.has_control(),
            };
            self.handler.remove_player_state(&ctx);
        }
        self.state.flush().await;

        let finish = match reason {
            EndReason::Left => FinishStatus::Normal,
            _ => FinishStatus::Abnormal,
        };
        let result = self
            .registry
            .remove(&player_id, finish, &player_id)
            .await
            .map(|_| ());
        self.disarm_presence().await;

        self.seated = false;
        self.presence_rx = None;
        self.drain_registry();

        log::info!("{player_id} leaving session {:?}: {reason}", self.lifecycle.info().session_id);
        (result, self.lifecycle.end(reason))
    }

    // ─── Registry ───────────────────────────────────────────────

    async fn apply_registry(&mut self, registry: &Registry) {
        if !self.lifecycle.is_initiated() && !self.seated {
            return;
        }
        let effects = self
            .lifecycle
            .on_registry(registry, self.store.server_time_offset());
        self.run_effects(effects).await;
    }

    /// Discard queued registry snapshots, returning the newest.
    fn drain_registry(&mut self) -> Option<Registry> {
        let mut latest = None;
        while let Some(value) = self.registry_rx.try_recv() {
            latest = Some(value);
        }
        latest.and_then(|value| match Registry::from_value(&value) {
            Ok(registry) => Some(registry),
            Err(e) => {
                log::warn!("Ignoring malformed registry notification: {e}");
                None
            }
        })
    }

    // ─── Effects ────────────────────────────────────────────────

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Emit(event) => self.emit(event),
                Effect::StartCountdown(seconds) => {
                    log::debug!("Countdown of {seconds}s started");
                    self.countdown = Some(tokio::time::interval(COUNTDOWN_TICK));
                }
                Effect::StopCountdown => self.countdown = None,
                Effect::BindState(session_id) => self.state.bind(&session_id),
                Effect::AttachState(session_id) => {
                    if let Err(e) = self
                        .state
                        .attach(&session_id, &self.listener_paths, self.changes_tx.clone())
                        .await
                    {
                        log::error!("Failed to attach state of session {session_id}: {e}");
                    }
                }
                Effect::ArmBelowMinTimer(seconds) => {
                    self.below_min = Some(Box::pin(tokio::time::sleep(Duration::from_secs(seconds))));
                }
                Effect::ClearBelowMinTimer => self.below_min = None,
                Effect::Leave(reason) => {
                    let (result, effects) = self.depart(reason).await;
                    if let Err(e) = result {
                        log::warn!("{} failed to leave: {e}", self.lifecycle.player_id());
                    }
                    queue.extend(effects);
                }
                Effect::Teardown => {
                    self.state.detach();
                    self.countdown = None;
                    self.below_min = None;
                    self.presence_rx = None;
                    self.seated = false;
                    self.disarm_presence().await;
                }
            }
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.publish();
        let ctx = SessionContext {
            info: self.lifecycle.info(),
            state: &self.state,
            has_control: self.lifecycle.has_control(),
        };
        log::debug!("{} -> {event:?}", self.lifecycle.player_id());
        match event {
            LifecycleEvent::JoinedWaitingRoom => self.handler.joined_waiting_room(&ctx),
            LifecycleEvent::UpdateWaitingRoom => self.handler.update_waiting_room(&ctx),
            LifecycleEvent::StartSession => self.handler.start_session(&ctx),
            LifecycleEvent::UpdateOngoingSession => self.handler.update_ongoing_session(&ctx),
            LifecycleEvent::EndSession => self.handler.end_session(&ctx),
            LifecycleEvent::GainedControl => self.handler.gained_control(&ctx),
            LifecycleEvent::LostControl => self.handler.lost_control(&ctx),
        }
    }

    fn publish(&self) {
        self.has_control
            .store(self.lifecycle.has_control(), Ordering::SeqCst);
        let info = self.lifecycle.info();
        self.info_tx.send_if_modified(|current| {
            if *current == *info {
                false
            } else {
                *current = info.clone();
                true
            }
        });
    }

    fn deliver_state_change(&self, change: StateChange) {
        // Changes forwarded before a detach may still be queued.
        if self.state.session_id().as_deref() != Some(change.session_id.as_str()) {
            return;
        }
        log::trace!("{} <- {:?} {}/{}", self.lifecycle.player_id(), change.kind, change.path, change.key);
        let ctx = SessionContext {
            info: self.lifecycle.info(),
            state: &self.state,
            has_control: self.lifecycle.has_control(),
        };
        self.handler.receive_state_change(&ctx, &change);
    }

    async fn disarm_presence(&self) {
        if let Err(e) = self.presence.disarm().await {
            log::debug!("Presence disarm for {} failed: {e}", self.lifecycle.player_id());
        }
    }
}

async fn next_marker(markers: &mut Option<Subscription<ChildEvent>>) -> Option<ChildEvent> {
    match markers {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(countdown: &mut Option<Interval>) {
    match countdown {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expiry(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
