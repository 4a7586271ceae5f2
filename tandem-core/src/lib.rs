//! # tandem-core — Session registry model and lifecycle for Tandem
//!
//! Runtime-free half of Tandem: the typed registry document, the pure
//! matchmaking transitions that run inside store transactions, and the
//! per-client lifecycle state machine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  snapshot   ┌──────────────────┐  new snapshot
//! │ store        │ ──────────► │ registry::join   │ ─────────────► commit / retry
//! │ transaction  │             │ registry::remove │
//! └──────────────┘             │ registry::set_.. │
//!                              └──────────────────┘
//! ┌──────────────┐  snapshot   ┌──────────────────┐  Vec<Effect>
//! │ registry     │ ──────────► │ SessionLifecycle │ ─────────────► client event loop
//! │ listener     │             │ Controller       │
//! └──────────────┘             └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`] — Sessions, players and the registry document
//! - [`config`] — `SessionConfig` (camelCase JSON options)
//! - [`registry`] — join / remove / set_focus / control election
//! - [`lifecycle`] — waiting room, countdown, start and end of a session

pub mod config;
pub mod lifecycle;
pub mod model;
pub mod registry;

// Re-exports for convenience
pub use config::{ConfigError, SessionConfig};
pub use lifecycle::{
    ClientStatus, Effect, EndReason, LifecycleEvent, SessionInfo, SessionLifecycleController,
};
pub use model::{
    generate_player_id, FinishStatus, FocusStatus, ModelError, PlayerId, PlayerSessionState,
    Registry, Session, SessionId, SessionStatus,
};
pub use registry::{RegistryAction, Transition, TransitionContext};
