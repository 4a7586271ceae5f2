//! # tandem-sync — Store-backed multiplayer sessions for Tandem
//!
//! Async half of Tandem: runs the `tandem-core` transitions inside
//! key-value store transactions, keeps a shared state tree per session,
//! evicts disconnected players and drives each client's lifecycle from
//! store notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  Command   ┌──────────────────────────────┐
//! │ SessionClient │ ─────────► │ event loop (one task/client) │ ──► SessionHandler
//! │ (per player)  │            │  SessionLifecycleController  │
//! └───────────────┘            └──┬─────────┬──────────┬──────┘
//!                                 │         │          │
//!                                 ▼         ▼          ▼
//!                     ┌─────────────────┐ ┌──────────┐ ┌─────────────────┐
//!                     │ SessionRegistry │ │StateSync │ │ PresenceMonitor │
//!                     └────────┬────────┘ └────┬─────┘ └────────┬────────┘
//!                              └───────────────┼────────────────┘
//!                                              ▼
//!                                  ┌────────────────────────┐
//!                                  │ dyn KeyValueStore      │ ──► Recorder (audit log)
//!                                  │ (MemoryConnection, ..) │
//!                                  └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`] — `KeyValueStore` contract and the in-process `MemoryDatabase`
//! - [`sessions`] — `SessionRegistry`: join / remove / set_focus as transactions
//! - [`state_sync`] — shared state tree: direct and transactional updates
//! - [`presence`] — on-disconnect markers and cooperative eviction
//! - [`recorder`] — `recordData` audit log
//! - [`handler`] — consumer callbacks
//! - [`client`] — `SessionClient` runtime
//! - [`config`] — `ClientConfig`
//! - [`path`] — store path layout

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod path;
pub mod presence;
pub mod recorder;
pub mod sessions;
pub mod state_sync;
pub mod store;

// Re-exports for convenience
pub use client::SessionClient;
pub use config::ClientConfig;
pub use error::{StoreError, SyncError};
pub use handler::{Evaluation, SessionContext, SessionHandler, StateChange};
pub use presence::PresenceMonitor;
pub use recorder::Recorder;
pub use sessions::{RegistryUpdate, SessionRegistry};
pub use state_sync::StateSync;
pub use store::{
    ChildEvent, ChildEventKind, KeyValueStore, MemoryConnection, MemoryDatabase, Subscription,
    TxDecision, TxOutcome,
};
pub use tandem_core::RegistryAction;
