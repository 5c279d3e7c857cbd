//! # Drift Session
//!
//! The side-effecting half of the sync pipeline: per-vault sync sessions
//! driving the pure resolvers in `drift-engine` against a local store and an
//! already-connected sync channel.
//!
//! A [`SessionManager`] holds one tokio task per connected vault. Commands
//! for a vault apply strictly in arrival order, so reconciliation passes
//! never interleave within a vault, while vaults run concurrently. The
//! [`SyncSession`] inside each task routes batches through the engine,
//! commits the winning local set through the [`applier`], publishes the
//! remote set, and retries store-rejected table batches with exponential
//! backoff.

pub mod applier;
pub mod command;
pub mod config;
pub mod error;
pub mod gate;
pub mod manager;
pub mod session;
pub mod store;

pub use applier::{AppliedBatch, ApplyError, FailedTable};
pub use command::{request_id, SessionCommand, SessionEvent};
pub use config::{Config, ConfigError};
pub use error::{Result, SessionError};
pub use gate::{AlwaysUnlocked, UnlockGate};
pub use manager::SessionManager;
pub use session::{BatchOutcome, SessionState, SessionStats, SyncSession};
pub use store::{LocalStore, MemoryStore, StoreError, TableBatch, WriteMeta};
