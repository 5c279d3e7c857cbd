//! # Drift Engine
//!
//! Deterministic change reconciliation for a local-first vault.
//!
//! This crate is the pure core of the sync pipeline: it decides, for any mix
//! of local and remote changes, which values win and which change sets each
//! side must apply to converge. It has no I/O, no clocks it did not receive
//! as arguments, and no randomness - the same inputs always produce the same
//! outputs.
//!
//! ## Core Concepts
//!
//! ### Change Records
//!
//! Every mutation travels as a [`ChangeRecord`]: an insert, update, or delete
//! against one `(table, key)` pair, tagged with a [`Source`] that says where
//! it came from and whether it should be re-broadcast.
//!
//! ### Entities
//!
//! Reconciliation only types the fields it compares ([`Entity::created_at`],
//! [`Entity::updated_at`], the optional day key, document content); all other
//! table fields ride along untouched. Updates carry a [`Patch`] with the same
//! shape, all fields optional.
//!
//! ### Reconciliation
//!
//! Each [`Table`] is bound to a [`MergeStrategy`]:
//! - [`MergeStrategy::LastWriterWins`]: per-entity comparison of
//!   `updated_at`, handled by [`reconcile`](reconcile::reconcile).
//! - [`MergeStrategy::DailyDoc`]: a vault holds at most one document per
//!   calendar day, so colliding documents are folded into one canonical
//!   survivor plus tombstones by
//!   [`merge_daily_docs`](daily::merge_daily_docs).
//!
//! Both resolvers emit two change sets: one to apply to the local store and
//! one to publish so other clients converge on the same resolution.

pub mod change;
pub mod daily;
pub mod entity;
pub mod error;
pub mod reconcile;
pub mod table;

pub use change::{parse_batch, ChangeKind, ChangeRecord, Source};
pub use daily::{merge_daily_docs, ResolvedChanges};
pub use entity::{Entity, Patch};
pub use error::{Error, Result};
pub use reconcile::{reconcile, Resolution};
pub use table::{MergeStrategy, Table};

/// Type aliases for clarity
pub type EntityId = String;
pub type VaultId = String;
/// Calendar day a daily document claims, `YYYY-MM-DD` on the wire.
pub type DayKey = chrono::NaiveDate;
