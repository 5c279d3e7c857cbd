//! Per-vault sync session.
//!
//! A session owns everything one vault needs while connected: the store
//! handle, the encryption gate, the outbound half of the sync channel, and a
//! retry queue of table batches the store rejected. Batches flow through in
//! arrival order; the owner (normally the [`SessionManager`]) guarantees no
//! two reconciliation passes for one vault interleave.
//!
//! [`SessionManager`]: crate::manager::SessionManager

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use drift_engine::{
    merge_daily_docs, parse_batch, reconcile, ChangeRecord, DayKey, Entity, EntityId,
    MergeStrategy, Table, VaultId,
};
use tokio::sync::mpsc;

use crate::applier::{self, FailedTable};
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::gate::UnlockGate;
use crate::store::LocalStore;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected; batches are refused
    Disconnected,
    /// Gate passed, channel being attached
    Connecting,
    /// Connected, no batch yet
    Connected,
    /// A batch is being reconciled and applied
    Accepting,
    /// Connected, between batches
    Idle,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub batches_accepted: u64,
    pub changes_applied: u64,
    pub changes_published: u64,
    pub malformed_dropped: u64,
    pub tables_retried: u64,
}

/// Outcome of one accepted batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    pub published: usize,
    pub dropped: usize,
}

struct RetryEntry {
    batch: FailedTable,
    attempts: u32,
}

/// One vault's sync session.
pub struct SyncSession {
    vault: VaultId,
    store: Arc<dyn LocalStore>,
    gate: Arc<dyn UnlockGate>,
    outbound: mpsc::UnboundedSender<ChangeRecord>,
    config: Config,
    state: SessionState,
    retry_queue: VecDeque<RetryEntry>,
    stats: SessionStats,
}

impl SyncSession {
    pub fn new(
        vault: VaultId,
        store: Arc<dyn LocalStore>,
        gate: Arc<dyn UnlockGate>,
        outbound: mpsc::UnboundedSender<ChangeRecord>,
        config: Config,
    ) -> Self {
        Self {
            vault,
            store,
            gate,
            outbound,
            config,
            state: SessionState::Disconnected,
            retry_queue: VecDeque::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn vault(&self) -> &VaultId {
        &self.vault
    }

    /// Connect the session. Refused while the vault is locked; the state
    /// stays `Disconnected` and the caller may retry after unlocking.
    pub fn connect(&mut self) -> Result<()> {
        if !self.gate.is_unlockable(&self.vault) {
            tracing::info!(vault = %self.vault, "vault locked, refusing to connect");
            return Err(SessionError::VaultLocked(self.vault.clone()));
        }
        self.state = SessionState::Connecting;
        tracing::info!(vault = %self.vault, "sync session connected");
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Disconnect. Queued retries get one last attempt, then the queue is
    /// dropped and further batches are refused.
    pub fn disconnect(&mut self) {
        while let Some(entry) = self.retry_queue.pop_front() {
            let outcome = applier::apply(&*self.store, &self.vault, entry.batch.changes);
            if !outcome.is_clean() {
                tracing::warn!(
                    vault = %self.vault,
                    table = %entry.batch.error.table,
                    "dropping unapplied batch on disconnect"
                );
            }
        }
        self.state = SessionState::Disconnected;
        tracing::info!(vault = %self.vault, "sync session disconnected");
    }

    /// Reconcile one batch arriving from the sync channel.
    ///
    /// Malformed records are dropped with a warning and the batch continues.
    /// Documents go through the daily-doc resolver, every other table through
    /// per-key last-writer-wins. The winning local set commits through the
    /// applier; the remote set is published so other clients converge.
    pub fn accept_remote_changes(&mut self, batch: Vec<serde_json::Value>) -> Result<BatchOutcome> {
        self.ensure_connected()?;
        self.state = SessionState::Accepting;

        let records = self.parse(batch);
        let mut to_apply = Vec::new();
        let mut to_publish = Vec::new();

        let (documents, generic): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.table.strategy() == MergeStrategy::DailyDoc);

        if !documents.is_empty() {
            let existing = self.store.list(&self.vault, Table::Documents)?;
            let resolved = merge_daily_docs(&existing, documents, Utc::now());
            for day in &resolved.ambiguous_days {
                tracing::warn!(vault = %self.vault, %day, "created_at tie in daily merge, resolved by id order");
            }
            to_apply.extend(resolved.applicable_local);
            to_publish.extend(resolved.applicable_remote);
        }

        // Later records reconcile against the values accepted so far in this
        // batch, not the pre-batch store state; otherwise a stale record
        // sequenced after a newer one would win on arrival order.
        let mut staged: HashMap<(Table, EntityId), Option<Entity>> = HashMap::new();
        for record in generic {
            let slot = (record.table, record.key.clone());
            let current = match staged.get(&slot) {
                Some(view) => view.clone(),
                None => self.store.retrieve(&self.vault, record.table, &record.key)?,
            };
            let resolution = reconcile(current.as_ref(), &record);
            for change in &resolution.local {
                if change.is_delete() {
                    staged.insert(slot.clone(), None);
                } else if let Some(entity) = &change.obj {
                    staged.insert(slot.clone(), Some(entity.clone()));
                } else if let Some(mods) = &change.mods {
                    if let Some(mut entity) = current.clone() {
                        entity.apply_patch(mods);
                        staged.insert(slot.clone(), Some(entity));
                    }
                }
            }
            to_apply.extend(resolution.local);
            to_publish.extend(resolution.remote);
        }

        let outcome = self.commit(to_apply, to_publish)?;
        self.state = SessionState::Idle;
        Ok(outcome)
    }

    /// Reconcile one batch of locally-originated changes before publishing.
    ///
    /// Generic-table changes are already in the store (they came off its
    /// mutation log) and publish as-is. Document changes for a day that holds
    /// more than one doc run through the daily-doc resolver first, so a
    /// locally created duplicate day is folded before it ever reaches another
    /// client; a doc alone on its day is just as settled as a generic change
    /// and goes out verbatim.
    pub fn accept_local_changes(&mut self, batch: Vec<serde_json::Value>) -> Result<BatchOutcome> {
        self.ensure_connected()?;
        self.state = SessionState::Accepting;

        let records = self.parse(batch);
        let mut to_apply = Vec::new();
        let mut to_publish = Vec::new();

        let (documents, generic): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.table.strategy() == MergeStrategy::DailyDoc);

        if !documents.is_empty() {
            let existing = self.store.list(&self.vault, Table::Documents)?;

            // A doc this batch also deletes is not a collision candidate.
            let pending_deletes: BTreeSet<EntityId> = documents
                .iter()
                .filter(|record| record.is_delete())
                .map(|record| record.key.clone())
                .collect();

            let mut day_ids: BTreeMap<DayKey, BTreeSet<EntityId>> = BTreeMap::new();
            for doc in &existing {
                if pending_deletes.contains(&doc.id) {
                    continue;
                }
                if let Some(day) = doc.daily_doc {
                    day_ids.entry(day).or_default().insert(doc.id.clone());
                }
            }
            for record in &documents {
                if let Some(day) = record.payload_day_key() {
                    day_ids.entry(day).or_default().insert(record.key.clone());
                }
            }
            let (contested, uncontested): (Vec<_>, Vec<_>) =
                documents.into_iter().partition(|record| {
                    record
                        .payload_day_key()
                        .and_then(|day| day_ids.get(&day))
                        .map_or(false, |ids| ids.len() > 1)
                });

            to_publish.extend(uncontested);
            if !contested.is_empty() {
                let resolved = merge_daily_docs(&existing, contested, Utc::now());
                for day in &resolved.ambiguous_days {
                    tracing::warn!(vault = %self.vault, %day, "created_at tie in daily merge, resolved by id order");
                }
                to_apply.extend(resolved.applicable_local);
                to_publish.extend(resolved.applicable_remote);
            }
        }

        to_publish.extend(generic);

        let outcome = self.commit(to_apply, to_publish)?;
        self.state = SessionState::Idle;
        Ok(outcome)
    }

    /// Retry queued table batches. Called on the session tick; re-applies the
    /// already-computed change sets without re-reconciling. A batch that
    /// exhausts its attempts is dropped and reported.
    pub fn retry_failed(&mut self) -> Result<()> {
        let mut exhausted = None;
        for mut entry in std::mem::take(&mut self.retry_queue) {
            self.stats.tables_retried += 1;
            let outcome = applier::apply(&*self.store, &self.vault, entry.batch.changes.clone());
            if outcome.is_clean() {
                self.stats.changes_applied += (outcome.saved + outcome.deleted) as u64;
                tracing::info!(
                    vault = %self.vault,
                    table = %entry.batch.error.table,
                    "retried batch applied"
                );
                continue;
            }
            entry.attempts += 1;
            if entry.attempts >= self.config.retry_max_attempts {
                tracing::error!(
                    vault = %self.vault,
                    table = %entry.batch.error.table,
                    attempts = entry.attempts,
                    "batch exhausted retries, dropping"
                );
                exhausted.get_or_insert(entry.batch.error);
            } else {
                self.retry_queue.push_back(entry);
            }
        }

        match exhausted {
            Some(error) => Err(SessionError::Apply(error)),
            None => Ok(()),
        }
    }

    /// Delay before the next retry tick, if anything is queued.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        self.retry_queue
            .iter()
            .map(|entry| entry.attempts)
            .min()
            .map(|attempts| self.config.backoff_delay(attempts))
    }

    pub fn has_pending_retries(&self) -> bool {
        !self.retry_queue.is_empty()
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state {
            SessionState::Disconnected | SessionState::Connecting => {
                Err(SessionError::NotConnected)
            }
            _ => Ok(()),
        }
    }

    fn parse(&mut self, batch: Vec<serde_json::Value>) -> Vec<ChangeRecord> {
        let (records, errors) = parse_batch(&batch);
        for error in &errors {
            tracing::warn!(vault = %self.vault, %error, "dropping malformed change");
        }
        self.stats.malformed_dropped += errors.len() as u64;
        records
    }

    /// Commit the winning local set and publish the remote set. Failed table
    /// batches join the retry queue rather than failing the call; a closed
    /// sync channel does.
    fn commit(
        &mut self,
        to_apply: Vec<ChangeRecord>,
        to_publish: Vec<ChangeRecord>,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        let applied = applier::apply(&*self.store, &self.vault, to_apply);
        outcome.applied = applied.saved + applied.deleted;
        outcome.dropped = applied.skipped;
        for failed in applied.failed {
            self.retry_queue.push_back(RetryEntry {
                batch: failed,
                attempts: 0,
            });
        }

        for record in to_publish {
            // Records tagged `sync` came from the remote side; echoing them
            // back would loop the same change forever.
            if record.source.is_sync() {
                continue;
            }
            self.outbound
                .send(record)
                .map_err(|_| SessionError::ChannelClosed)?;
            outcome.published += 1;
        }

        self.stats.batches_accepted += 1;
        self.stats.changes_applied += outcome.applied as u64;
        self.stats.changes_published += outcome.published as u64;
        tracing::debug!(
            vault = %self.vault,
            applied = outcome.applied,
            published = outcome.published,
            "batch accepted"
        );
        Ok(outcome)
    }
}
