//! Local store adapter.
//!
//! The session layer reads and writes vault data through the [`LocalStore`]
//! trait so the reconciliation pipeline never knows which backend it is
//! talking to. [`MemoryStore`] is the embedded implementation used by tests
//! and unpersisted vaults.

use std::collections::BTreeMap;

use dashmap::DashMap;
use drift_engine::{ChangeRecord, Entity, EntityId, Source, Table, VaultId};
use tokio::sync::mpsc;

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("table {0} is unavailable: {1}")]
    Unavailable(Table, String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Provenance attached to every write.
///
/// The store suppresses mutation-log echoes for [`Source::Sync`] writes:
/// those came from the remote side, and logging them again would bounce the
/// same change back out over the channel forever.
#[derive(Debug, Clone)]
pub struct WriteMeta {
    pub source: Source,
}

impl WriteMeta {
    pub fn new(source: Source) -> Self {
        Self { source }
    }
}

/// One table's staged writes, committed as a unit.
///
/// Provenance travels with every record so the mutation log can tell local
/// writes from sync writes inside a single commit.
#[derive(Debug, Default)]
pub struct TableBatch {
    /// Entities to insert or overwrite
    pub saves: Vec<(Entity, WriteMeta)>,
    /// Keys to remove; missing keys are ignored
    pub deletes: Vec<(EntityId, WriteMeta)>,
}

impl TableBatch {
    pub fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.deletes.is_empty()
    }
}

/// Vault storage as the session layer sees it.
pub trait LocalStore: Send + Sync {
    /// All entities in a table.
    fn list(&self, vault: &VaultId, table: Table) -> Result<Vec<Entity>, StoreError>;

    /// One entity by key.
    fn retrieve(
        &self,
        vault: &VaultId,
        table: Table,
        key: &EntityId,
    ) -> Result<Option<Entity>, StoreError>;

    /// Commit one table's staged writes. Either every save and delete in the
    /// batch lands or none do.
    fn commit_table(
        &self,
        vault: &VaultId,
        table: Table,
        batch: TableBatch,
    ) -> Result<(), StoreError>;
}

/// In-memory store backed by a concurrent map of per-table BTreeMaps.
///
/// An optional mutation log reports every non-`sync` write as a
/// [`ChangeRecord`]; the session publishes those as locally-originated
/// changes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: DashMap<(VaultId, Table), BTreeMap<EntityId, Entity>>,
    mutation_log: Option<mpsc::UnboundedSender<ChangeRecord>>,
    // Tables forced to fail, for failure-path tests.
    failing: DashMap<Table, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a mutation log receiving every non-`sync` write.
    pub fn with_mutation_log(mut self, log: mpsc::UnboundedSender<ChangeRecord>) -> Self {
        self.mutation_log = Some(log);
        self
    }

    /// Load entities directly, bypassing the mutation log. Test setup and
    /// initial vault import use this.
    pub fn seed(&self, vault: &VaultId, table: Table, entities: Vec<Entity>) {
        let mut map = self
            .tables
            .entry((vault.clone(), table))
            .or_default();
        for entity in entities {
            map.insert(entity.id.clone(), entity);
        }
    }

    /// Force subsequent writes to `table` to fail with the given message.
    /// Reads stay available, as with a full disk.
    pub fn poison_table(&self, table: Table, message: impl Into<String>) {
        self.failing.insert(table, message.into());
    }

    /// Clear an injected failure.
    pub fn heal_table(&self, table: Table) {
        self.failing.remove(&table);
    }

    fn check_poisoned(&self, table: Table) -> Result<(), StoreError> {
        if let Some(message) = self.failing.get(&table) {
            return Err(StoreError::Unavailable(table, message.clone()));
        }
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn list(&self, vault: &VaultId, table: Table) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .tables
            .get(&(vault.clone(), table))
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default())
    }

    fn retrieve(
        &self,
        vault: &VaultId,
        table: Table,
        key: &EntityId,
    ) -> Result<Option<Entity>, StoreError> {
        Ok(self
            .tables
            .get(&(vault.clone(), table))
            .and_then(|map| map.get(key).cloned()))
    }

    fn commit_table(
        &self,
        vault: &VaultId,
        table: Table,
        batch: TableBatch,
    ) -> Result<(), StoreError> {
        // The only failure point comes before any write, so a rejected
        // commit leaves the table exactly as it was.
        self.check_poisoned(table)?;
        let mut map = self
            .tables
            .entry((vault.clone(), table))
            .or_default();
        let mut logged = Vec::new();
        for (entity, meta) in batch.saves {
            map.insert(entity.id.clone(), entity.clone());
            if !meta.source.is_sync() {
                logged.push(ChangeRecord::insert(table, entity, meta.source));
            }
        }
        for (key, meta) in batch.deletes {
            if map.remove(&key).is_some() && !meta.source.is_sync() {
                logged.push(ChangeRecord::delete(table, key, meta.source));
            }
        }
        drop(map);
        if let Some(log) = &self.mutation_log {
            for change in logged {
                let _ = log.send(change);
            }
        }
        Ok(())
    }
}
