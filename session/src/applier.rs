//! Change applier.
//!
//! Commits a resolved change set to the local store. Changes are grouped by
//! table; each table's saves and deletes are staged and then handed to the
//! store as one [`TableBatch`] commit, so a rejected table is never left
//! half-applied. A failed table is reported back with its changes intact for
//! retry and never blocks the other tables in the set.
//!
//! [`TableBatch`]: crate::store::TableBatch
//!
//! Application is idempotent: an insert over an existing key overwrites it, a
//! delete of a missing key is a no-op, and an update of a missing key is
//! skipped. Re-running a batch after a partial failure is therefore always
//! safe.

use std::collections::BTreeMap;

use drift_engine::{ChangeRecord, Table, VaultId};

use crate::store::{LocalStore, StoreError, TableBatch, WriteMeta};

/// A table batch the store rejected.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{table} batch failed: {source}")]
pub struct ApplyError {
    pub table: Table,
    pub source: StoreError,
}

/// A failed table batch, carrying its changes for retry.
#[derive(Debug, Clone)]
pub struct FailedTable {
    pub changes: Vec<ChangeRecord>,
    pub error: ApplyError,
}

/// Outcome of applying one change set.
#[derive(Debug, Default)]
pub struct AppliedBatch {
    /// Entities inserted or overwritten
    pub saved: usize,
    /// Entities removed
    pub deleted: usize,
    /// Updates dropped because their target no longer exists
    pub skipped: usize,
    /// Table batches the store rejected, queued for retry by the caller
    pub failed: Vec<FailedTable>,
}

impl AppliedBatch {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Apply a resolved change set to the store.
pub fn apply(store: &dyn LocalStore, vault: &VaultId, changes: Vec<ChangeRecord>) -> AppliedBatch {
    let mut by_table: BTreeMap<Table, Vec<ChangeRecord>> = BTreeMap::new();
    for change in changes {
        by_table.entry(change.table).or_default().push(change);
    }

    let mut outcome = AppliedBatch::default();
    for (table, group) in by_table {
        match apply_table(store, vault, table, &group) {
            Ok((saved, deleted, skipped)) => {
                outcome.saved += saved;
                outcome.deleted += deleted;
                outcome.skipped += skipped;
            }
            Err(source) => {
                tracing::warn!(%vault, %table, error = %source, "table batch failed, queuing for retry");
                outcome.failed.push(FailedTable {
                    changes: group,
                    error: ApplyError { table, source },
                });
            }
        }
    }
    outcome
}

/// Stage and commit one table's changes. Staging resolves updates against the
/// current store state; the commit is a single [`TableBatch`] hand-off.
fn apply_table(
    store: &dyn LocalStore,
    vault: &VaultId,
    table: Table,
    group: &[ChangeRecord],
) -> Result<(usize, usize, usize), StoreError> {
    let mut batch = TableBatch::default();
    let mut skipped = 0usize;

    for change in group {
        if let Some(obj) = &change.obj {
            batch
                .saves
                .push((obj.clone(), WriteMeta::new(change.source.clone())));
        } else if let Some(mods) = &change.mods {
            match store.retrieve(vault, table, &change.key)? {
                Some(mut entity) => {
                    entity.apply_patch(mods);
                    batch
                        .saves
                        .push((entity, WriteMeta::new(change.source.clone())));
                }
                None => {
                    tracing::debug!(%vault, %table, key = %change.key, "update target missing, skipping");
                    skipped += 1;
                }
            }
        } else {
            batch
                .deletes
                .push((change.key.clone(), WriteMeta::new(change.source.clone())));
        }
    }

    let saved = batch.saves.len();
    let deleted = batch.deletes.len();
    if !batch.is_empty() {
        store.commit_table(vault, table, batch)?;
    }

    Ok((saved, deleted, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{DateTime, TimeZone, Utc};
    use drift_engine::{Entity, Patch, Source};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn vault() -> VaultId {
        "vault-1".to_string()
    }

    fn task(id: &str, content: &str) -> Entity {
        Entity::new(id, ts(1_000)).with_content(content)
    }

    #[test]
    fn applies_mixed_batch_per_table() {
        let store = MemoryStore::new();
        store.seed(&vault(), Table::Tasks, vec![task("t1", "old")]);

        let changes = vec![
            ChangeRecord::update(
                Table::Tasks,
                "t1",
                Patch {
                    content: Some("new".into()),
                    updated_at: Some(ts(2_000)),
                    ..Default::default()
                },
                Source::Sync,
            ),
            ChangeRecord::insert(Table::Events, task("e1", "meeting"), Source::Sync),
            ChangeRecord::delete(Table::Tasks, "t2", Source::Sync),
        ];

        let outcome = apply(&store, &vault(), changes);

        assert!(outcome.is_clean());
        assert_eq!(outcome.saved, 2);
        assert_eq!(outcome.deleted, 1);
        let t1 = store
            .retrieve(&vault(), Table::Tasks, &"t1".to_string())
            .unwrap()
            .unwrap();
        assert_eq!(t1.content, "new");
        assert_eq!(t1.updated_at, ts(2_000));
    }

    #[test]
    fn insert_over_existing_key_overwrites() {
        let store = MemoryStore::new();
        store.seed(&vault(), Table::Tasks, vec![task("t1", "old")]);

        let outcome = apply(
            &store,
            &vault(),
            vec![ChangeRecord::insert(
                Table::Tasks,
                task("t1", "replacement"),
                Source::Sync,
            )],
        );

        assert!(outcome.is_clean());
        let t1 = store
            .retrieve(&vault(), Table::Tasks, &"t1".to_string())
            .unwrap()
            .unwrap();
        assert_eq!(t1.content, "replacement");
    }

    #[test]
    fn update_of_missing_key_is_skipped() {
        let store = MemoryStore::new();

        let outcome = apply(
            &store,
            &vault(),
            vec![ChangeRecord::update(
                Table::Tasks,
                "ghost",
                Patch {
                    content: Some("nothing".into()),
                    ..Default::default()
                },
                Source::Sync,
            )],
        );

        assert!(outcome.is_clean());
        assert_eq!(outcome.saved, 0);
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn delete_of_missing_key_is_noop() {
        let store = MemoryStore::new();

        let outcome = apply(
            &store,
            &vault(),
            vec![ChangeRecord::delete(Table::Tasks, "ghost", Source::Sync)],
        );

        assert!(outcome.is_clean());
        assert_eq!(outcome.deleted, 1);
    }

    #[test]
    fn reapplying_a_batch_is_idempotent() {
        let store = MemoryStore::new();
        let changes = vec![
            ChangeRecord::insert(Table::Tasks, task("t1", "a"), Source::Sync),
            ChangeRecord::delete(Table::Tasks, "t2", Source::Sync),
        ];

        apply(&store, &vault(), changes.clone());
        let outcome = apply(&store, &vault(), changes);

        assert!(outcome.is_clean());
        assert_eq!(store.list(&vault(), Table::Tasks).unwrap().len(), 1);
    }

    #[test]
    fn failed_table_does_not_block_others() {
        let store = MemoryStore::new();
        store.poison_table(Table::Events, "disk full");

        let changes = vec![
            ChangeRecord::insert(Table::Events, task("e1", "x"), Source::Sync),
            ChangeRecord::insert(Table::Tasks, task("t1", "y"), Source::Sync),
        ];

        let outcome = apply(&store, &vault(), changes);

        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].error.table, Table::Events);
        assert_eq!(outcome.failed[0].changes.len(), 1);
        // The healthy table still committed.
        assert_eq!(store.list(&vault(), Table::Tasks).unwrap().len(), 1);

        // Retry after the store recovers.
        store.heal_table(Table::Events);
        let retry = apply(&store, &vault(), outcome.failed[0].changes.clone());
        assert!(retry.is_clean());
        assert_eq!(store.list(&vault(), Table::Events).unwrap().len(), 1);
    }
}
