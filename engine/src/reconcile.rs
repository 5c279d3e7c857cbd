//! Generic per-entity reconciliation.
//!
//! Given the entity currently stored for a key and one incoming change for
//! the same key, decide the winning state by last-writer-wins on the
//! modification timestamp and emit the change sets that bring both sides to
//! it. Pure and deterministic: no I/O, no clocks, no randomness.

use crate::{ChangeRecord, Entity, Patch, Source};

/// The two change sets a reconciliation pass produces.
///
/// `local` is applied to the local store; `remote` is published on the sync
/// channel so every other client converges on the same resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub local: Vec<ChangeRecord>,
    pub remote: Vec<ChangeRecord>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }
}

/// Reconcile one incoming change against the stored entity for its key.
///
/// - No stored entity: the incoming change is accepted as-is into the local
///   set with `source: "sync"`; the remote side already has it, so nothing is
///   echoed back.
/// - Incoming `updated_at` strictly newer: the stored entity is overwritten;
///   the accepted value goes to the local set, and the same value is echoed to
///   the remote set with `source: "*"` so any third device sees this exact
///   resolution rather than the raw event.
/// - Incoming not newer (equal or older): the stored entity wins; the local
///   value is emitted to the remote set as a full rewrite, and the local set
///   stays empty because the store is already correct. Equal timestamps favor
///   the side that is already converged.
///
/// Deletes and patches that carry no comparable `updated_at` are accepted
/// as-is into the local set.
pub fn reconcile(local_entity: Option<&Entity>, incoming: &ChangeRecord) -> Resolution {
    let mut resolution = Resolution::default();

    let local_entity = match local_entity {
        Some(entity) => entity,
        None => {
            resolution
                .local
                .push(incoming.clone().with_source(Source::Sync));
            return resolution;
        }
    };

    if incoming.is_delete() {
        resolution
            .local
            .push(incoming.clone().with_source(Source::Sync));
        return resolution;
    }

    let incoming_updated_at = match incoming.payload_updated_at() {
        Some(ts) => ts,
        None => {
            // Patch without a timestamp: nothing to compare against, accept.
            resolution
                .local
                .push(incoming.clone().with_source(Source::Sync));
            return resolution;
        }
    };

    if incoming_updated_at > local_entity.updated_at {
        resolution
            .local
            .push(incoming.clone().with_source(Source::Sync));
        resolution
            .remote
            .push(incoming.clone().with_source(Source::Broadcast));
    } else {
        resolution.remote.push(ChangeRecord::update(
            incoming.table,
            local_entity.id.clone(),
            Patch::from_entity(local_entity),
            Source::Broadcast,
        ));
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Table;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn task(id: &str, created: i64, updated: i64) -> Entity {
        Entity::new(id, ts(created)).with_updated_at(ts(updated))
    }

    #[test]
    fn absent_local_accepts_incoming() {
        let incoming = ChangeRecord::insert(
            Table::Tasks,
            task("task-1", 100, 100),
            Source::Client("device-2".into()),
        );

        let resolution = reconcile(None, &incoming);

        assert_eq!(resolution.local.len(), 1);
        assert_eq!(resolution.local[0].source, Source::Sync);
        assert_eq!(resolution.local[0].key, "task-1");
        assert!(resolution.remote.is_empty());
    }

    #[test]
    fn newer_incoming_overwrites_and_echoes() {
        let local = task("task-1", 100, 200);
        let incoming = ChangeRecord::update(
            Table::Tasks,
            "task-1",
            Patch {
                updated_at: Some(ts(300)),
                content: Some("newer".into()),
                ..Default::default()
            },
            Source::Sync,
        );

        let resolution = reconcile(Some(&local), &incoming);

        assert_eq!(resolution.local.len(), 1);
        assert_eq!(resolution.local[0].source, Source::Sync);
        assert_eq!(resolution.remote.len(), 1);
        assert_eq!(resolution.remote[0].source, Source::Broadcast);
        assert_eq!(
            resolution.remote[0].mods.as_ref().unwrap().content,
            Some("newer".into())
        );
    }

    #[test]
    fn stale_incoming_rewrites_remote() {
        let local = task("task-1", 100, 500).with_content("kept");
        let incoming = ChangeRecord::update(
            Table::Tasks,
            "task-1",
            Patch {
                updated_at: Some(ts(300)),
                content: Some("stale".into()),
                ..Default::default()
            },
            Source::Sync,
        );

        let resolution = reconcile(Some(&local), &incoming);

        assert!(resolution.local.is_empty());
        assert_eq!(resolution.remote.len(), 1);
        let echo = &resolution.remote[0];
        assert!(echo.is_update());
        assert_eq!(echo.source, Source::Broadcast);
        assert_eq!(echo.mods.as_ref().unwrap().content, Some("kept".into()));
        assert_eq!(echo.mods.as_ref().unwrap().updated_at, Some(ts(500)));
    }

    #[test]
    fn equal_timestamps_favor_local() {
        let local = task("task-1", 100, 300).with_content("local");
        let incoming = ChangeRecord::update(
            Table::Tasks,
            "task-1",
            Patch {
                updated_at: Some(ts(300)),
                content: Some("remote".into()),
                ..Default::default()
            },
            Source::Sync,
        );

        let resolution = reconcile(Some(&local), &incoming);

        assert!(resolution.local.is_empty());
        assert_eq!(
            resolution.remote[0].mods.as_ref().unwrap().content,
            Some("local".into())
        );
    }

    #[test]
    fn delete_passes_through() {
        let local = task("task-1", 100, 200);
        let incoming = ChangeRecord::delete(Table::Tasks, "task-1", Source::Sync);

        let resolution = reconcile(Some(&local), &incoming);

        assert_eq!(resolution.local.len(), 1);
        assert!(resolution.local[0].is_delete());
        assert!(resolution.remote.is_empty());
    }

    #[test]
    fn timestampless_patch_accepted() {
        let local = task("task-1", 100, 200);
        let incoming = ChangeRecord::update(
            Table::Tasks,
            "task-1",
            Patch {
                content: Some("no timestamp".into()),
                ..Default::default()
            },
            Source::Sync,
        );

        let resolution = reconcile(Some(&local), &incoming);
        assert_eq!(resolution.local.len(), 1);
        assert!(resolution.remote.is_empty());
    }
}
