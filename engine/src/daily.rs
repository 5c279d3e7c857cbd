//! Daily-document singleton merge.
//!
//! A vault holds at most one document per calendar day. Devices editing
//! offline can each create their own copy of a day, so a reconciliation pass
//! may find several documents claiming the same day key. This module folds
//! every such merge group into one canonical survivor plus tombstones for the
//! losers, deterministically: the same set of inputs produces the same
//! canonical document no matter which side runs the merge or in which order
//! the changes arrived.
//!
//! Survivor choice is earliest `created_at` (creation order reflects who
//! owned the day first and is stable under later edits), with ascending
//! entity id as the tie-break. Content is the concatenation of every member's
//! content in ascending `(created_at, id)` order - the union of everyone's
//! notes for the day, oldest first, no delimiter.

use crate::{ChangeRecord, DayKey, Entity, EntityId, Patch, Source, Table};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Output of a daily-doc merge pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedChanges {
    /// Changes to commit to the local store
    pub applicable_local: Vec<ChangeRecord>,
    /// Changes to publish on the sync channel
    pub applicable_remote: Vec<ChangeRecord>,
    /// Days whose merge group had a `created_at` tie; resolved by the id
    /// tie-break, surfaced so the caller can log a warning
    pub ambiguous_days: Vec<DayKey>,
}

/// One entity under consideration for a day's merge group.
#[derive(Debug, Clone)]
struct Member {
    entity: Entity,
    /// Present in the local store under this id before the pass
    existed: bool,
    /// The incoming change that introduced or replaced this member
    incoming: Option<ChangeRecord>,
    /// An incoming same-id change lost the last-writer-wins comparison
    stale_incoming: bool,
}

/// Merge incoming daily-doc changes against the existing documents.
///
/// `existing` is the local store's view of the documents table (only entries
/// with a day key participate). `incoming` is one batch of changes for the
/// documents table; changes without a day key in their payload, and all
/// deletes, pass through unmodified. `now` stamps the canonical entity's
/// `updated_at` - callers pass it in so a pass is reproducible.
pub fn merge_daily_docs(
    existing: &[Entity],
    incoming: Vec<ChangeRecord>,
    now: DateTime<Utc>,
) -> ResolvedChanges {
    let mut resolved = ResolvedChanges::default();
    // BTreeMap keeps day iteration order deterministic across passes.
    let mut groups: BTreeMap<DayKey, Vec<Member>> = BTreeMap::new();

    // An existing doc the batch also deletes is already gone; letting it join
    // a merge group would resurrect its content as the canonical value and
    // then tombstone the survivor.
    let pending_deletes: BTreeSet<EntityId> = incoming
        .iter()
        .filter(|change| change.is_delete())
        .map(|change| change.key.clone())
        .collect();

    for change in incoming {
        let day = change.payload_day_key();
        let entity = change.payload_entity();
        let (day, entity) = match (day, entity) {
            (Some(day), Some(entity)) => (day, entity),
            // Deletes, day-less changes, and partial patches that cannot
            // materialize an entity are not merge candidates.
            _ => {
                resolved.applicable_local.push(change.clone());
                resolved.applicable_remote.push(change);
                continue;
            }
        };

        let members = groups.entry(day).or_insert_with(|| {
            existing
                .iter()
                .filter(|doc| doc.daily_doc == Some(day) && !pending_deletes.contains(&doc.id))
                .map(|doc| Member {
                    entity: doc.clone(),
                    existed: true,
                    incoming: None,
                    stale_incoming: false,
                })
                .collect()
        });

        match members.iter_mut().find(|m| m.entity.id == entity.id) {
            Some(member) => {
                // Same id on both sides: last-writer-wins within the group,
                // strict comparison so a tie keeps the converged copy.
                if entity.updated_at > member.entity.updated_at {
                    member.entity = entity;
                    member.incoming = Some(change);
                    member.stale_incoming = false;
                } else {
                    member.stale_incoming = true;
                }
            }
            None => members.push(Member {
                entity,
                existed: false,
                incoming: Some(change),
                stale_incoming: false,
            }),
        }
    }

    for (day, mut members) in groups {
        if members.len() < 2 {
            if let Some(member) = members.pop() {
                resolve_singleton(member, &mut resolved);
            }
            continue;
        }

        members.sort_by(|a, b| {
            a.entity
                .created_at
                .cmp(&b.entity.created_at)
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        if members
            .windows(2)
            .any(|w| w[0].entity.created_at == w[1].entity.created_at)
        {
            resolved.ambiguous_days.push(day);
        }

        let merged_content: String = members.iter().map(|m| m.entity.content.as_str()).collect();
        let survivor = &members[0];
        let mut canonical = survivor.entity.clone();
        canonical.content = merged_content;
        canonical.updated_at = now;

        let canonical_change = if survivor.existed {
            ChangeRecord::update(
                Table::Documents,
                canonical.id.clone(),
                Patch::from_entity(&canonical),
                Source::Broadcast,
            )
        } else {
            ChangeRecord::insert(Table::Documents, canonical, Source::Broadcast)
        };
        resolved.applicable_local.push(canonical_change.clone());
        resolved.applicable_remote.push(canonical_change);

        for loser in &members[1..] {
            let tombstone =
                ChangeRecord::delete(Table::Documents, loser.entity.id.clone(), Source::Broadcast);
            resolved.applicable_local.push(tombstone.clone());
            resolved.applicable_remote.push(tombstone);
        }
    }

    resolved
}

/// A merge group that collapsed to one member: no singleton violation, so
/// this degrades to the generic last-writer-wins outcome.
fn resolve_singleton(member: Member, resolved: &mut ResolvedChanges) {
    if !member.existed {
        // Brand-new day key: direct accept, the remote side already has it.
        if let Some(change) = member.incoming {
            resolved.applicable_local.push(change.with_source(Source::Sync));
        }
        return;
    }
    if let Some(change) = member.incoming {
        // Same-id incoming won the timestamp comparison: overwrite locally
        // and echo the accepted value outward.
        resolved
            .applicable_local
            .push(change.clone().with_source(Source::Sync));
        resolved
            .applicable_remote
            .push(change.with_source(Source::Broadcast));
    } else if member.stale_incoming {
        // The store's copy is newer: rewrite the remote side to match.
        resolved.applicable_remote.push(ChangeRecord::update(
            Table::Documents,
            member.entity.id.clone(),
            Patch::from_entity(&member.entity),
            Source::Broadcast,
        ));
    }
}
