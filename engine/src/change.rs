//! Change records - the vocabulary for describing a single mutation.
//!
//! Mutations are expressed as change records, not direct writes. A record
//! names a table, a key, and carries either a full entity (insert), a partial
//! patch (update), or nothing (delete), plus a provenance marker that decides
//! whether the change still needs to be broadcast.

use crate::{DayKey, Entity, EntityId, Error, Patch, Table};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The kind of mutation a change record describes.
///
/// On the wire this is numeric: 1 = insert, 2 = update, 3 = delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    fn as_wire(self) -> u8 {
        match self {
            ChangeKind::Insert => 1,
            ChangeKind::Update => 2,
            ChangeKind::Delete => 3,
        }
    }

    fn from_wire(kind: u8) -> Result<Self, Error> {
        match kind {
            1 => Ok(ChangeKind::Insert),
            2 => Ok(ChangeKind::Update),
            3 => Ok(ChangeKind::Delete),
            other => Err(Error::MalformedChange(format!(
                "unknown change kind {other}"
            ))),
        }
    }
}

/// Provenance of a change record.
///
/// - `Sync`: came from the remote side; apply locally, no further broadcast.
/// - `Broadcast` (`"*"` on the wire): reconciliation rewrote the data, so the
///   change must reach every client, including the one it logically came from.
/// - `Client`: originated on a device, identified by its client id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Sync,
    Broadcast,
    Client(String),
}

impl Source {
    pub fn as_str(&self) -> &str {
        match self {
            Source::Sync => "sync",
            Source::Broadcast => "*",
            Source::Client(id) => id,
        }
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, Source::Sync)
    }
}

impl From<&str> for Source {
    fn from(s: &str) -> Self {
        match s {
            "sync" => Source::Sync,
            "*" => Source::Broadcast,
            id => Source::Client(id.to_string()),
        }
    }
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Source::from(s.as_str()))
    }
}

/// A single mutation against a table and key.
///
/// Value type with structural equality and no shared state, safe to hand
/// across task boundaries. The payload split is enforced at the type's serde
/// boundary: inserts carry `obj`, updates carry `mods`, deletes carry neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireChange", into = "WireChange")]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub table: Table,
    pub key: EntityId,
    pub obj: Option<Entity>,
    pub mods: Option<Patch>,
    pub source: Source,
}

impl ChangeRecord {
    /// An insert change. The key is taken from the entity id.
    pub fn insert(table: Table, entity: Entity, source: Source) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table,
            key: entity.id.clone(),
            obj: Some(entity),
            mods: None,
            source,
        }
    }

    /// An update change carrying a partial patch.
    pub fn update(table: Table, key: impl Into<EntityId>, mods: Patch, source: Source) -> Self {
        Self {
            kind: ChangeKind::Update,
            table,
            key: key.into(),
            obj: None,
            mods: Some(mods),
            source,
        }
    }

    /// A delete change. Carries no payload - it is a tombstone.
    pub fn delete(table: Table, key: impl Into<EntityId>, source: Source) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table,
            key: key.into(),
            obj: None,
            mods: None,
            source,
        }
    }

    pub fn is_insert(&self) -> bool {
        self.kind == ChangeKind::Insert
    }

    pub fn is_update(&self) -> bool {
        self.kind == ChangeKind::Update
    }

    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }

    /// Return a copy with a different source marker.
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// The `updated_at` carried in the payload, if any.
    pub fn payload_updated_at(&self) -> Option<DateTime<Utc>> {
        match self.kind {
            ChangeKind::Insert => self.obj.as_ref().map(|e| e.updated_at),
            ChangeKind::Update => self.mods.as_ref().and_then(|m| m.updated_at),
            ChangeKind::Delete => None,
        }
    }

    /// The day key carried in the payload, if any.
    pub fn payload_day_key(&self) -> Option<DayKey> {
        match self.kind {
            ChangeKind::Insert => self.obj.as_ref().and_then(|e| e.daily_doc),
            ChangeKind::Update => self.mods.as_ref().and_then(|m| m.daily_doc),
            ChangeKind::Delete => None,
        }
    }

    /// Materialize the payload as a full entity, when it carries one.
    ///
    /// Inserts always do; updates only when the patch covers the complete
    /// reconciliation subset.
    pub fn payload_entity(&self) -> Option<Entity> {
        match self.kind {
            ChangeKind::Insert => self.obj.clone(),
            ChangeKind::Update => self.mods.as_ref().and_then(|m| m.to_entity(&self.key)),
            ChangeKind::Delete => None,
        }
    }
}

/// The wire shape: `{ kind: 1|2|3, table, key, obj?, mods?, source }`.
#[derive(Debug, Serialize, Deserialize)]
struct WireChange {
    kind: u8,
    table: Table,
    key: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    obj: Option<Entity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mods: Option<Patch>,
    source: Source,
}

impl TryFrom<WireChange> for ChangeRecord {
    type Error = Error;

    fn try_from(wire: WireChange) -> Result<Self, Error> {
        let kind = ChangeKind::from_wire(wire.kind)?;
        match kind {
            ChangeKind::Insert => {
                if wire.obj.is_none() {
                    return Err(Error::MalformedChange("insert without obj".into()));
                }
                if wire.mods.is_some() {
                    return Err(Error::MalformedChange("insert with mods".into()));
                }
            }
            ChangeKind::Update => {
                if wire.mods.is_none() {
                    return Err(Error::MalformedChange("update without mods".into()));
                }
                if wire.obj.is_some() {
                    return Err(Error::MalformedChange("update with obj".into()));
                }
            }
            ChangeKind::Delete => {
                if wire.obj.is_some() || wire.mods.is_some() {
                    return Err(Error::MalformedChange("delete with payload".into()));
                }
            }
        }
        if let Some(entity) = &wire.obj {
            if entity.id != wire.key {
                return Err(Error::MalformedChange(format!(
                    "insert key '{}' does not match entity id '{}'",
                    wire.key, entity.id
                )));
            }
        }
        Ok(ChangeRecord {
            kind,
            table: wire.table,
            key: wire.key,
            obj: wire.obj,
            mods: wire.mods,
            source: wire.source,
        })
    }
}

impl From<ChangeRecord> for WireChange {
    fn from(change: ChangeRecord) -> Self {
        WireChange {
            kind: change.kind.as_wire(),
            table: change.table,
            key: change.key,
            obj: change.obj,
            mods: change.mods,
            source: change.source,
        }
    }
}

/// Parse a batch of wire-encoded changes, dropping malformed records.
///
/// Returns the parsed records and one error per rejected record. A rejected
/// record never blocks the rest of its batch; the caller reports the
/// diagnostics.
pub fn parse_batch(raw: &[serde_json::Value]) -> (Vec<ChangeRecord>, Vec<Error>) {
    let mut changes = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();
    for value in raw {
        match serde_json::from_value::<ChangeRecord>(value.clone()) {
            Ok(change) => changes.push(change),
            Err(e) => errors.push(Error::MalformedChange(e.to_string())),
        }
    }
    (changes, errors)
}
