//! Entity types for stored records.

use crate::{DayKey, EntityId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored record, as seen by the reconciliation core.
///
/// Only the fields that reconciliation depends on are typed; everything else a
/// table stores rides along in `extra`. Timestamps are concrete
/// [`DateTime<Utc>`] values - wire-level strings and epoch numbers are
/// normalized at deserialization and never compared as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique identifier within its table
    pub id: EntityId,
    /// When the entity was first created
    pub created_at: DateTime<Utc>,
    /// When the entity was last modified
    pub updated_at: DateTime<Utc>,
    /// Day key for daily documents, absent for everything else
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_doc: Option<DayKey>,
    /// Document body (empty for non-document entities)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    /// Remaining table-specific fields, carried verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity {
    /// Create an entity with identical created/updated timestamps.
    pub fn new(id: impl Into<EntityId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            updated_at: created_at,
            daily_doc: None,
            content: String::new(),
            extra: Map::new(),
        }
    }

    /// Builder: assign a day key.
    pub fn with_day(mut self, day: DayKey) -> Self {
        self.daily_doc = Some(day);
        self
    }

    /// Builder: assign document content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Builder: assign the last-modified timestamp.
    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Whether this entity claims a calendar day.
    pub fn is_daily_doc(&self) -> bool {
        self.daily_doc.is_some()
    }

    /// Merge a patch into this entity. Top-level fields are replaced,
    /// untouched fields are kept.
    pub fn apply_patch(&mut self, patch: &Patch) {
        if let Some(created_at) = patch.created_at {
            self.created_at = created_at;
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
        if let Some(day) = patch.daily_doc {
            self.daily_doc = Some(day);
        }
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        for (key, value) in &patch.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

/// A partial entity carried by update changes.
///
/// Every reconciliation-relevant field is optional; unknown fields are kept in
/// `extra` so a patch round-trips losslessly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_doc: Option<DayKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Patch {
    /// Build a full patch from an entity, used when a resolver rewrites one
    /// side to match the other.
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            created_at: Some(entity.created_at),
            updated_at: Some(entity.updated_at),
            daily_doc: entity.daily_doc,
            content: Some(entity.content.clone()),
            extra: entity.extra.clone(),
        }
    }

    /// Materialize an entity from a patch that carries the complete
    /// reconciliation subset. Returns `None` when timestamps are missing,
    /// which keeps partial patches out of merge groups.
    pub fn to_entity(&self, id: &EntityId) -> Option<Entity> {
        let created_at = self.created_at?;
        let updated_at = self.updated_at?;
        Some(Entity {
            id: id.clone(),
            created_at,
            updated_at,
            daily_doc: self.daily_doc,
            content: self.content.clone().unwrap_or_default(),
            extra: self.extra.clone(),
        })
    }
}
