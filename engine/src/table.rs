//! Table names and their reconciliation strategies.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The tables a vault stores.
///
/// A closed enum instead of free-form strings: every table is bound to its
/// reconciliation strategy at compile time, and an unknown table name on the
/// wire is rejected during deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Documents,
    Tasks,
    Events,
    Folders,
}

/// How changes against a table are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Per-entity last-writer-wins on `updated_at`
    LastWriterWins,
    /// One-document-per-day singleton merge
    DailyDoc,
}

impl Table {
    /// The strategy bound to this table.
    pub fn strategy(&self) -> MergeStrategy {
        match self {
            Table::Documents => MergeStrategy::DailyDoc,
            Table::Tasks | Table::Events | Table::Folders => MergeStrategy::LastWriterWins,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Documents => "documents",
            Table::Tasks => "tasks",
            Table::Events => "events",
            Table::Folders => "folders",
        }
    }

    /// All tables, in a stable order.
    pub fn all() -> [Table; 4] {
        [Table::Documents, Table::Tasks, Table::Events, Table::Folders]
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "documents" => Ok(Table::Documents),
            "tasks" => Ok(Table::Tasks),
            "events" => Ok(Table::Events),
            "folders" => Ok(Table::Folders),
            other => Err(Error::UnknownTable(other.to_string())),
        }
    }
}
