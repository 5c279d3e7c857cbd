//! Session control protocol.
//!
//! Commands and events are JSON-encoded and use snake_case for field names.
//! Every command may carry a `request_id` that the resulting event echoes
//! back for correlation.

use drift_engine::VaultId;
use serde::{Deserialize, Serialize};

/// Generate a correlation id.
pub fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Commands a session consumer sends to a vault's session task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionCommand {
    /// Connect the vault's sync session.
    ConnectSync {
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Disconnect and discard queued work.
    DisconnectSync {
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Reconcile changes observed from the local store.
    AcceptLocalChanges {
        changes: Vec<serde_json::Value>,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Reconcile changes arriving from the sync channel.
    AcceptRemoteChanges {
        changes: Vec<serde_json::Value>,
        #[serde(default)]
        request_id: Option<String>,
    },
}

impl SessionCommand {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            SessionCommand::ConnectSync { request_id }
            | SessionCommand::DisconnectSync { request_id }
            | SessionCommand::AcceptLocalChanges { request_id, .. }
            | SessionCommand::AcceptRemoteChanges { request_id, .. } => request_id.as_deref(),
        }
    }
}

/// Events a session task reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected {
        vault: VaultId,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    Disconnected {
        vault: VaultId,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// A batch was reconciled and committed.
    ChangesAccepted {
        vault: VaultId,
        applied: usize,
        published: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    Error {
        vault: VaultId,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl SessionEvent {
    /// Create an error event.
    pub fn error(
        vault: VaultId,
        message: impl Into<String>,
        request_id: Option<String>,
    ) -> Self {
        SessionEvent::Error {
            vault,
            message: message.into(),
            request_id,
        }
    }
}
