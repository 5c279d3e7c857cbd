//! Unified error handling for the session crate.

use crate::applier::ApplyError;
use crate::store::StoreError;
use drift_engine::VaultId;

/// Session-level error type.
///
/// Nothing here is process-fatal: a failed batch degrades to skip-and-retry,
/// a locked vault simply refuses to connect.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("vault {0} is locked")]
    VaultLocked(VaultId),

    #[error("session is not connected")]
    NotConnected,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("engine error: {0}")]
    Engine(#[from] drift_engine::Error),

    #[error("sync channel closed")]
    ChannelClosed,
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
