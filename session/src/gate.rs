//! Vault encryption gate.
//!
//! Encrypted vaults must be unlocked before a sync session may touch their
//! data. The session layer only needs a yes/no answer; key handling lives
//! with the caller.

use drift_engine::VaultId;

/// Answers whether a vault's content is readable right now.
pub trait UnlockGate: Send + Sync {
    fn is_unlockable(&self, vault: &VaultId) -> bool;
}

/// Gate for unencrypted vaults: always open.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysUnlocked;

impl UnlockGate for AlwaysUnlocked {
    fn is_unlockable(&self, _vault: &VaultId) -> bool {
        true
    }
}
