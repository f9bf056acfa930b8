//! Storage trait definitions

use crate::error::HeirloomError;
use crate::types::{
    Beneficiary, CompensationLogEntry, DeadManSwitchEvent, OwnerProfile, Vault, VaultStatus,
};
use async_trait::async_trait;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, HeirloomError>;

/// Expected prior state for a conditional vault update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultPrecondition {
    pub status: VaultStatus,
    pub revision: u64,
}

impl VaultPrecondition {
    pub fn of(vault: &Vault) -> Self {
        Self {
            status: vault.status,
            revision: vault.revision,
        }
    }
}

/// Persistent state shared by every Heirloom component.
///
/// Conditional updates are the only mutual exclusion between overlapping runs, so
/// implementations must apply the precondition check and the write atomically.
#[async_trait]
pub trait VaultStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Insert a new vault. Fails with `Conflict` when the id is taken.
    async fn insert_vault(&self, vault: Vault) -> StorageResult<Vault>;

    async fn get_vault(&self, vault_id: &str) -> StorageResult<Option<Vault>>;

    /// Scan query used by the reconciliation engine.
    async fn list_vaults_by_status(&self, status: VaultStatus) -> StorageResult<Vec<Vault>>;

    /// Replace a vault if its stored status and revision still match `expected`.
    ///
    /// Returns the stored record with its bumped revision. Moving a `triggered` vault to
    /// any other status is rejected.
    async fn update_vault(
        &self,
        vault: Vault,
        expected: VaultPrecondition,
    ) -> StorageResult<Vault>;

    /// Store the owner contact details for a vault, replacing any previous profile.
    async fn upsert_owner(&self, vault_id: &str, owner: OwnerProfile) -> StorageResult<()>;

    async fn get_owner(&self, vault_id: &str) -> StorageResult<Option<OwnerProfile>>;

    async fn insert_beneficiary(&self, beneficiary: Beneficiary) -> StorageResult<Beneficiary>;

    async fn get_beneficiary(&self, beneficiary_id: &str) -> StorageResult<Option<Beneficiary>>;

    async fn list_beneficiaries(&self, vault_id: &str) -> StorageResult<Vec<Beneficiary>>;

    /// Replace a beneficiary if its stored revision still equals `expected_revision`.
    ///
    /// Status regressions are rejected.
    async fn update_beneficiary(
        &self,
        beneficiary: Beneficiary,
        expected_revision: u64,
    ) -> StorageResult<Beneficiary>;

    /// Seal and append a lifecycle event.
    async fn append_event(&self, event: DeadManSwitchEvent) -> StorageResult<DeadManSwitchEvent>;

    async fn list_events(&self, vault_id: Option<&str>) -> StorageResult<Vec<DeadManSwitchEvent>>;

    /// Seal and append an administrator audit entry.
    async fn append_compensation(
        &self,
        entry: CompensationLogEntry,
    ) -> StorageResult<CompensationLogEntry>;

    async fn list_compensations(
        &self,
        vault_id: Option<&str>,
    ) -> StorageResult<Vec<CompensationLogEntry>>;

    /// Verify both hash chains (events, compensations).
    async fn verify_chains(&self) -> StorageResult<bool>;
}

pub(crate) fn check_vault_precondition(
    current: &Vault,
    next: &Vault,
    expected: VaultPrecondition,
) -> StorageResult<()> {
    if current.status != expected.status || current.revision != expected.revision {
        return Err(HeirloomError::Conflict(format!(
            "vault '{}' expected status '{}' at revision {}, found '{}' at revision {}",
            current.vault_id,
            expected.status.name(),
            expected.revision,
            current.status.name(),
            current.revision
        )));
    }
    if current.status.is_terminal() && next.status != current.status {
        return Err(HeirloomError::Conflict(format!(
            "vault '{}' is triggered; status is terminal",
            current.vault_id
        )));
    }
    Ok(())
}

pub(crate) fn check_beneficiary_precondition(
    current: &Beneficiary,
    next: &Beneficiary,
    expected_revision: u64,
) -> StorageResult<()> {
    if current.revision != expected_revision {
        return Err(HeirloomError::Conflict(format!(
            "beneficiary '{}' expected revision {}, found {}",
            current.beneficiary_id, expected_revision, current.revision
        )));
    }
    if next.status < current.status {
        return Err(HeirloomError::Conflict(format!(
            "beneficiary '{}' cannot move from '{}' back to '{}'",
            current.beneficiary_id,
            current.status.name(),
            next.status.name()
        )));
    }
    Ok(())
}
