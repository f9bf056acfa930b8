//! In-memory storage implementation

use super::traits::*;
use crate::error::HeirloomError;
use crate::ledger::AppendOnlyLog;
use crate::types::{
    Beneficiary, CompensationLogEntry, DeadManSwitchEvent, OwnerProfile, Vault, VaultStatus,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory storage for development and testing
#[derive(Debug, Default)]
pub struct InMemoryStore {
    vaults: Arc<RwLock<HashMap<String, Vault>>>,
    owners: Arc<RwLock<HashMap<String, OwnerProfile>>>,
    beneficiaries: Arc<RwLock<HashMap<String, Beneficiary>>>,
    events: Arc<RwLock<AppendOnlyLog<DeadManSwitchEvent>>>,
    compensations: Arc<RwLock<AppendOnlyLog<CompensationLogEntry>>>,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VaultStore for InMemoryStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn insert_vault(&self, vault: Vault) -> StorageResult<Vault> {
        let mut vaults = self.vaults.write().await;
        if vaults.contains_key(&vault.vault_id) {
            return Err(HeirloomError::Conflict(format!(
                "vault '{}' already exists",
                vault.vault_id
            )));
        }
        vaults.insert(vault.vault_id.clone(), vault.clone());
        Ok(vault)
    }

    async fn get_vault(&self, vault_id: &str) -> StorageResult<Option<Vault>> {
        let vaults = self.vaults.read().await;
        Ok(vaults.get(vault_id).cloned())
    }

    async fn list_vaults_by_status(&self, status: VaultStatus) -> StorageResult<Vec<Vault>> {
        let vaults = self.vaults.read().await;
        let mut matching: Vec<Vault> = vaults
            .values()
            .filter(|v| v.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.vault_id.cmp(&b.vault_id));
        Ok(matching)
    }

    async fn update_vault(
        &self,
        mut vault: Vault,
        expected: VaultPrecondition,
    ) -> StorageResult<Vault> {
        let mut vaults = self.vaults.write().await;
        let current = vaults
            .get(&vault.vault_id)
            .ok_or_else(|| HeirloomError::vault_not_found(&vault.vault_id))?;
        check_vault_precondition(current, &vault, expected)?;

        vault.revision = current.revision + 1;
        vaults.insert(vault.vault_id.clone(), vault.clone());
        Ok(vault)
    }

    async fn upsert_owner(&self, vault_id: &str, owner: OwnerProfile) -> StorageResult<()> {
        let mut owners = self.owners.write().await;
        owners.insert(vault_id.to_string(), owner);
        Ok(())
    }

    async fn get_owner(&self, vault_id: &str) -> StorageResult<Option<OwnerProfile>> {
        let owners = self.owners.read().await;
        Ok(owners.get(vault_id).cloned())
    }

    async fn insert_beneficiary(&self, beneficiary: Beneficiary) -> StorageResult<Beneficiary> {
        let mut beneficiaries = self.beneficiaries.write().await;
        if beneficiaries.contains_key(&beneficiary.beneficiary_id) {
            return Err(HeirloomError::Conflict(format!(
                "beneficiary '{}' already exists",
                beneficiary.beneficiary_id
            )));
        }
        beneficiaries.insert(beneficiary.beneficiary_id.clone(), beneficiary.clone());
        Ok(beneficiary)
    }

    async fn get_beneficiary(&self, beneficiary_id: &str) -> StorageResult<Option<Beneficiary>> {
        let beneficiaries = self.beneficiaries.read().await;
        Ok(beneficiaries.get(beneficiary_id).cloned())
    }

    async fn list_beneficiaries(&self, vault_id: &str) -> StorageResult<Vec<Beneficiary>> {
        let beneficiaries = self.beneficiaries.read().await;
        let mut matching: Vec<Beneficiary> = beneficiaries
            .values()
            .filter(|b| b.vault_id == vault_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.beneficiary_id.cmp(&b.beneficiary_id))
        });
        Ok(matching)
    }

    async fn update_beneficiary(
        &self,
        mut beneficiary: Beneficiary,
        expected_revision: u64,
    ) -> StorageResult<Beneficiary> {
        let mut beneficiaries = self.beneficiaries.write().await;
        let current = beneficiaries
            .get(&beneficiary.beneficiary_id)
            .ok_or_else(|| HeirloomError::beneficiary_not_found(&beneficiary.beneficiary_id))?;
        check_beneficiary_precondition(current, &beneficiary, expected_revision)?;

        beneficiary.revision = current.revision + 1;
        beneficiaries.insert(beneficiary.beneficiary_id.clone(), beneficiary.clone());
        Ok(beneficiary)
    }

    async fn append_event(&self, event: DeadManSwitchEvent) -> StorageResult<DeadManSwitchEvent> {
        let mut events = self.events.write().await;
        events.append(event)
    }

    async fn list_events(&self, vault_id: Option<&str>) -> StorageResult<Vec<DeadManSwitchEvent>> {
        let events = self.events.read().await;
        Ok(events
            .entries()
            .iter()
            .filter(|e| vault_id.map_or(true, |id| e.vault_id == id))
            .cloned()
            .collect())
    }

    async fn append_compensation(
        &self,
        entry: CompensationLogEntry,
    ) -> StorageResult<CompensationLogEntry> {
        let mut compensations = self.compensations.write().await;
        compensations.append(entry)
    }

    async fn list_compensations(
        &self,
        vault_id: Option<&str>,
    ) -> StorageResult<Vec<CompensationLogEntry>> {
        let compensations = self.compensations.read().await;
        Ok(compensations
            .entries()
            .iter()
            .filter(|e| vault_id.map_or(true, |id| e.vault_id == id))
            .cloned()
            .collect())
    }

    async fn verify_chains(&self) -> StorageResult<bool> {
        let events = self.events.read().await;
        let compensations = self.compensations.read().await;
        Ok(events.verify_chain() && compensations.verify_chain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_beneficiary, sample_vault};
    use crate::types::{BeneficiaryStatus, PlanTier, SwitchEventKind};
    use chrono::Utc;

    #[tokio::test]
    async fn conditional_update_rejects_stale_revision() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let vault = store
            .insert_vault(sample_vault("v1", PlanTier::Base, now))
            .await
            .unwrap();
        let expected = VaultPrecondition::of(&vault);

        let mut first = vault.clone();
        first.status = VaultStatus::PendingVerification;
        let stored = store.update_vault(first, expected).await.unwrap();
        assert_eq!(stored.revision, vault.revision + 1);

        let mut second = vault.clone();
        second.status = VaultStatus::PendingVerification;
        let err = store.update_vault(second, expected).await.unwrap_err();
        assert!(matches!(err, HeirloomError::Conflict(_)));
    }

    #[tokio::test]
    async fn triggered_status_cannot_be_left() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut vault = sample_vault("v1", PlanTier::Base, now);
        vault.status = VaultStatus::Triggered;
        let vault = store.insert_vault(vault).await.unwrap();

        let mut revived = vault.clone();
        revived.status = VaultStatus::Active;
        let err = store
            .update_vault(revived, VaultPrecondition::of(&vault))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("terminal"));
    }

    #[tokio::test]
    async fn beneficiary_status_regression_is_rejected() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut beneficiary = sample_beneficiary("b1", "v1", true, now);
        beneficiary.status = BeneficiaryStatus::Released;
        let beneficiary = store.insert_beneficiary(beneficiary).await.unwrap();

        let mut regressed = beneficiary.clone();
        regressed.status = BeneficiaryStatus::Notified;
        assert!(store
            .update_beneficiary(regressed, beneficiary.revision)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn owner_profile_is_replaced_on_upsert() {
        let store = InMemoryStore::new();
        assert!(store.get_owner("v1").await.unwrap().is_none());

        let mut owner = OwnerProfile {
            email: "owner@example.com".to_string(),
            name: "Owner".to_string(),
            locale: "en".to_string(),
        };
        store.upsert_owner("v1", owner.clone()).await.unwrap();
        owner.email = "new@example.com".to_string();
        store.upsert_owner("v1", owner).await.unwrap();

        let stored = store.get_owner("v1").await.unwrap().unwrap();
        assert_eq!(stored.email, "new@example.com");
        assert!(store.get_owner("v2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_are_filtered_per_vault_and_chained() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for vault in ["v1", "v2", "v1"] {
            store
                .append_event(DeadManSwitchEvent::new(
                    vault,
                    SwitchEventKind::WarningSent,
                    serde_json::Value::Null,
                    now,
                ))
                .await
                .unwrap();
        }

        assert_eq!(store.list_events(Some("v1")).await.unwrap().len(), 2);
        assert_eq!(store.list_events(None).await.unwrap().len(), 3);
        assert!(store.verify_chains().await.unwrap());
    }
}
