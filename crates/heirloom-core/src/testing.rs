//! Fixtures and in-process fakes shared by the unit tests.

use crate::connectors::{
    AccountDirectory, Collaborators, NotificationKind, NotificationReceipt, NotificationRequest,
    NotificationSender, ShipmentReceipt, ShipmentRequester,
};
use crate::error::HeirloomError;
use crate::plan::limits_for;
use crate::storage::{InMemoryStore, StorageResult, VaultPrecondition, VaultStore};
use crate::types::{
    Beneficiary, BeneficiaryStatus, CompensationLogEntry, DeadManSwitchEvent, OwnerProfile,
    PlanTier, ShippingAddress, Vault, VaultStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub fn sample_vault(id: &str, tier: PlanTier, now: DateTime<Utc>) -> Vault {
    Vault {
        vault_id: id.to_string(),
        owner_id: format!("owner-{id}"),
        payload: None,
        status: VaultStatus::Active,
        heartbeat_frequency_days: 90,
        grace_period_days: 7,
        last_seen_at: now,
        warning_email_sent_at: None,
        warning_email_count: 0,
        reminder_email_sent_at: None,
        verification_token: None,
        verification_token_expires_at: None,
        plan_level: tier,
        current_period_end: now + Duration::days(30),
        bonus_days: 0,
        triggered_at: None,
        revision: 0,
        created_at: now,
        updated_at: now,
    }
}

pub fn sample_beneficiary(
    id: &str,
    vault_id: &str,
    complete_address: bool,
    now: DateTime<Utc>,
) -> Beneficiary {
    let mut address = ShippingAddress {
        recipient_name: "Ada Heir".to_string(),
        line1: "1 Main St".to_string(),
        line2: None,
        city: "Springfield".to_string(),
        region: "IL".to_string(),
        postal_code: "62701".to_string(),
        country: "US".to_string(),
        phone: "+15550100".to_string(),
    };
    if !complete_address {
        address.phone.clear();
    }

    Beneficiary {
        beneficiary_id: id.to_string(),
        vault_id: vault_id.to_string(),
        name: format!("Heir {id}"),
        email: format!("{id}@example.com"),
        locale: None,
        shipping_address: Some(address),
        status: BeneficiaryStatus::Pending,
        release_token: None,
        release_token_expires_at: None,
        decryption_count: 0,
        decryption_limit: limits_for(PlanTier::Base).decryption_limit,
        bonus_decryption_count: 0,
        notified_at: None,
        released_at: None,
        revision: 0,
        created_at: now,
        updated_at: now,
    }
}

pub fn collaborators(
    notifier: Arc<FakeNotifier>,
    shipper: Arc<FakeShipper>,
    directory: Arc<FakeDirectory>,
) -> Collaborators {
    Collaborators::new(
        notifier,
        shipper,
        directory,
        std::time::Duration::from_secs(1),
    )
}

#[derive(Default)]
pub struct FakeNotifier {
    sent: Mutex<Vec<NotificationRequest>>,
    failing: HashSet<NotificationKind>,
}

impl FakeNotifier {
    pub fn failing_for(kind: NotificationKind) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: HashSet::from([kind]),
        }
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for FakeNotifier {
    fn provider(&self) -> &'static str {
        "fake-mail"
    }

    async fn send(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationReceipt, HeirloomError> {
        if self.failing.contains(&request.kind) {
            return Err(HeirloomError::external("fake-mail", "mailbox unavailable"));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(request.clone());
        Ok(NotificationReceipt {
            message_id: format!("msg-{}", sent.len()),
            accepted_at: Utc::now(),
        })
    }
}

#[derive(Default)]
pub struct FakeShipper {
    calls: Mutex<usize>,
    fail: bool,
}

impl FakeShipper {
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ShipmentRequester for FakeShipper {
    fn provider(&self) -> &'static str {
        "fake-carrier"
    }

    async fn create_shipment(
        &self,
        _address: &ShippingAddress,
        _asset_description: &str,
    ) -> Result<ShipmentReceipt, HeirloomError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if self.fail {
            return Err(HeirloomError::external("fake-carrier", "label service down"));
        }
        Ok(ShipmentReceipt {
            tracking_number: format!("TRK{:04}", *calls),
            carrier_status: "label_created".to_string(),
        })
    }
}

/// Resolves every vault to a generic owner except the ones listed as missing.
#[derive(Default)]
pub struct FakeDirectory {
    missing: HashSet<String>,
}

impl FakeDirectory {
    pub fn missing(vault_ids: &[&str]) -> Self {
        Self {
            missing: vault_ids.iter().map(|id| id.to_string()).collect(),
        }
    }
}

#[async_trait]
impl AccountDirectory for FakeDirectory {
    async fn get_owner(&self, vault_id: &str) -> Result<OwnerProfile, HeirloomError> {
        if self.missing.contains(vault_id) {
            return Err(HeirloomError::owner_not_found(vault_id));
        }
        Ok(OwnerProfile {
            email: format!("owner-{vault_id}@example.com"),
            name: "Vault Owner".to_string(),
            locale: "en".to_string(),
        })
    }
}

/// In-memory store that lands a competing write just before each of the next
/// `contended` conditional vault updates, as an overlapping engine step would.
pub struct ContendedStore {
    inner: InMemoryStore,
    contended: Mutex<usize>,
}

impl ContendedStore {
    pub fn new(contended: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            contended: Mutex::new(contended),
        }
    }

    fn take_contention(&self) -> bool {
        let mut remaining = self.contended.lock().unwrap();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }
}

#[async_trait]
impl VaultStore for ContendedStore {
    fn backend_label(&self) -> &'static str {
        "contended-memory"
    }

    async fn insert_vault(&self, vault: Vault) -> StorageResult<Vault> {
        self.inner.insert_vault(vault).await
    }

    async fn get_vault(&self, vault_id: &str) -> StorageResult<Option<Vault>> {
        self.inner.get_vault(vault_id).await
    }

    async fn list_vaults_by_status(&self, status: VaultStatus) -> StorageResult<Vec<Vault>> {
        self.inner.list_vaults_by_status(status).await
    }

    async fn update_vault(
        &self,
        vault: Vault,
        expected: VaultPrecondition,
    ) -> StorageResult<Vault> {
        if self.take_contention() {
            if let Some(current) = self.inner.get_vault(&vault.vault_id).await? {
                let precondition = VaultPrecondition::of(&current);
                self.inner.update_vault(current, precondition).await?;
            }
        }
        self.inner.update_vault(vault, expected).await
    }

    async fn upsert_owner(&self, vault_id: &str, owner: OwnerProfile) -> StorageResult<()> {
        self.inner.upsert_owner(vault_id, owner).await
    }

    async fn get_owner(&self, vault_id: &str) -> StorageResult<Option<OwnerProfile>> {
        self.inner.get_owner(vault_id).await
    }

    async fn insert_beneficiary(&self, beneficiary: Beneficiary) -> StorageResult<Beneficiary> {
        self.inner.insert_beneficiary(beneficiary).await
    }

    async fn get_beneficiary(&self, beneficiary_id: &str) -> StorageResult<Option<Beneficiary>> {
        self.inner.get_beneficiary(beneficiary_id).await
    }

    async fn list_beneficiaries(&self, vault_id: &str) -> StorageResult<Vec<Beneficiary>> {
        self.inner.list_beneficiaries(vault_id).await
    }

    async fn update_beneficiary(
        &self,
        beneficiary: Beneficiary,
        expected_revision: u64,
    ) -> StorageResult<Beneficiary> {
        self.inner
            .update_beneficiary(beneficiary, expected_revision)
            .await
    }

    async fn append_event(&self, event: DeadManSwitchEvent) -> StorageResult<DeadManSwitchEvent> {
        self.inner.append_event(event).await
    }

    async fn list_events(&self, vault_id: Option<&str>) -> StorageResult<Vec<DeadManSwitchEvent>> {
        self.inner.list_events(vault_id).await
    }

    async fn append_compensation(
        &self,
        entry: CompensationLogEntry,
    ) -> StorageResult<CompensationLogEntry> {
        self.inner.append_compensation(entry).await
    }

    async fn list_compensations(
        &self,
        vault_id: Option<&str>,
    ) -> StorageResult<Vec<CompensationLogEntry>> {
        self.inner.list_compensations(vault_id).await
    }

    async fn verify_chains(&self) -> StorageResult<bool> {
        self.inner.verify_chains().await
    }
}
