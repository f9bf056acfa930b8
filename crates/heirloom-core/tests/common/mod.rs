//! Shared harness for the lifecycle integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use heirloom_core::storage::VaultPrecondition;
use heirloom_core::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationRequest>>,
    failing: Mutex<HashSet<NotificationKind>>,
}

impl RecordingNotifier {
    pub fn fail(&self, kind: NotificationKind) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub fn recover(&self, kind: NotificationKind) {
        self.failing.lock().unwrap().remove(&kind);
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of(&self, kind: NotificationKind) -> Vec<NotificationRequest> {
        self.sent().into_iter().filter(|r| r.kind == kind).collect()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    fn provider(&self) -> &'static str {
        "recording"
    }

    async fn send(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationReceipt, HeirloomError> {
        if self.failing.lock().unwrap().contains(&request.kind) {
            return Err(HeirloomError::external("recording", "rejected by provider"));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(request.clone());
        Ok(NotificationReceipt {
            message_id: format!("m-{}", sent.len()),
            accepted_at: Utc::now(),
        })
    }
}

#[derive(Default)]
pub struct RecordingShipper {
    shipped: Mutex<Vec<ShippingAddress>>,
}

impl RecordingShipper {
    pub fn shipped(&self) -> Vec<ShippingAddress> {
        self.shipped.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShipmentRequester for RecordingShipper {
    fn provider(&self) -> &'static str {
        "recording-carrier"
    }

    async fn create_shipment(
        &self,
        address: &ShippingAddress,
        _asset_description: &str,
    ) -> Result<ShipmentReceipt, HeirloomError> {
        let mut shipped = self.shipped.lock().unwrap();
        shipped.push(address.clone());
        Ok(ShipmentReceipt {
            tracking_number: format!("1Z{:06}", shipped.len()),
            carrier_status: "label_created".to_string(),
        })
    }
}

#[derive(Default)]
pub struct StaticDirectory {
    missing: Mutex<HashSet<String>>,
}

impl StaticDirectory {
    pub fn forget(&self, vault_id: &str) {
        self.missing.lock().unwrap().insert(vault_id.to_string());
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn get_owner(&self, vault_id: &str) -> Result<OwnerProfile, HeirloomError> {
        if self.missing.lock().unwrap().contains(vault_id) {
            return Err(HeirloomError::owner_not_found(vault_id));
        }
        Ok(OwnerProfile {
            email: format!("{vault_id}-owner@example.com"),
            name: "Owner".to_string(),
            locale: "en".to_string(),
        })
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub shipper: Arc<RecordingShipper>,
    pub directory: Arc<StaticDirectory>,
    pub engine: ReconciliationEngine,
    pub heartbeats: HeartbeatRecorder,
    pub access: ReleaseAccess,
    pub ledger: CompensationLedger,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(store: Arc<InMemoryStore>) -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        let shipper = Arc::new(RecordingShipper::default());
        let directory = Arc::new(StaticDirectory::default());
        let collaborators = Collaborators::new(
            notifier.clone(),
            shipper.clone(),
            directory.clone(),
            std::time::Duration::from_secs(2),
        );
        let engine =
            ReconciliationEngine::new(store.clone(), collaborators, EngineConfig::default());
        Self {
            heartbeats: HeartbeatRecorder::new(store.clone()),
            access: ReleaseAccess::new(store.clone()),
            ledger: CompensationLedger::new(store.clone(), engine.orchestrator().clone()),
            engine,
            store,
            notifier,
            shipper,
            directory,
        }
    }

    pub async fn insert(&self, vault: Vault) -> Vault {
        self.store.insert_vault(vault).await.unwrap()
    }

    pub async fn insert_beneficiary(&self, beneficiary: Beneficiary) -> Beneficiary {
        self.store.insert_beneficiary(beneficiary).await.unwrap()
    }

    pub async fn vault(&self, vault_id: &str) -> Vault {
        self.store.get_vault(vault_id).await.unwrap().unwrap()
    }

    pub async fn beneficiary(&self, beneficiary_id: &str) -> Beneficiary {
        self.store
            .get_beneficiary(beneficiary_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn events(&self, vault_id: &str) -> Vec<DeadManSwitchEvent> {
        self.store.list_events(Some(vault_id)).await.unwrap()
    }

    pub async fn events_of(&self, vault_id: &str, kind: SwitchEventKind) -> usize {
        self.events(vault_id)
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Overwrite a stored vault regardless of its revision.
    pub async fn force(&self, vault: Vault) -> Vault {
        let current = self.vault(&vault.vault_id).await;
        self.store
            .update_vault(vault, VaultPrecondition::of(&current))
            .await
            .unwrap()
    }
}

pub fn vault(id: &str, tier: PlanTier, last_seen_at: DateTime<Utc>) -> Vault {
    Vault {
        vault_id: id.to_string(),
        owner_id: format!("owner-{id}"),
        payload: None,
        status: VaultStatus::Active,
        heartbeat_frequency_days: 90,
        grace_period_days: 7,
        last_seen_at,
        warning_email_sent_at: None,
        warning_email_count: 0,
        reminder_email_sent_at: None,
        verification_token: None,
        verification_token_expires_at: None,
        plan_level: tier,
        current_period_end: last_seen_at + Duration::days(365),
        bonus_days: 0,
        triggered_at: None,
        revision: 0,
        created_at: last_seen_at,
        updated_at: last_seen_at,
    }
}

pub fn pending_vault(
    id: &str,
    tier: PlanTier,
    last_seen_at: DateTime<Utc>,
    warned_at: DateTime<Utc>,
) -> Vault {
    let mut vault = vault(id, tier, last_seen_at);
    vault.status = VaultStatus::PendingVerification;
    vault.warning_email_count = 1;
    vault.warning_email_sent_at = Some(warned_at);
    vault.verification_token = Some("hv_pending".to_string());
    vault.verification_token_expires_at = Some(warned_at + Duration::days(7));
    vault
}

pub fn beneficiary(
    id: &str,
    vault_id: &str,
    complete_address: bool,
    now: DateTime<Utc>,
) -> Beneficiary {
    let address = ShippingAddress {
        recipient_name: format!("Heir {id}"),
        line1: "42 Elm Road".to_string(),
        line2: Some("Flat 3".to_string()),
        city: "Bristol".to_string(),
        region: "Avon".to_string(),
        postal_code: if complete_address {
            "BS1 4DJ".to_string()
        } else {
            String::new()
        },
        country: "GB".to_string(),
        phone: "+441170000000".to_string(),
    };
    Beneficiary {
        beneficiary_id: id.to_string(),
        vault_id: vault_id.to_string(),
        name: format!("Heir {id}"),
        email: format!("{id}@heirs.example"),
        locale: Some("en-GB".to_string()),
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
