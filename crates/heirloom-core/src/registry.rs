//! Owner setup operations. Every mutation passes through the entitlement guard first.

use crate::error::HeirloomError;
use crate::guard::{evaluate_heartbeat_frequency, EntitlementGuard};
use crate::plan::{limits_for, PlanLimits};
use crate::storage::{VaultPrecondition, VaultStore};
use crate::types::{
    Beneficiary, BeneficiaryStatus, EncryptedPayload, PlanTier, ShippingAddress, Vault,
    VaultStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const MAX_ADDRESS_FIELD_LEN: usize = 200;

fn default_grace_period_days() -> u32 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVault {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub vault_id: Option<String>,
    pub owner_id: String,
    pub plan_level: PlanTier,
    pub heartbeat_frequency_days: u32,
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: u32,
    pub current_period_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBeneficiary {
    #[serde(default)]
    pub beneficiary_id: Option<String>,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub shipping_address: Option<ShippingAddress>,
}

/// Current plan limits next to what the vault actually uses.
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementSummary {
    pub vault_id: String,
    pub plan_level: PlanTier,
    pub effective_tier: PlanTier,
    pub limits: PlanLimits,
    pub stored_bytes: u64,
    pub beneficiary_count: usize,
}

#[derive(Clone)]
pub struct VaultRegistry {
    store: Arc<dyn VaultStore>,
    guard: EntitlementGuard,
}

impl VaultRegistry {
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        let guard = EntitlementGuard::new(store.clone());
        Self { store, guard }
    }

    pub async fn create_vault(&self, request: NewVault) -> Result<Vault, HeirloomError> {
        self.create_vault_at(request, Utc::now()).await
    }

    pub async fn create_vault_at(
        &self,
        request: NewVault,
        now: DateTime<Utc>,
    ) -> Result<Vault, HeirloomError> {
        if request.owner_id.trim().is_empty() {
            return Err(HeirloomError::Validation("owner_id is required".to_string()));
        }

        let vault = Vault {
            vault_id: request
                .vault_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            owner_id: request.owner_id,
            payload: None,
            status: VaultStatus::Active,
            heartbeat_frequency_days: request.heartbeat_frequency_days,
            grace_period_days: request.grace_period_days,
            last_seen_at: now,
            warning_email_sent_at: None,
            warning_email_count: 0,
            reminder_email_sent_at: None,
            verification_token: None,
            verification_token_expires_at: None,
            plan_level: request.plan_level,
            current_period_end: request.current_period_end,
            bonus_days: 0,
            triggered_at: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        evaluate_heartbeat_frequency(&vault, vault.heartbeat_frequency_days).into_result()?;

        let vault = self.store.insert_vault(vault).await?;
        info!(
            vault_id = %vault.vault_id,
            tier = vault.plan_level.name(),
            "Vault created"
        );
        Ok(vault)
    }

    pub async fn add_beneficiary(
        &self,
        vault_id: &str,
        request: NewBeneficiary,
    ) -> Result<Beneficiary, HeirloomError> {
        self.add_beneficiary_at(vault_id, request, Utc::now()).await
    }

    /// Add a beneficiary; its base decryption limit is copied from the vault's tier.
    pub async fn add_beneficiary_at(
        &self,
        vault_id: &str,
        request: NewBeneficiary,
        now: DateTime<Utc>,
    ) -> Result<Beneficiary, HeirloomError> {
        if request.name.trim().is_empty() || request.email.trim().is_empty() {
            return Err(HeirloomError::Validation(
                "beneficiary name and email are required".to_string(),
            ));
        }
        if let Some(address) = &request.shipping_address {
            validate_address(address)?;
        }

        let vault = self.load_open_vault(vault_id).await?;
        self.guard
            .check_beneficiary_count(vault_id)
            .await?
            .into_result()?;

        let beneficiary = Beneficiary {
            beneficiary_id: request
                .beneficiary_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            vault_id: vault_id.to_string(),
            name: request.name,
            email: request.email,
            locale: request.locale,
            shipping_address: request.shipping_address,
            status: BeneficiaryStatus::Pending,
            release_token: None,
            release_token_expires_at: None,
            decryption_count: 0,
            decryption_limit: limits_for(vault.effective_tier()).decryption_limit,
            bonus_decryption_count: 0,
            notified_at: None,
            released_at: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        };

        let beneficiary = self.store.insert_beneficiary(beneficiary).await?;
        info!(
            vault_id = %vault_id,
            beneficiary_id = %beneficiary.beneficiary_id,
            complete_address = beneficiary.has_complete_address(),
            "Beneficiary added"
        );
        Ok(beneficiary)
    }

    pub async fn store_payload(
        &self,
        vault_id: &str,
        payload: EncryptedPayload,
    ) -> Result<Vault, HeirloomError> {
        if payload.ciphertext.is_empty() {
            return Err(HeirloomError::Validation("ciphertext is empty".to_string()));
        }
        self.guard
            .check_storage(vault_id, payload.size_bytes)
            .await?
            .into_result()?;

        let size_bytes = payload.size_bytes;
        let vault = self
            .mutate(vault_id, |vault, now| {
                vault.payload = Some(payload);
                vault.updated_at = now;
            })
            .await?;
        info!(vault_id = %vault_id, size_bytes, "Encrypted payload stored");
        Ok(vault)
    }

    pub async fn set_heartbeat_frequency(
        &self,
        vault_id: &str,
        days: u32,
    ) -> Result<Vault, HeirloomError> {
        self.guard
            .check_heartbeat_frequency(vault_id, days)
            .await?
            .into_result()?;

        let vault = self
            .mutate(vault_id, |vault, now| {
                vault.heartbeat_frequency_days = days;
                vault.updated_at = now;
            })
            .await?;
        info!(vault_id = %vault_id, days, "Heartbeat frequency updated");
        Ok(vault)
    }

    pub async fn get_vault(&self, vault_id: &str) -> Result<Vault, HeirloomError> {
        self.store
            .get_vault(vault_id)
            .await?
            .ok_or_else(|| HeirloomError::vault_not_found(vault_id))
    }

    pub async fn entitlements(&self, vault_id: &str) -> Result<EntitlementSummary, HeirloomError> {
        let vault = self.get_vault(vault_id).await?;
        let beneficiary_count = self.store.list_beneficiaries(vault_id).await?.len();
        let effective_tier = vault.effective_tier();
        Ok(EntitlementSummary {
            vault_id: vault.vault_id.clone(),
            plan_level: vault.plan_level,
            effective_tier,
            limits: limits_for(effective_tier),
            stored_bytes: vault.stored_bytes(),
            beneficiary_count,
        })
    }

    async fn load_open_vault(&self, vault_id: &str) -> Result<Vault, HeirloomError> {
        let vault = self.get_vault(vault_id).await?;
        if vault.status.is_terminal() {
            return Err(HeirloomError::Conflict(format!(
                "vault '{vault_id}' has been released and can no longer be edited"
            )));
        }
        Ok(vault)
    }

    /// Apply a setup change under a conditional update on the loaded revision.
    async fn mutate<F>(&self, vault_id: &str, apply: F) -> Result<Vault, HeirloomError>
    where
        F: FnOnce(&mut Vault, DateTime<Utc>),
    {
        let current = self.load_open_vault(vault_id).await?;
        let expected = VaultPrecondition::of(&current);
        let mut next = current;
        apply(&mut next, Utc::now());
        self.store.update_vault(next, expected).await
    }
}

fn validate_address(address: &ShippingAddress) -> Result<(), HeirloomError> {
    let fields = [
        ("recipient_name", address.recipient_name.as_str()),
        ("line1", address.line1.as_str()),
        ("line2", address.line2.as_deref().unwrap_or("")),
        ("city", address.city.as_str()),
        ("region", address.region.as_str()),
        ("postal_code", address.postal_code.as_str()),
        ("country", address.country.as_str()),
        ("phone", address.phone.as_str()),
    ];
    for (name, value) in fields {
        if value.len() > MAX_ADDRESS_FIELD_LEN || value.chars().any(char::is_control) {
            return Err(HeirloomError::Validation(format!(
                "shipping address field '{name}' is malformed"
            )));
        }
    }
    Ok(())
}
