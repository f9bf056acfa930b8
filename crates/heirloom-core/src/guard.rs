//! Entitlement guard: read-only checks of proposed actions against plan limits and
//! administrator bonuses. Callers apply the guarded mutation after an allow.

use crate::error::HeirloomError;
use crate::plan::limits_for;
use crate::storage::VaultStore;
use crate::types::{Beneficiary, Vault};
use serde::Serialize;
use std::sync::Arc;

pub const CODE_ALLOWED: &str = "ALLOWED";
pub const CODE_STORAGE_QUOTA: &str = "STORAGE_QUOTA_EXCEEDED";
pub const CODE_BENEFICIARY_LIMIT: &str = "BENEFICIARY_LIMIT_REACHED";
pub const CODE_HEARTBEAT_RANGE: &str = "HEARTBEAT_FREQUENCY_OUT_OF_RANGE";
pub const CODE_DECRYPTION_LIMIT: &str = "DECRYPTION_LIMIT_REACHED";

/// Allow/deny outcome with a machine-readable code and a human-readable reason.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntitlementDecision {
    pub allowed: bool,
    pub code: &'static str,
    pub reason: String,
    /// Remaining decryption attempts; `None` when unlimited or not applicable.
    pub remaining: Option<u32>,
}

impl EntitlementDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            code: CODE_ALLOWED,
            reason: reason.into(),
            remaining: None,
        }
    }

    fn deny(code: &'static str, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            code,
            reason: reason.into(),
            remaining: None,
        }
    }

    /// Convert a deny into `EntitlementDenied`.
    pub fn into_result(self) -> Result<Self, HeirloomError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(HeirloomError::denied(self.code, self.reason))
        }
    }
}

pub fn evaluate_storage(vault: &Vault, proposed_bytes: u64) -> EntitlementDecision {
    let limits = limits_for(vault.effective_tier());
    if proposed_bytes > limits.storage_bytes {
        return EntitlementDecision::deny(
            CODE_STORAGE_QUOTA,
            format!(
                "payload of {} bytes exceeds the {} tier quota of {} bytes",
                proposed_bytes,
                limits.tier.name(),
                limits.storage_bytes
            ),
        );
    }
    EntitlementDecision::allow(format!(
        "{} of {} bytes used",
        proposed_bytes, limits.storage_bytes
    ))
}

pub fn evaluate_beneficiary_count(vault: &Vault, current_count: usize) -> EntitlementDecision {
    let limits = limits_for(vault.effective_tier());
    if current_count >= limits.max_beneficiaries as usize {
        return EntitlementDecision::deny(
            CODE_BENEFICIARY_LIMIT,
            format!(
                "{} tier allows at most {} beneficiaries",
                limits.tier.name(),
                limits.max_beneficiaries
            ),
        );
    }
    EntitlementDecision::allow(format!(
        "{} of {} beneficiaries used",
        current_count, limits.max_beneficiaries
    ))
}

pub fn evaluate_heartbeat_frequency(vault: &Vault, days: u32) -> EntitlementDecision {
    let limits = limits_for(vault.effective_tier());
    let range = limits.heartbeat_range;
    if !range.contains(days) {
        return EntitlementDecision::deny(
            CODE_HEARTBEAT_RANGE,
            format!(
                "{} tier requires a heartbeat every {}-{} days, got {}",
                limits.tier.name(),
                range.min_days,
                range.max_days,
                days
            ),
        );
    }
    EntitlementDecision::allow(format!("{days} days is within tier bounds"))
}

/// Effective decryption limit: `None` for unlimited tiers, otherwise the beneficiary's
/// base limit (falling back to the tier's) plus any administrator bonus.
pub fn effective_decryption_limit(vault: &Vault, beneficiary: &Beneficiary) -> Option<u32> {
    let tier_limit = limits_for(vault.effective_tier()).decryption_limit?;
    let base = beneficiary.decryption_limit.unwrap_or(tier_limit);
    Some(base.saturating_add(beneficiary.bonus_decryption_count))
}

pub fn evaluate_decryption(vault: &Vault, beneficiary: &Beneficiary) -> EntitlementDecision {
    let Some(limit) = effective_decryption_limit(vault, beneficiary) else {
        return EntitlementDecision::allow("unlimited decryptions");
    };

    if beneficiary.decryption_count >= limit {
        return EntitlementDecision::deny(
            CODE_DECRYPTION_LIMIT,
            format!(
                "{} of {} decryption attempts used",
                beneficiary.decryption_count, limit
            ),
        );
    }

    let remaining = limit - beneficiary.decryption_count;
    let mut decision = EntitlementDecision::allow(format!("{remaining} decryption attempts remain"));
    decision.remaining = Some(remaining);
    decision
}

/// Store-backed entitlement checks addressed by record id.
#[derive(Clone)]
pub struct EntitlementGuard {
    store: Arc<dyn VaultStore>,
}

impl EntitlementGuard {
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self { store }
    }

    pub async fn check_storage(
        &self,
        vault_id: &str,
        proposed_bytes: u64,
    ) -> Result<EntitlementDecision, HeirloomError> {
        let vault = self.load_vault(vault_id).await?;
        Ok(evaluate_storage(&vault, proposed_bytes))
    }

    pub async fn check_beneficiary_count(
        &self,
        vault_id: &str,
    ) -> Result<EntitlementDecision, HeirloomError> {
        let vault = self.load_vault(vault_id).await?;
        let count = self.store.list_beneficiaries(vault_id).await?.len();
        Ok(evaluate_beneficiary_count(&vault, count))
    }

    pub async fn check_heartbeat_frequency(
        &self,
        vault_id: &str,
        days: u32,
    ) -> Result<EntitlementDecision, HeirloomError> {
        let vault = self.load_vault(vault_id).await?;
        Ok(evaluate_heartbeat_frequency(&vault, days))
    }

    pub async fn check_decryption(
        &self,
        beneficiary_id: &str,
        vault_id: &str,
    ) -> Result<EntitlementDecision, HeirloomError> {
        let vault = self.load_vault(vault_id).await?;
        let beneficiary = self
            .store
            .get_beneficiary(beneficiary_id)
            .await?
            .filter(|b| b.vault_id == vault_id)
            .ok_or_else(|| HeirloomError::beneficiary_not_found(beneficiary_id))?;
        Ok(evaluate_decryption(&vault, &beneficiary))
    }

    async fn load_vault(&self, vault_id: &str) -> Result<Vault, HeirloomError> {
        self.store
            .get_vault(vault_id)
            .await?
            .ok_or_else(|| HeirloomError::vault_not_found(vault_id))
    }
}
