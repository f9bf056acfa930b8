//! Release orchestration for triggered vaults.
//!
//! Every beneficiary is processed independently: a failure for one (shipment provider
//! error, notification timeout) is recorded on that beneficiary's result and never stops
//! the others. Shipment is best-effort; the inheritance notice is always attempted once a
//! release credential has been persisted. The credential write is conditional on the
//! beneficiary's revision, so a beneficiary is released by exactly one run even when a
//! resumed release overlaps the original one.

use crate::connectors::{Collaborators, NotificationKind, NotificationRequest, ShipmentReceipt};
use crate::credentials::{self, CredentialKind};
use crate::error::HeirloomError;
use crate::storage::VaultStore;
use crate::types::{Beneficiary, BeneficiaryStatus, Vault};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_LOCALE: &str = "en";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShipmentOutcome {
    Shipped {
        tracking_number: String,
        carrier_status: String,
    },
    /// Address incomplete; shipment not attempted.
    Skipped { missing_fields: Vec<String> },
    Failed { message: String },
    /// Credential could not be persisted, so nothing downstream ran.
    NotAttempted,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BeneficiaryReleaseResult {
    pub beneficiary_id: String,
    pub credential_issued: bool,
    pub shipment: ShipmentOutcome,
    pub notification_sent: bool,
    /// Recorded failures and diagnostics, in the order they happened.
    pub errors: Vec<String>,
    /// Another run issued this beneficiary's credential first; nothing was done here.
    #[serde(skip)]
    pub superseded: bool,
}

impl BeneficiaryReleaseResult {
    fn new(beneficiary_id: &str) -> Self {
        Self {
            beneficiary_id: beneficiary_id.to_string(),
            credential_issued: false,
            shipment: ShipmentOutcome::NotAttempted,
            notification_sent: false,
            errors: Vec::new(),
            superseded: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseSettings {
    pub release_token_ttl: Duration,
    pub asset_description: String,
    pub max_concurrency: usize,
}

#[derive(Clone)]
pub struct ReleaseOrchestrator {
    store: Arc<dyn VaultStore>,
    collaborators: Collaborators,
    settings: ReleaseSettings,
}

impl ReleaseOrchestrator {
    pub fn new(
        store: Arc<dyn VaultStore>,
        collaborators: Collaborators,
        settings: ReleaseSettings,
    ) -> Self {
        Self {
            store,
            collaborators,
            settings,
        }
    }

    pub fn settings(&self) -> &ReleaseSettings {
        &self.settings
    }

    /// Release a triggered vault to every beneficiary.
    ///
    /// Only a failure to list the beneficiaries is returned as an error.
    #[instrument(skip(self, vault), fields(vault_id = %vault.vault_id))]
    pub async fn release_vault(
        &self,
        vault: &Vault,
        now: DateTime<Utc>,
    ) -> Result<Vec<BeneficiaryReleaseResult>, HeirloomError> {
        let beneficiaries = self.store.list_beneficiaries(&vault.vault_id).await?;
        let results = self.release_all(vault, beneficiaries, now).await;
        info!(
            beneficiaries = results.len(),
            notified = results.iter().filter(|r| r.notification_sent).count(),
            "Vault released"
        );
        Ok(results)
    }

    /// Finish an interrupted release: only beneficiaries still `pending` without a
    /// release credential are processed.
    ///
    /// Returns an empty list when there is nothing left to do. Beneficiaries another run
    /// claims first are dropped from the result.
    #[instrument(skip(self, vault), fields(vault_id = %vault.vault_id))]
    pub async fn resume_release(
        &self,
        vault: &Vault,
        now: DateTime<Utc>,
    ) -> Result<Vec<BeneficiaryReleaseResult>, HeirloomError> {
        let outstanding: Vec<Beneficiary> = self
            .store
            .list_beneficiaries(&vault.vault_id)
            .await?
            .into_iter()
            .filter(awaiting_release)
            .collect();
        if outstanding.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = self.release_all(vault, outstanding, now).await;
        results.retain(|r| !r.superseded);
        if !results.is_empty() {
            info!(
                beneficiaries = results.len(),
                notified = results.iter().filter(|r| r.notification_sent).count(),
                "Interrupted release resumed"
            );
        }
        Ok(results)
    }

    async fn release_all(
        &self,
        vault: &Vault,
        beneficiaries: Vec<Beneficiary>,
        now: DateTime<Utc>,
    ) -> Vec<BeneficiaryReleaseResult> {
        let concurrency = self.settings.max_concurrency.max(1);
        let mut results: Vec<BeneficiaryReleaseResult> = stream::iter(beneficiaries)
            .map(|beneficiary| self.release_one(vault, beneficiary, now))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.beneficiary_id.cmp(&b.beneficiary_id));
        results
    }

    async fn release_one(
        &self,
        vault: &Vault,
        beneficiary: Beneficiary,
        now: DateTime<Utc>,
    ) -> BeneficiaryReleaseResult {
        let mut result = BeneficiaryReleaseResult::new(&beneficiary.beneficiary_id);

        let beneficiary = match self.issue_release_credential(beneficiary, now).await {
            Ok(updated) => updated,
            Err(HeirloomError::Conflict(reason)) => {
                debug!(
                    beneficiary_id = %result.beneficiary_id,
                    reason = %reason,
                    "Beneficiary already claimed by another run"
                );
                result.superseded = true;
                return result;
            }
            Err(err) => {
                warn!(beneficiary_id = %result.beneficiary_id, error = %err, "Could not persist release credential");
                result
                    .errors
                    .push(format!("release credential not persisted: {err}"));
                return result;
            }
        };
        result.credential_issued = true;

        let receipt = match beneficiary.shipping_address.as_ref() {
            Some(address) if address.is_complete() => {
                match self
                    .collaborators
                    .ship(address, &self.settings.asset_description)
                    .await
                {
                    Ok(receipt) => {
                        result.shipment = ShipmentOutcome::Shipped {
                            tracking_number: receipt.tracking_number.clone(),
                            carrier_status: receipt.carrier_status.clone(),
                        };
                        Some(receipt)
                    }
                    Err(err) => {
                        warn!(beneficiary_id = %result.beneficiary_id, error = %err, "Shipment request failed");
                        result.errors.push(format!("shipment failed: {err}"));
                        result.shipment = ShipmentOutcome::Failed {
                            message: err.to_string(),
                        };
                        None
                    }
                }
            }
            other => {
                let missing: Vec<String> = match other {
                    Some(address) => address
                        .missing_fields()
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                    None => vec!["shipping_address".to_string()],
                };
                result.errors.push(format!(
                    "shipment skipped: incomplete address (missing {})",
                    missing.join(", ")
                ));
                result.shipment = ShipmentOutcome::Skipped {
                    missing_fields: missing,
                };
                None
            }
        };

        match self
            .send_inheritance_notice(vault, &beneficiary, receipt.as_ref())
            .await
        {
            Ok(()) => result.notification_sent = true,
            Err(err) => {
                warn!(beneficiary_id = %result.beneficiary_id, error = %err, "Inheritance notice failed");
                result.errors.push(format!("notification failed: {err}"));
            }
        }
        result
    }

    async fn issue_release_credential(
        &self,
        beneficiary: Beneficiary,
        now: DateTime<Utc>,
    ) -> Result<Beneficiary, HeirloomError> {
        let credential =
            credentials::issue(CredentialKind::Release, now, self.settings.release_token_ttl);
        let expected_revision = beneficiary.revision;
        let mut next = beneficiary;
        next.release_token = Some(credential.token);
        next.release_token_expires_at = Some(credential.expires_at);
        next.status = next.status.advance_to(BeneficiaryStatus::Notified);
        next.notified_at = Some(now);
        next.updated_at = now;
        self.store.update_beneficiary(next, expected_revision).await
    }

    /// Send the inheritance notice carrying the beneficiary's current release credential.
    pub(crate) async fn send_inheritance_notice(
        &self,
        vault: &Vault,
        beneficiary: &Beneficiary,
        shipment: Option<&ShipmentReceipt>,
    ) -> Result<(), HeirloomError> {
        let token = beneficiary.release_token.as_deref().ok_or_else(|| {
            HeirloomError::Validation("beneficiary has no release credential".to_string())
        })?;

        let mut template_data = BTreeMap::new();
        template_data.insert("beneficiary_name".to_string(), beneficiary.name.clone());
        template_data.insert("vault_id".to_string(), vault.vault_id.clone());
        template_data.insert("release_token".to_string(), token.to_string());
        if let Some(expires_at) = beneficiary.release_token_expires_at {
            template_data.insert(
                "release_token_expires_at".to_string(),
                expires_at.to_rfc3339(),
            );
        }
        if let Some(receipt) = shipment {
            template_data.insert(
                "tracking_number".to_string(),
                receipt.tracking_number.clone(),
            );
            template_data.insert("carrier_status".to_string(), receipt.carrier_status.clone());
        }

        let request = NotificationRequest {
            kind: NotificationKind::InheritanceNotice,
            recipient: beneficiary.email.clone(),
            template_data,
            locale: beneficiary
                .locale
                .clone()
                .unwrap_or_else(|| DEFAULT_LOCALE.to_string()),
        };
        self.collaborators.notify(&request).await.map(|_| ())
    }
}

/// Still `pending` and never issued a credential.
pub fn awaiting_release(beneficiary: &Beneficiary) -> bool {
    beneficiary.status == BeneficiaryStatus::Pending && beneficiary.release_token.is_none()
}
