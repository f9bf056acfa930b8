//! Beneficiary access to a released vault.

use crate::credentials;
use crate::error::HeirloomError;
use crate::guard::evaluate_decryption;
use crate::storage::VaultStore;
use crate::types::{Beneficiary, BeneficiaryStatus, DeadManSwitchEvent, SwitchEventKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DecryptionReceipt {
    pub beneficiary_id: String,
    pub vault_id: String,
    pub decryption_count: u32,
    /// `None` when the tier is unlimited.
    pub remaining: Option<u32>,
}

#[derive(Clone)]
pub struct ReleaseAccess {
    store: Arc<dyn VaultStore>,
}

impl ReleaseAccess {
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self { store }
    }

    pub async fn record_decryption(
        &self,
        beneficiary_id: &str,
        release_token: &str,
    ) -> Result<DecryptionReceipt, HeirloomError> {
        self.record_decryption_at(beneficiary_id, release_token, Utc::now())
            .await
    }

    /// Count one decryption attempt against the beneficiary's effective limit.
    ///
    /// The limit check and the increment are tied together by a conditional update on the
    /// beneficiary revision, so concurrent attempts cannot overshoot the limit.
    pub async fn record_decryption_at(
        &self,
        beneficiary_id: &str,
        release_token: &str,
        now: DateTime<Utc>,
    ) -> Result<DecryptionReceipt, HeirloomError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let beneficiary = self
                .store
                .get_beneficiary(beneficiary_id)
                .await?
                .ok_or_else(|| HeirloomError::beneficiary_not_found(beneficiary_id))?;
            validate_release_token(&beneficiary, release_token, now)?;

            let vault = self
                .store
                .get_vault(&beneficiary.vault_id)
                .await?
                .ok_or_else(|| HeirloomError::vault_not_found(&beneficiary.vault_id))?;
            if !vault.status.is_terminal() {
                return Err(HeirloomError::Conflict(format!(
                    "vault '{}' has not been released",
                    vault.vault_id
                )));
            }

            let decision = evaluate_decryption(&vault, &beneficiary).into_result()?;

            let expected_revision = beneficiary.revision;
            let mut next = beneficiary;
            next.decryption_count = next.decryption_count.saturating_add(1);
            next.status = next.status.advance_to(BeneficiaryStatus::Released);
            next.released_at = next.released_at.or(Some(now));
            next.updated_at = now;

            match self.store.update_beneficiary(next, expected_revision).await {
                Ok(updated) => {
                    let remaining = decision.remaining.map(|r| r.saturating_sub(1));
                    self.store
                        .append_event(DeadManSwitchEvent::new(
                            &updated.vault_id,
                            SwitchEventKind::DecryptionRecorded,
                            json!({
                                "beneficiary_id": updated.beneficiary_id,
                                "decryption_count": updated.decryption_count,
                                "remaining": remaining,
                            }),
                            now,
                        ))
                        .await?;
                    info!(
                        vault_id = %updated.vault_id,
                        beneficiary_id = %updated.beneficiary_id,
                        decryption_count = updated.decryption_count,
                        "Decryption recorded"
                    );
                    return Ok(DecryptionReceipt {
                        beneficiary_id: updated.beneficiary_id,
                        vault_id: updated.vault_id,
                        decryption_count: updated.decryption_count,
                        remaining,
                    });
                }
                Err(HeirloomError::Conflict(reason)) if attempt < MAX_CAS_ATTEMPTS => {
                    debug!(beneficiary_id = %beneficiary_id, reason = %reason, "Decryption raced; re-evaluating");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn validate_release_token(
    beneficiary: &Beneficiary,
    presented: &str,
    now: DateTime<Utc>,
) -> Result<(), HeirloomError> {
    let stored = beneficiary.release_token.as_deref().ok_or_else(|| {
        HeirloomError::Validation("no release credential has been issued".to_string())
    })?;
    if !credentials::matches(stored, presented) {
        return Err(HeirloomError::Validation(
            "release credential does not match".to_string(),
        ));
    }
    match beneficiary.release_token_expires_at {
        Some(expires_at) if expires_at > now => Ok(()),
        _ => Err(HeirloomError::Validation(
            "release credential has expired".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::CODE_DECRYPTION_LIMIT;
    use crate::storage::InMemoryStore;
    use crate::testing::{sample_beneficiary, sample_vault};
    use crate::types::{PlanTier, VaultStatus};
    use chrono::Duration;

    async fn released_fixture(
        tier: PlanTier,
        limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let mut vault = sample_vault("v1", tier, now);
        vault.status = VaultStatus::Triggered;
        store.insert_vault(vault).await.unwrap();

        let mut beneficiary = sample_beneficiary("b1", "v1", true, now);
        beneficiary.status = BeneficiaryStatus::Notified;
        beneficiary.release_token = Some("hr_known".to_string());
        beneficiary.release_token_expires_at = Some(now + Duration::days(90));
        beneficiary.decryption_limit = limit;
        store.insert_beneficiary(beneficiary).await.unwrap();
        store
    }

    #[tokio::test]
    async fn decryptions_stop_at_the_limit() {
        let now = Utc::now();
        let store = released_fixture(PlanTier::Base, Some(2), now).await;
        let access = ReleaseAccess::new(store.clone());

        let first = access.record_decryption_at("b1", "hr_known", now).await.unwrap();
        assert_eq!(first.decryption_count, 1);
        assert_eq!(first.remaining, Some(1));

        let second = access.record_decryption_at("b1", "hr_known", now).await.unwrap();
        assert_eq!(second.remaining, Some(0));

        let err = access
            .record_decryption_at("b1", "hr_known", now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HeirloomError::EntitlementDenied { ref code, .. } if code == CODE_DECRYPTION_LIMIT
        ));

        let stored = store.get_beneficiary("b1").await.unwrap().unwrap();
        assert_eq!(stored.decryption_count, 2);
        assert_eq!(stored.status, BeneficiaryStatus::Released);
        assert_eq!(store.list_events(Some("v1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn expired_or_wrong_credentials_are_rejected() {
        let now = Utc::now();
        let store = released_fixture(PlanTier::Pro, None, now).await;
        let access = ReleaseAccess::new(store);

        assert!(matches!(
            access.record_decryption_at("b1", "hr_guess", now).await,
            Err(HeirloomError::Validation(_))
        ));
        assert!(matches!(
            access
                .record_decryption_at("b1", "hr_known", now + Duration::days(91))
                .await,
            Err(HeirloomError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn untriggered_vault_cannot_be_decrypted() {
        let now = Utc::now();
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_vault(sample_vault("v1", PlanTier::Base, now))
            .await
            .unwrap();
        let mut beneficiary = sample_beneficiary("b1", "v1", true, now);
        beneficiary.release_token = Some("hr_known".to_string());
        beneficiary.release_token_expires_at = Some(now + Duration::days(1));
        store.insert_beneficiary(beneficiary).await.unwrap();

        let access = ReleaseAccess::new(store);
        let err = access
            .record_decryption_at("b1", "hr_known", now)
            .await
            .unwrap_err();
        assert!(matches!(err, HeirloomError::Conflict(_)));
    }

    #[tokio::test]
    async fn unlimited_tier_reports_no_remaining_count() {
        let now = Utc::now();
        let store = released_fixture(PlanTier::Pro, None, now).await;
        let access = ReleaseAccess::new(store);

        for _ in 0..20 {
            let receipt = access.record_decryption_at("b1", "hr_known", now).await.unwrap();
            assert_eq!(receipt.remaining, None);
        }
    }
}
