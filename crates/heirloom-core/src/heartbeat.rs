//! Owner check-ins. The only path from `pending_verification` back to `active`.

use crate::credentials;
use crate::error::HeirloomError;
use crate::storage::{VaultPrecondition, VaultStore};
use crate::types::{DeadManSwitchEvent, SwitchEventKind, Vault, VaultStatus};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Attempts before a heartbeat racing an engine write gives up.
const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct HeartbeatRecorder {
    store: Arc<dyn VaultStore>,
}

impl HeartbeatRecorder {
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self { store }
    }

    pub async fn record_heartbeat(&self, vault_id: &str) -> Result<Vault, HeirloomError> {
        self.record_heartbeat_at(vault_id, Utc::now()).await
    }

    /// Reset the vault to `active` and clear every warning guard.
    ///
    /// Fails with `Conflict` once the vault is triggered.
    pub async fn record_heartbeat_at(
        &self,
        vault_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vault, HeirloomError> {
        self.check_in(vault_id, now, None).await
    }

    pub async fn verify_owner(&self, vault_id: &str, token: &str) -> Result<Vault, HeirloomError> {
        self.verify_owner_at(vault_id, token, Utc::now()).await
    }

    /// Consume the single-use verification token sent with a warning, then check in.
    pub async fn verify_owner_at(
        &self,
        vault_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Vault, HeirloomError> {
        self.check_in(vault_id, now, Some(token)).await
    }

    async fn check_in(
        &self,
        vault_id: &str,
        now: DateTime<Utc>,
        token: Option<&str>,
    ) -> Result<Vault, HeirloomError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self
                .store
                .get_vault(vault_id)
                .await?
                .ok_or_else(|| HeirloomError::vault_not_found(vault_id))?;

            if current.status.is_terminal() {
                return Err(HeirloomError::Conflict(format!(
                    "vault '{vault_id}' has already been released"
                )));
            }
            if let Some(presented) = token {
                validate_verification_token(&current, presented, now)?;
            }

            let previous_status = current.status;
            let expected = VaultPrecondition::of(&current);
            let next = checked_in(current, now);

            match self.store.update_vault(next, expected).await {
                Ok(updated) => {
                    let kind = if token.is_some() {
                        SwitchEventKind::OwnerVerified
                    } else {
                        SwitchEventKind::HeartbeatRecorded
                    };
                    self.store
                        .append_event(DeadManSwitchEvent::new(
                            vault_id,
                            kind,
                            json!({ "previous_status": previous_status.name() }),
                            now,
                        ))
                        .await?;
                    info!(
                        vault_id = %vault_id,
                        previous_status = previous_status.name(),
                        event = kind.name(),
                        "Owner checked in"
                    );
                    return Ok(updated);
                }
                Err(HeirloomError::Conflict(reason)) if attempt < MAX_CAS_ATTEMPTS => {
                    warn!(vault_id = %vault_id, attempt, reason = %reason, "Heartbeat raced a concurrent update; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn validate_verification_token(
    vault: &Vault,
    presented: &str,
    now: DateTime<Utc>,
) -> Result<(), HeirloomError> {
    let stored = vault
        .verification_token
        .as_deref()
        .ok_or_else(|| HeirloomError::Validation("no verification is pending".to_string()))?;
    if !credentials::matches(stored, presented) {
        return Err(HeirloomError::Validation(
            "verification token does not match".to_string(),
        ));
    }
    match vault.verification_token_expires_at {
        Some(expires_at) if expires_at > now => Ok(()),
        _ => Err(HeirloomError::Validation(
            "verification token has expired".to_string(),
        )),
    }
}

fn checked_in(mut vault: Vault, now: DateTime<Utc>) -> Vault {
    vault.last_seen_at = now;
    vault.status = VaultStatus::Active;
    vault.verification_token = None;
    vault.verification_token_expires_at = None;
    vault.warning_email_count = 0;
    vault.warning_email_sent_at = None;
    vault.reminder_email_sent_at = None;
    vault.updated_at = now;
    vault
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::testing::sample_vault;
    use crate::types::PlanTier;
    use chrono::Duration;

    async fn pending_vault(store: &InMemoryStore, now: DateTime<Utc>) -> Vault {
        let mut vault = sample_vault("v1", PlanTier::Base, now - Duration::days(100));
        vault.status = VaultStatus::PendingVerification;
        vault.warning_email_count = 2;
        vault.warning_email_sent_at = Some(now - Duration::days(1));
        vault.reminder_email_sent_at = Some(now - Duration::hours(2));
        vault.verification_token = Some("hv_known".to_string());
        vault.verification_token_expires_at = Some(now + Duration::days(6));
        store.insert_vault(vault).await.unwrap()
    }

    #[tokio::test]
    async fn heartbeat_clears_warning_state() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        pending_vault(&store, now).await;
        let recorder = HeartbeatRecorder::new(store.clone());

        let vault = recorder.record_heartbeat_at("v1", now).await.unwrap();
        assert_eq!(vault.status, VaultStatus::Active);
        assert_eq!(vault.last_seen_at, now);
        assert_eq!(vault.warning_email_count, 0);
        assert!(vault.verification_token.is_none());
        assert!(vault.reminder_email_sent_at.is_none());

        let events = store.list_events(Some("v1")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SwitchEventKind::HeartbeatRecorded);
    }

    #[tokio::test]
    async fn heartbeat_for_missing_vault_is_not_found() {
        let recorder = HeartbeatRecorder::new(Arc::new(InMemoryStore::new()));
        let err = recorder.record_heartbeat("nope").await.unwrap_err();
        assert_eq!(err, HeirloomError::vault_not_found("nope"));
    }

    #[tokio::test]
    async fn triggered_vault_rejects_heartbeat() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let mut vault = sample_vault("v1", PlanTier::Base, now);
        vault.status = VaultStatus::Triggered;
        store.insert_vault(vault).await.unwrap();

        let recorder = HeartbeatRecorder::new(store.clone());
        let err = recorder.record_heartbeat_at("v1", now).await.unwrap_err();
        assert!(matches!(err, HeirloomError::Conflict(_)));
        assert_eq!(
            store.get_vault("v1").await.unwrap().unwrap().status,
            VaultStatus::Triggered
        );
    }

    #[tokio::test]
    async fn verification_token_is_single_use() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        pending_vault(&store, now).await;
        let recorder = HeartbeatRecorder::new(store.clone());

        let err = recorder.verify_owner_at("v1", "hv_wrong", now).await.unwrap_err();
        assert!(matches!(err, HeirloomError::Validation(_)));

        let vault = recorder.verify_owner_at("v1", "hv_known", now).await.unwrap();
        assert_eq!(vault.status, VaultStatus::Active);

        let err = recorder.verify_owner_at("v1", "hv_known", now).await.unwrap_err();
        assert!(matches!(err, HeirloomError::Validation(_)));

        let events = store.list_events(Some("v1")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SwitchEventKind::OwnerVerified);
    }

    #[tokio::test]
    async fn expired_verification_token_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        pending_vault(&store, now).await;
        let recorder = HeartbeatRecorder::new(store.clone());

        let later = now + Duration::days(7);
        let err = recorder
            .verify_owner_at("v1", "hv_known", later)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HeirloomError::Validation("verification token has expired".to_string())
        );
    }
}
