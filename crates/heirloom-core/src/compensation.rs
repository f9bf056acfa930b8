//! Administrator compensation operations with a write-once audit trail.
//!
//! Each logical operation writes exactly one [`CompensationLogEntry`] capturing the
//! before and after snapshots of every record it touched, even when it fans out to all
//! beneficiaries of a vault. Credentials are redacted from snapshots.

use crate::credentials::{self, CredentialKind};
use crate::error::HeirloomError;
use crate::release::ReleaseOrchestrator;
use crate::storage::{VaultPrecondition, VaultStore};
use crate::types::{
    AdjustmentMode, Beneficiary, CompensationAction, CompensationLogEntry, Vault, VaultStatus,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const REDACTED: &str = "[redacted]";

/// Attempts before an extension racing an engine write gives up.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Who is acting and why. Both are required on every administrator call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminContext {
    pub actor: String,
    pub reason: String,
}

impl AdminContext {
    pub fn new(actor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<(), HeirloomError> {
        if self.actor.trim().is_empty() {
            return Err(HeirloomError::Validation("actor is required".to_string()));
        }
        if self.reason.trim().is_empty() {
            return Err(HeirloomError::Validation("reason is required".to_string()));
        }
        Ok(())
    }
}

/// One beneficiary, or every beneficiary of a vault.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum DecryptionTarget {
    Beneficiary { beneficiary_id: String },
    Vault { vault_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReissueOutcome {
    pub entry: CompensationLogEntry,
    pub notification_sent: bool,
}

#[derive(Clone)]
pub struct CompensationLedger {
    store: Arc<dyn VaultStore>,
    orchestrator: ReleaseOrchestrator,
}

impl CompensationLedger {
    pub fn new(store: Arc<dyn VaultStore>, orchestrator: ReleaseOrchestrator) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    pub async fn extend_subscription(
        &self,
        vault_id: &str,
        days: u32,
        ctx: &AdminContext,
    ) -> Result<CompensationLogEntry, HeirloomError> {
        self.extend_subscription_at(vault_id, days, ctx, Utc::now())
            .await
    }

    /// Push the period end to `max(period_end, now) + days` and reactivate a lapsed vault.
    pub async fn extend_subscription_at(
        &self,
        vault_id: &str,
        days: u32,
        ctx: &AdminContext,
        now: DateTime<Utc>,
    ) -> Result<CompensationLogEntry, HeirloomError> {
        ctx.validate()?;
        if days == 0 {
            return Err(HeirloomError::Validation(
                "extension must be at least one day".to_string(),
            ));
        }

        let mut attempt = 0;
        let (before, updated) = loop {
            attempt += 1;
            let current = self.load_vault(vault_id).await?;
            let before = vault_snapshot(&current);
            let expected = VaultPrecondition::of(&current);

            let mut next = current;
            next.current_period_end =
                next.current_period_end.max(now) + Duration::days(i64::from(days));
            next.bonus_days = next.bonus_days.saturating_add(days);
            if next.status == VaultStatus::Inactive {
                next.status = VaultStatus::Active;
            }
            next.updated_at = now;

            match self.store.update_vault(next, expected).await {
                Ok(updated) => break (before, updated),
                Err(HeirloomError::Conflict(reason)) if attempt < MAX_CAS_ATTEMPTS => {
                    warn!(vault_id = %vault_id, attempt, reason = %reason, "Extension raced a concurrent update; retrying");
                }
                Err(err) => return Err(err),
            }
        };

        let entry = self
            .write_entry(
                ctx,
                CompensationAction::ExtendSubscription { days },
                vault_id,
                Vec::new(),
                before,
                vault_snapshot(&updated),
                now,
            )
            .await?;
        info!(
            vault_id = %vault_id,
            actor = %ctx.actor,
            days,
            current_period_end = %updated.current_period_end,
            "Subscription extended"
        );
        Ok(entry)
    }

    pub async fn reset_decryption_count(
        &self,
        target: &DecryptionTarget,
        ctx: &AdminContext,
    ) -> Result<CompensationLogEntry, HeirloomError> {
        self.reset_decryption_count_at(target, ctx, Utc::now())
            .await
    }

    pub async fn reset_decryption_count_at(
        &self,
        target: &DecryptionTarget,
        ctx: &AdminContext,
        now: DateTime<Utc>,
    ) -> Result<CompensationLogEntry, HeirloomError> {
        ctx.validate()?;
        self.apply_to_beneficiaries(
            target,
            ctx,
            CompensationAction::ResetDecryptionCount,
            now,
            |beneficiary| beneficiary.decryption_count = 0,
        )
        .await
    }

    pub async fn adjust_decryption_count(
        &self,
        target: &DecryptionTarget,
        delta: u32,
        mode: AdjustmentMode,
        ctx: &AdminContext,
    ) -> Result<CompensationLogEntry, HeirloomError> {
        self.adjust_decryption_count_at(target, delta, mode, ctx, Utc::now())
            .await
    }

    /// `Consume` gives back used attempts (floored at zero); `Bonus` grants extra ones.
    pub async fn adjust_decryption_count_at(
        &self,
        target: &DecryptionTarget,
        delta: u32,
        mode: AdjustmentMode,
        ctx: &AdminContext,
        now: DateTime<Utc>,
    ) -> Result<CompensationLogEntry, HeirloomError> {
        ctx.validate()?;
        if delta == 0 {
            return Err(HeirloomError::Validation(
                "delta must be positive".to_string(),
            ));
        }
        self.apply_to_beneficiaries(
            target,
            ctx,
            CompensationAction::AdjustDecryptionCount { delta, mode },
            now,
            |beneficiary| match mode {
                AdjustmentMode::Consume => {
                    beneficiary.decryption_count = beneficiary.decryption_count.saturating_sub(delta)
                }
                AdjustmentMode::Bonus => {
                    beneficiary.bonus_decryption_count =
                        beneficiary.bonus_decryption_count.saturating_add(delta)
                }
            },
        )
        .await
    }

    pub async fn reissue_release_token(
        &self,
        beneficiary_id: &str,
        ctx: &AdminContext,
    ) -> Result<ReissueOutcome, HeirloomError> {
        self.reissue_release_token_at(beneficiary_id, ctx, Utc::now())
            .await
    }

    /// Issue a fresh release credential for a released vault and re-send the notice.
    ///
    /// The notice is best-effort; the new credential and the audit entry stand either way.
    pub async fn reissue_release_token_at(
        &self,
        beneficiary_id: &str,
        ctx: &AdminContext,
        now: DateTime<Utc>,
    ) -> Result<ReissueOutcome, HeirloomError> {
        ctx.validate()?;
        let current = self
            .store
            .get_beneficiary(beneficiary_id)
            .await?
            .ok_or_else(|| HeirloomError::beneficiary_not_found(beneficiary_id))?;
        let vault = self.load_vault(&current.vault_id).await?;
        if !vault.status.is_terminal() {
            return Err(HeirloomError::Conflict(format!(
                "vault '{}' has not been released",
                vault.vault_id
            )));
        }

        let before = beneficiary_snapshot(&current);
        let credential = credentials::issue(
            CredentialKind::Release,
            now,
            self.orchestrator.settings().release_token_ttl,
        );
        let expected_revision = current.revision;
        let mut next = current;
        next.release_token = Some(credential.token);
        next.release_token_expires_at = Some(credential.expires_at);
        next.updated_at = now;
        let updated = self.store.update_beneficiary(next, expected_revision).await?;

        let entry = self
            .write_entry(
                ctx,
                CompensationAction::ReissueReleaseToken,
                &vault.vault_id,
                vec![updated.beneficiary_id.clone()],
                before,
                beneficiary_snapshot(&updated),
                now,
            )
            .await?;

        let notification_sent = match self
            .orchestrator
            .send_inheritance_notice(&vault, &updated, None)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(beneficiary_id = %beneficiary_id, error = %err, "Re-sent inheritance notice failed");
                false
            }
        };
        info!(
            vault_id = %vault.vault_id,
            beneficiary_id = %beneficiary_id,
            actor = %ctx.actor,
            notification_sent,
            "Release credential reissued"
        );
        Ok(ReissueOutcome {
            entry,
            notification_sent,
        })
    }

    pub async fn entries(
        &self,
        vault_id: Option<&str>,
    ) -> Result<Vec<CompensationLogEntry>, HeirloomError> {
        self.store.list_compensations(vault_id).await
    }

    /// Apply `mutate` to every targeted beneficiary and write one entry for the batch.
    ///
    /// A failure part-way still records the records that were changed before returning
    /// the error.
    async fn apply_to_beneficiaries<F>(
        &self,
        target: &DecryptionTarget,
        ctx: &AdminContext,
        action: CompensationAction,
        now: DateTime<Utc>,
        mutate: F,
    ) -> Result<CompensationLogEntry, HeirloomError>
    where
        F: Fn(&mut Beneficiary),
    {
        let (vault_id, targets) = self.resolve_target(target).await?;

        let mut ids = Vec::with_capacity(targets.len());
        let mut before = Vec::with_capacity(targets.len());
        let mut after = Vec::with_capacity(targets.len());
        let mut failure = None;

        for current in targets {
            let snapshot = beneficiary_snapshot(&current);
            let expected_revision = current.revision;
            let mut next = current;
            mutate(&mut next);
            next.updated_at = now;

            match self.store.update_beneficiary(next, expected_revision).await {
                Ok(updated) => {
                    ids.push(updated.beneficiary_id.clone());
                    before.push(snapshot);
                    after.push(beneficiary_snapshot(&updated));
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if ids.is_empty() {
            if let Some(err) = failure {
                return Err(err);
            }
        }

        let affected = ids.len();
        let entry = self
            .write_entry(
                ctx,
                action.clone(),
                &vault_id,
                ids,
                Value::Array(before),
                Value::Array(after),
                now,
            )
            .await?;

        if let Some(err) = failure {
            warn!(vault_id = %vault_id, action = action.name(), affected, error = %err, "Compensation applied partially");
            return Err(err);
        }
        info!(
            vault_id = %vault_id,
            actor = %ctx.actor,
            action = action.name(),
            affected,
            "Decryption counters adjusted"
        );
        Ok(entry)
    }

    async fn resolve_target(
        &self,
        target: &DecryptionTarget,
    ) -> Result<(String, Vec<Beneficiary>), HeirloomError> {
        match target {
            DecryptionTarget::Beneficiary { beneficiary_id } => {
                let beneficiary = self
                    .store
                    .get_beneficiary(beneficiary_id)
                    .await?
                    .ok_or_else(|| HeirloomError::beneficiary_not_found(beneficiary_id))?;
                Ok((beneficiary.vault_id.clone(), vec![beneficiary]))
            }
            DecryptionTarget::Vault { vault_id } => {
                self.load_vault(vault_id).await?;
                let beneficiaries = self.store.list_beneficiaries(vault_id).await?;
                Ok((vault_id.clone(), beneficiaries))
            }
        }
    }

    async fn load_vault(&self, vault_id: &str) -> Result<Vault, HeirloomError> {
        self.store
            .get_vault(vault_id)
            .await?
            .ok_or_else(|| HeirloomError::vault_not_found(vault_id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_entry(
        &self,
        ctx: &AdminContext,
        action: CompensationAction,
        vault_id: &str,
        beneficiary_ids: Vec<String>,
        before: Value,
        after: Value,
        now: DateTime<Utc>,
    ) -> Result<CompensationLogEntry, HeirloomError> {
        let entry = CompensationLogEntry {
            entry_id: Uuid::new_v4().to_string(),
            actor: ctx.actor.clone(),
            action,
            vault_id: vault_id.to_string(),
            beneficiary_ids,
            reason: ctx.reason.trim().to_string(),
            before,
            after,
            created_at: now,
            link: Default::default(),
        };
        self.store.append_compensation(entry).await
    }
}

fn vault_snapshot(vault: &Vault) -> Value {
    let mut value = serde_json::to_value(vault).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        if map.get("verification_token").is_some_and(|v| !v.is_null()) {
            map.insert("verification_token".to_string(), json!(REDACTED));
        }
        map.insert("payload".to_string(), json!({ "size_bytes": vault.stored_bytes() }));
    }
    value
}

fn beneficiary_snapshot(beneficiary: &Beneficiary) -> Value {
    let mut value = serde_json::to_value(beneficiary).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        if map.get("release_token").is_some_and(|v| !v.is_null()) {
            map.insert("release_token".to_string(), json!(REDACTED));
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::ReleaseSettings;
    use crate::storage::InMemoryStore;
    use crate::testing::{
        collaborators, sample_beneficiary, sample_vault, ContendedStore, FakeDirectory,
        FakeNotifier, FakeShipper,
    };
    use crate::types::{BeneficiaryStatus, PlanTier};

    fn ledger(store: Arc<dyn VaultStore>, notifier: Arc<FakeNotifier>) -> CompensationLedger {
        let orchestrator = ReleaseOrchestrator::new(
            store.clone(),
            collaborators(
                notifier,
                Arc::new(FakeShipper::default()),
                Arc::new(FakeDirectory::default()),
            ),
            ReleaseSettings {
                release_token_ttl: Duration::days(90),
                asset_description: "kit".to_string(),
                max_concurrency: 2,
            },
        );
        CompensationLedger::new(store, orchestrator)
    }

    fn ctx() -> AdminContext {
        AdminContext::new("support@heirloom", "billing outage")
    }

    #[tokio::test]
    async fn reason_is_required() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = ledger(store, Arc::new(FakeNotifier::default()));
        let err = ledger
            .extend_subscription("v1", 30, &AdminContext::new("admin", "   "))
            .await
            .unwrap_err();
        assert_eq!(err, HeirloomError::Validation("reason is required".to_string()));
    }

    #[tokio::test]
    async fn extension_starts_from_now_when_period_lapsed() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let mut vault = sample_vault("v1", PlanTier::Base, now);
        vault.current_period_end = now - Duration::days(10);
        vault.status = VaultStatus::Inactive;
        store.insert_vault(vault).await.unwrap();

        let ledger = ledger(store.clone(), Arc::new(FakeNotifier::default()));
        let entry = ledger
            .extend_subscription_at("v1", 30, &ctx(), now)
            .await
            .unwrap();

        let stored = store.get_vault("v1").await.unwrap().unwrap();
        assert_eq!(stored.status, VaultStatus::Active);
        assert_eq!(stored.current_period_end, now + Duration::days(30));
        assert_eq!(stored.bonus_days, 30);
        assert_eq!(entry.before["status"], json!("inactive"));
        assert_eq!(entry.after["status"], json!("active"));
        assert_eq!(entry.after["bonus_days"], json!(30));
    }

    #[tokio::test]
    async fn extension_retries_after_a_concurrent_engine_write() {
        let store = Arc::new(ContendedStore::new(1));
        let now = Utc::now();
        store
            .insert_vault(sample_vault("v1", PlanTier::Base, now))
            .await
            .unwrap();

        let ledger = ledger(store.clone(), Arc::new(FakeNotifier::default()));
        let entry = ledger
            .extend_subscription_at("v1", 14, &ctx(), now)
            .await
            .unwrap();

        let stored = store.get_vault("v1").await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.current_period_end, now + Duration::days(44));
        assert_eq!(entry.before["revision"], json!(1));
        assert_eq!(store.list_compensations(Some("v1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extension_gives_up_after_repeated_conflicts() {
        let store = Arc::new(ContendedStore::new(MAX_CAS_ATTEMPTS));
        let now = Utc::now();
        store
            .insert_vault(sample_vault("v1", PlanTier::Base, now))
            .await
            .unwrap();

        let ledger = ledger(store.clone(), Arc::new(FakeNotifier::default()));
        let err = ledger
            .extend_subscription_at("v1", 14, &ctx(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, HeirloomError::Conflict(_)));
        assert!(store.list_compensations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vault_wide_reset_writes_a_single_entry() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        store
            .insert_vault(sample_vault("v1", PlanTier::Base, now))
            .await
            .unwrap();
        for id in ["b1", "b2", "b3"] {
            let mut beneficiary = sample_beneficiary(id, "v1", true, now);
            beneficiary.decryption_count = 4;
            store.insert_beneficiary(beneficiary).await.unwrap();
        }

        let ledger = ledger(store.clone(), Arc::new(FakeNotifier::default()));
        let target = DecryptionTarget::Vault {
            vault_id: "v1".to_string(),
        };
        let entry = ledger
            .reset_decryption_count_at(&target, &ctx(), now)
            .await
            .unwrap();

        assert_eq!(entry.beneficiary_ids, vec!["b1", "b2", "b3"]);
        assert_eq!(entry.before.as_array().unwrap().len(), 3);
        assert_eq!(store.list_compensations(Some("v1")).await.unwrap().len(), 1);
        for id in ["b1", "b2", "b3"] {
            let stored = store.get_beneficiary(id).await.unwrap().unwrap();
            assert_eq!(stored.decryption_count, 0);
        }
    }

    #[tokio::test]
    async fn adjust_modes_touch_different_counters() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        store
            .insert_vault(sample_vault("v1", PlanTier::Base, now))
            .await
            .unwrap();
        let mut beneficiary = sample_beneficiary("b1", "v1", true, now);
        beneficiary.decryption_count = 2;
        store.insert_beneficiary(beneficiary).await.unwrap();

        let ledger = ledger(store.clone(), Arc::new(FakeNotifier::default()));
        let target = DecryptionTarget::Beneficiary {
            beneficiary_id: "b1".to_string(),
        };

        ledger
            .adjust_decryption_count_at(&target, 5, AdjustmentMode::Consume, &ctx(), now)
            .await
            .unwrap();
        ledger
            .adjust_decryption_count_at(&target, 4, AdjustmentMode::Bonus, &ctx(), now)
            .await
            .unwrap();

        let stored = store.get_beneficiary("b1").await.unwrap().unwrap();
        assert_eq!(stored.decryption_count, 0);
        assert_eq!(stored.bonus_decryption_count, 4);
        assert_eq!(store.list_compensations(None).await.unwrap().len(), 2);

        let err = ledger
            .adjust_decryption_count_at(&target, 0, AdjustmentMode::Bonus, &ctx(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, HeirloomError::Validation(_)));
    }

    #[tokio::test]
    async fn reissue_replaces_credential_and_redacts_it_in_the_audit() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let mut vault = sample_vault("v1", PlanTier::Base, now);
        vault.status = VaultStatus::Triggered;
        store.insert_vault(vault).await.unwrap();
        let mut beneficiary = sample_beneficiary("b1", "v1", true, now);
        beneficiary.status = BeneficiaryStatus::Notified;
        beneficiary.release_token = Some("hr_old".to_string());
        beneficiary.release_token_expires_at = Some(now - Duration::days(1));
        store.insert_beneficiary(beneficiary).await.unwrap();

        let notifier = Arc::new(FakeNotifier::default());
        let ledger = ledger(store.clone(), notifier.clone());
        let outcome = ledger
            .reissue_release_token_at("b1", &ctx(), now)
            .await
            .unwrap();

        assert!(outcome.notification_sent);
        assert_eq!(outcome.entry.after["release_token"], json!(REDACTED));
        let stored = store.get_beneficiary("b1").await.unwrap().unwrap();
        assert_ne!(stored.release_token.as_deref(), Some("hr_old"));
        assert_eq!(stored.release_token_expires_at, Some(now + Duration::days(90)));
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn reissue_requires_a_released_vault() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        store
            .insert_vault(sample_vault("v1", PlanTier::Base, now))
            .await
            .unwrap();
        store
            .insert_beneficiary(sample_beneficiary("b1", "v1", true, now))
            .await
            .unwrap();

        let ledger = ledger(store.clone(), Arc::new(FakeNotifier::default()));
        let err = ledger
            .reissue_release_token_at("b1", &ctx(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, HeirloomError::Conflict(_)));
        assert!(store.list_compensations(None).await.unwrap().is_empty());
    }
}
