//! Lifecycle reconciliation engine.
//!
//! One invocation of [`ReconciliationEngine::run_at`] is one scheduled run. The
//! candidate sets (warning, reminder, release, resumed release) are loaded up front from
//! the same snapshot and are disjoint, so a vault is acted on at most once per run.
//! A pending vault goes to the first set it qualifies for: release, then reminder,
//! then a repeat warning. Each transition is a conditional update on the vault's status
//! and revision; a lost race is counted as a skip.
//!
//! A release interrupted after the status flip (process exit, storage error while
//! listing beneficiaries) is finished by the resumed-release scan of a later run.

use crate::connectors::{Collaborators, NotificationKind, NotificationRequest};
use crate::credentials::{self, CredentialKind};
use crate::error::HeirloomError;
use crate::plan::has_automated_monitoring;
use crate::release::{BeneficiaryReleaseResult, ReleaseOrchestrator, ReleaseSettings};
use crate::storage::{VaultPrecondition, VaultStore};
use crate::types::{DeadManSwitchEvent, OwnerProfile, SwitchEventKind, Vault, VaultStatus};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_warning_emails: u32,
    pub warning_cooldown_hours: i64,
    pub verification_token_ttl_days: i64,
    pub reminder_window_hours: i64,
    pub release_token_ttl_days: i64,
    /// Upper bound on vaults (and beneficiaries per vault) processed at once.
    pub max_concurrency: usize,
    pub collaborator_timeout_ms: u64,
    /// Description passed to the shipment provider.
    pub asset_description: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_warning_emails: 3,
            warning_cooldown_hours: 24,
            verification_token_ttl_days: 7,
            reminder_window_hours: 24,
            release_token_ttl_days: 90,
            max_concurrency: 8,
            collaborator_timeout_ms: 10_000,
            asset_description: "Heirloom recovery kit".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn collaborator_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn release_settings(&self) -> ReleaseSettings {
        ReleaseSettings {
            release_token_ttl: Duration::days(self.release_token_ttl_days),
            asset_description: self.asset_description.clone(),
            max_concurrency: self.max_concurrency,
        }
    }

    fn warning_cooldown(&self) -> Duration {
        Duration::hours(self.warning_cooldown_hours)
    }

    fn reminder_window(&self) -> Duration {
        Duration::hours(self.reminder_window_hours)
    }
}

/// A recorded per-item failure. Never aborts the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunError {
    pub vault_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beneficiary_id: Option<String>,
    pub message: String,
}

impl RunError {
    fn vault(vault_id: &str, message: impl Into<String>) -> Self {
        Self {
            vault_id: vault_id.to_string(),
            beneficiary_id: None,
            message: message.into(),
        }
    }
}

/// Aggregate outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub warnings_sent: usize,
    pub reminders_sent: usize,
    pub triggers_executed: usize,
    /// Triggered vaults whose unfinished release this run completed.
    #[serde(default)]
    pub releases_resumed: usize,
    /// Candidates whose conditional update lost to a concurrent writer.
    pub skipped: usize,
    pub errors: Vec<RunError>,
}

impl RunReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            warnings_sent: 0,
            reminders_sent: 0,
            triggers_executed: 0,
            releases_resumed: 0,
            skipped: 0,
            errors: Vec::new(),
        }
    }

    pub fn actions(&self) -> usize {
        self.warnings_sent + self.reminders_sent + self.triggers_executed + self.releases_resumed
    }
}

#[derive(Debug, Default)]
struct StepOutcome {
    acted: bool,
    skipped: bool,
    errors: Vec<RunError>,
}

impl StepOutcome {
    fn acted() -> Self {
        Self {
            acted: true,
            ..Self::default()
        }
    }

    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn failed(error: RunError) -> Self {
        Self {
            errors: vec![error],
            ..Self::default()
        }
    }
}

/// Warning due: under the email cap and outside the cooldown window, and either
/// an active vault whose heartbeat is overdue or a pending vault that has not yet
/// had its final reminder.
pub fn warning_due(vault: &Vault, now: DateTime<Utc>, config: &EngineConfig) -> bool {
    let escalating = match vault.status {
        VaultStatus::Active => now >= vault.heartbeat_due_at(),
        VaultStatus::PendingVerification => {
            vault.reminder_email_sent_at.is_none() && now < vault.release_deadline()
        }
        _ => false,
    };
    escalating
        && vault.warning_email_count < config.max_warning_emails
        && vault
            .warning_email_sent_at
            .map_or(true, |sent| now - sent >= config.warning_cooldown())
}

/// Reminder due: inside the final window before the deadline and not yet sent this episode.
pub fn reminder_due(vault: &Vault, now: DateTime<Utc>, config: &EngineConfig) -> bool {
    let deadline = vault.release_deadline();
    vault.status == VaultStatus::PendingVerification
        && vault.reminder_email_sent_at.is_none()
        && deadline > now
        && deadline - now <= config.reminder_window()
}

pub fn release_due(vault: &Vault, now: DateTime<Utc>) -> bool {
    vault.status == VaultStatus::PendingVerification && now >= vault.release_deadline()
}

fn monitored(vault: &Vault) -> bool {
    has_automated_monitoring(vault.effective_tier())
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn VaultStore>,
    collaborators: Collaborators,
    orchestrator: ReleaseOrchestrator,
    config: EngineConfig,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn VaultStore>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        let orchestrator = ReleaseOrchestrator::new(
            store.clone(),
            collaborators.clone(),
            config.release_settings(),
        );
        Self {
            store,
            collaborators,
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &ReleaseOrchestrator {
        &self.orchestrator
    }

    pub async fn run(&self) -> Result<RunReport, HeirloomError> {
        self.run_at(Utc::now()).await
    }

    /// Execute one scheduled run as of `now`.
    ///
    /// Returns `Err` only when a scan set cannot be loaded.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunReport, HeirloomError> {
        let active = self.load_scan(VaultStatus::Active).await?;
        let pending = self.load_scan(VaultStatus::PendingVerification).await?;
        let triggered = self.load_scan(VaultStatus::Triggered).await?;

        let mut warning_candidates: Vec<Vault> = active
            .into_iter()
            .filter(monitored)
            .filter(|v| warning_due(v, now, &self.config))
            .collect();
        let mut reminder_candidates = Vec::new();
        let mut release_candidates = Vec::new();
        for vault in pending.into_iter().filter(monitored) {
            if release_due(&vault, now) {
                release_candidates.push(vault);
            } else if reminder_due(&vault, now, &self.config) {
                reminder_candidates.push(vault);
            } else if warning_due(&vault, now, &self.config) {
                warning_candidates.push(vault);
            }
        }
        debug!(
            warnings = warning_candidates.len(),
            reminders = reminder_candidates.len(),
            releases = release_candidates.len(),
            triggered = triggered.len(),
            "Scan sets loaded"
        );

        let concurrency = self.config.max_concurrency.max(1);
        let mut report = RunReport::new(now);

        let warnings = stream::iter(warning_candidates)
            .map(|vault| self.warn_owner(vault, now))
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
        report.warnings_sent = absorb(&mut report, warnings);

        let reminders = stream::iter(reminder_candidates)
            .map(|vault| self.remind_owner(vault, now))
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
        report.reminders_sent = absorb(&mut report, reminders);

        let releases = stream::iter(release_candidates)
            .map(|vault| self.trigger_release(vault, now))
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
        report.triggers_executed = absorb(&mut report, releases);

        let resumed = stream::iter(triggered)
            .map(|vault| self.resume_release(vault, now))
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
        report.releases_resumed = absorb(&mut report, resumed);

        report.errors.sort_by(|a, b| {
            a.vault_id
                .cmp(&b.vault_id)
                .then_with(|| a.beneficiary_id.cmp(&b.beneficiary_id))
        });
        info!(
            warnings_sent = report.warnings_sent,
            reminders_sent = report.reminders_sent,
            triggers_executed = report.triggers_executed,
            releases_resumed = report.releases_resumed,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Reconciliation run finished"
        );
        Ok(report)
    }

    async fn load_scan(&self, status: VaultStatus) -> Result<Vec<Vault>, HeirloomError> {
        self.store
            .list_vaults_by_status(status)
            .await
            .inspect_err(|err| {
                error!(status = status.name(), error = %err, "Scan query failed; aborting run");
            })
    }

    #[instrument(skip(self, vault), fields(vault_id = %vault.vault_id))]
    async fn warn_owner(&self, vault: Vault, now: DateTime<Utc>) -> StepOutcome {
        let vault_id = vault.vault_id.clone();
        let owner = match self.lookup_owner(&vault_id).await {
            Ok(owner) => owner,
            Err(outcome) => return outcome,
        };

        let first_warning = vault.status == VaultStatus::Active;
        let expected = VaultPrecondition::of(&vault);
        let mut next = vault;
        // A repeat warning carries the verification token already sent while it is valid.
        let reusable = next
            .verification_token
            .clone()
            .zip(next.verification_token_expires_at)
            .filter(|(_, expires_at)| *expires_at > now);
        let (token, expires_at) = match reusable {
            Some(existing) if !first_warning => existing,
            _ => {
                let credential = credentials::issue(
                    CredentialKind::Verification,
                    now,
                    Duration::days(self.config.verification_token_ttl_days),
                );
                (credential.token, credential.expires_at)
            }
        };
        next.status = VaultStatus::PendingVerification;
        next.verification_token = Some(token.clone());
        next.verification_token_expires_at = Some(expires_at);
        next.warning_email_count += 1;
        next.warning_email_sent_at = Some(now);
        next.updated_at = now;

        let updated = match self.store.update_vault(next, expected).await {
            Ok(updated) => updated,
            Err(err) => return self.transition_failed(&vault_id, err),
        };

        let mut template_data = owner_template(&owner, &updated);
        template_data.insert("verification_token".to_string(), token);
        template_data.insert(
            "verification_expires_at".to_string(),
            expires_at.to_rfc3339(),
        );
        template_data.insert(
            "warning_number".to_string(),
            updated.warning_email_count.to_string(),
        );
        let request = NotificationRequest {
            kind: NotificationKind::Warning,
            recipient: owner.email.clone(),
            template_data,
            locale: owner.locale.clone(),
        };

        match self.collaborators.notify(&request).await {
            Ok(receipt) => {
                info!(
                    warning_email_count = updated.warning_email_count,
                    message_id = %receipt.message_id,
                    "Warning sent"
                );
                let event = DeadManSwitchEvent::new(
                    &vault_id,
                    SwitchEventKind::WarningSent,
                    json!({
                        "warning_email_count": updated.warning_email_count,
                        "message_id": receipt.message_id,
                        "release_deadline": updated.release_deadline(),
                    }),
                    now,
                );
                let mut outcome = StepOutcome::acted();
                outcome.errors.extend(self.record_event(event).await);
                outcome
            }
            Err(err) => {
                warn!(error = %err, "Warning delivery failed");
                let event = DeadManSwitchEvent::new(
                    &vault_id,
                    SwitchEventKind::WarningDeliveryFailed,
                    json!({
                        "warning_email_count": updated.warning_email_count,
                        "error": err.to_string(),
                    }),
                    now,
                );
                let mut outcome =
                    StepOutcome::failed(RunError::vault(&vault_id, format!("warning: {err}")));
                outcome.errors.extend(self.record_event(event).await);
                outcome
            }
        }
    }

    #[instrument(skip(self, vault), fields(vault_id = %vault.vault_id))]
    async fn remind_owner(&self, vault: Vault, now: DateTime<Utc>) -> StepOutcome {
        let vault_id = vault.vault_id.clone();
        let owner = match self.lookup_owner(&vault_id).await {
            Ok(owner) => owner,
            Err(outcome) => return outcome,
        };

        // Marked before sending so a reminder goes out at most once per episode.
        let expected = VaultPrecondition::of(&vault);
        let mut next = vault;
        next.reminder_email_sent_at = Some(now);
        next.updated_at = now;
        let updated = match self.store.update_vault(next, expected).await {
            Ok(updated) => updated,
            Err(err) => return self.transition_failed(&vault_id, err),
        };

        let request = NotificationRequest {
            kind: NotificationKind::Reminder,
            recipient: owner.email.clone(),
            template_data: owner_template(&owner, &updated),
            locale: owner.locale.clone(),
        };
        match self.collaborators.notify(&request).await {
            Ok(receipt) => {
                info!(message_id = %receipt.message_id, "Reminder sent");
                let event = DeadManSwitchEvent::new(
                    &vault_id,
                    SwitchEventKind::ReminderSent,
                    json!({
                        "message_id": receipt.message_id,
                        "release_deadline": updated.release_deadline(),
                    }),
                    now,
                );
                let mut outcome = StepOutcome::acted();
                outcome.errors.extend(self.record_event(event).await);
                outcome
            }
            Err(err) => {
                warn!(error = %err, "Reminder delivery failed");
                StepOutcome::failed(RunError::vault(&vault_id, format!("reminder: {err}")))
            }
        }
    }

    #[instrument(skip(self, vault), fields(vault_id = %vault.vault_id))]
    async fn trigger_release(&self, vault: Vault, now: DateTime<Utc>) -> StepOutcome {
        let vault_id = vault.vault_id.clone();
        let expected = VaultPrecondition::of(&vault);
        let mut next = vault;
        next.status = VaultStatus::Triggered;
        next.triggered_at = Some(now);
        next.verification_token = None;
        next.verification_token_expires_at = None;
        next.updated_at = now;

        // The status flip is the mutual exclusion: only the winner orchestrates.
        let triggered = match self.store.update_vault(next, expected).await {
            Ok(updated) => updated,
            Err(err) => return self.transition_failed(&vault_id, err),
        };
        info!("Vault triggered; releasing to beneficiaries");

        let mut outcome = StepOutcome::acted();
        let summary = match self.orchestrator.release_vault(&triggered, now).await {
            Ok(results) => release_summary(&vault_id, &results, &mut outcome),
            Err(err) => {
                warn!(error = %err, "Could not load beneficiaries; a later run resumes the release");
                outcome
                    .errors
                    .push(RunError::vault(&vault_id, format!("release: {err}")));
                json!([])
            }
        };

        let event = DeadManSwitchEvent::new(
            &vault_id,
            SwitchEventKind::AssetsReleased,
            json!({ "beneficiaries": summary }),
            now,
        );
        outcome.errors.extend(self.record_event(event).await);
        outcome
    }

    /// Finish releasing a triggered vault whose beneficiaries are not all credentialed.
    #[instrument(skip(self, vault), fields(vault_id = %vault.vault_id))]
    async fn resume_release(&self, vault: Vault, now: DateTime<Utc>) -> StepOutcome {
        let vault_id = vault.vault_id.clone();
        let results = match self.orchestrator.resume_release(&vault, now).await {
            Ok(results) if results.is_empty() => return StepOutcome::default(),
            Ok(results) => results,
            Err(err) => {
                warn!(error = %err, "Could not load beneficiaries to resume the release");
                return StepOutcome::failed(RunError::vault(&vault_id, format!("resume: {err}")));
            }
        };

        let mut outcome = StepOutcome::acted();
        let summary = release_summary(&vault_id, &results, &mut outcome);
        let event = DeadManSwitchEvent::new(
            &vault_id,
            SwitchEventKind::ReleaseResumed,
            json!({ "beneficiaries": summary }),
            now,
        );
        outcome.errors.extend(self.record_event(event).await);
        outcome
    }

    async fn lookup_owner(&self, vault_id: &str) -> Result<OwnerProfile, StepOutcome> {
        self.collaborators.owner(vault_id).await.map_err(|err| {
            warn!(vault_id = %vault_id, error = %err, "Owner lookup failed; vault left unchanged");
            StepOutcome::failed(RunError::vault(vault_id, format!("owner lookup: {err}")))
        })
    }

    fn transition_failed(&self, vault_id: &str, err: HeirloomError) -> StepOutcome {
        match err {
            HeirloomError::Conflict(reason) => {
                debug!(vault_id = %vault_id, reason = %reason, "Transition lost to a concurrent writer");
                StepOutcome::skipped()
            }
            other => {
                warn!(vault_id = %vault_id, error = %other, "Transition failed");
                StepOutcome::failed(RunError::vault(vault_id, other.to_string()))
            }
        }
    }

    async fn record_event(&self, event: DeadManSwitchEvent) -> Option<RunError> {
        let vault_id = event.vault_id.clone();
        let kind = event.kind;
        match self.store.append_event(event).await {
            Ok(_) => None,
            Err(err) => {
                warn!(vault_id = %vault_id, event = kind.name(), error = %err, "Event append failed");
                Some(RunError::vault(
                    &vault_id,
                    format!("event {}: {err}", kind.name()),
                ))
            }
        }
    }
}

/// Fold step outcomes into the report; returns how many acted.
fn absorb(report: &mut RunReport, outcomes: Vec<StepOutcome>) -> usize {
    let mut acted = 0;
    for outcome in outcomes {
        if outcome.acted {
            acted += 1;
        }
        if outcome.skipped {
            report.skipped += 1;
        }
        report.errors.extend(outcome.errors);
    }
    acted
}

/// Copy per-beneficiary failures into `outcome` and render the event summary.
fn release_summary(
    vault_id: &str,
    results: &[BeneficiaryReleaseResult],
    outcome: &mut StepOutcome,
) -> serde_json::Value {
    for result in results {
        outcome
            .errors
            .extend(result.errors.iter().map(|message| RunError {
                vault_id: vault_id.to_string(),
                beneficiary_id: Some(result.beneficiary_id.clone()),
                message: message.clone(),
            }));
    }
    serde_json::to_value(results).unwrap_or_else(|_| json!([]))
}

fn owner_template(owner: &OwnerProfile, vault: &Vault) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    data.insert("owner_name".to_string(), owner.name.clone());
    data.insert("vault_id".to_string(), vault.vault_id.clone());
    data.insert(
        "release_deadline".to_string(),
        vault.release_deadline().to_rfc3339(),
    );
    data
}
