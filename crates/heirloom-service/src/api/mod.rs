//! REST surface over the core entry points.

mod admin;
mod vaults;

use crate::{scheduler, ApiError, ServiceState};
use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use heirloom_core::{Beneficiary, BeneficiaryStatus, PlanTier, RunReport, Vault, VaultStatus};
use serde::Serialize;

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/runs", post(trigger_run))
        .route("/v1/vaults", post(vaults::create_vault))
        .route("/v1/vaults/:vault_id/beneficiaries", post(vaults::add_beneficiary))
        .route("/v1/vaults/:vault_id/payload", put(vaults::store_payload))
        .route(
            "/v1/vaults/:vault_id/heartbeat-frequency",
            put(vaults::set_heartbeat_frequency),
        )
        .route("/v1/vaults/:vault_id/heartbeat", post(vaults::record_heartbeat))
        .route("/v1/vaults/:vault_id/verify", post(vaults::verify_owner))
        .route("/v1/vaults/:vault_id/events", get(vaults::list_events))
        .route("/v1/vaults/:vault_id/entitlements", get(vaults::entitlements))
        .route(
            "/v1/beneficiaries/:beneficiary_id/decryptions",
            post(vaults::record_decryption),
        )
        .route("/v1/admin/vaults/:vault_id/extend", post(admin::extend_subscription))
        .route("/v1/admin/decryptions/reset", post(admin::reset_decryptions))
        .route("/v1/admin/decryptions/adjust", post(admin::adjust_decryptions))
        .route(
            "/v1/admin/beneficiaries/:beneficiary_id/reissue-token",
            post(admin::reissue_release_token),
        )
        .route("/v1/admin/compensations", get(admin::list_compensations))
        .route("/v1/admin/chains/verify", get(admin::verify_chains))
        .with_state(state)
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "heirloom-service",
        storage_backend: state.store.backend_label(),
    })
}

async fn trigger_run(State(state): State<ServiceState>) -> Result<Json<RunReport>, ApiError> {
    Ok(Json(scheduler::run_scheduled(&state.engine).await?))
}

/// Vault as returned to callers. Credentials and ciphertext stay server-side.
#[derive(Debug, Clone, Serialize)]
pub struct VaultView {
    pub vault_id: String,
    pub owner_id: String,
    pub status: VaultStatus,
    pub plan_level: PlanTier,
    pub effective_tier: PlanTier,
    pub heartbeat_frequency_days: u32,
    pub grace_period_days: u32,
    pub last_seen_at: DateTime<Utc>,
    pub heartbeat_due_at: DateTime<Utc>,
    pub warning_email_count: u32,
    pub warning_email_sent_at: Option<DateTime<Utc>>,
    pub reminder_email_sent_at: Option<DateTime<Utc>>,
    pub current_period_end: DateTime<Utc>,
    pub bonus_days: u32,
    pub triggered_at: Option<DateTime<Utc>>,
    pub stored_bytes: u64,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&Vault> for VaultView {
    fn from(vault: &Vault) -> Self {
        Self {
            vault_id: vault.vault_id.clone(),
            owner_id: vault.owner_id.clone(),
            status: vault.status,
            plan_level: vault.plan_level,
            effective_tier: vault.effective_tier(),
            heartbeat_frequency_days: vault.heartbeat_frequency_days,
            grace_period_days: vault.grace_period_days,
            last_seen_at: vault.last_seen_at,
            heartbeat_due_at: vault.heartbeat_due_at(),
            warning_email_count: vault.warning_email_count,
            warning_email_sent_at: vault.warning_email_sent_at,
            reminder_email_sent_at: vault.reminder_email_sent_at,
            current_period_end: vault.current_period_end,
            bonus_days: vault.bonus_days,
            triggered_at: vault.triggered_at,
            stored_bytes: vault.stored_bytes(),
            revision: vault.revision,
            updated_at: vault.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BeneficiaryView {
    pub beneficiary_id: String,
    pub vault_id: String,
    pub name: String,
    pub email: String,
    pub status: BeneficiaryStatus,
    pub has_complete_address: bool,
    pub decryption_count: u32,
    pub decryption_limit: Option<u32>,
    pub bonus_decryption_count: u32,
    pub notified_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub revision: u64,
}

impl From<&Beneficiary> for BeneficiaryView {
    fn from(beneficiary: &Beneficiary) -> Self {
        Self {
            beneficiary_id: beneficiary.beneficiary_id.clone(),
            vault_id: beneficiary.vault_id.clone(),
            name: beneficiary.name.clone(),
            email: beneficiary.email.clone(),
            status: beneficiary.status,
            has_complete_address: beneficiary.has_complete_address(),
            decryption_count: beneficiary.decryption_count,
            decryption_limit: beneficiary.decryption_limit,
            bonus_decryption_count: beneficiary.bonus_decryption_count,
            notified_at: beneficiary.notified_at,
            released_at: beneficiary.released_at,
            revision: beneficiary.revision,
        }
    }
}
