use super::{BeneficiaryView, VaultView};
use crate::{ApiError, ServiceState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use heirloom_core::{
    DeadManSwitchEvent, DecryptionReceipt, EncryptedPayload, EntitlementSummary, NewBeneficiary,
    NewVault, OwnerProfile,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub(super) struct CreateVaultRequest {
    #[serde(flatten)]
    vault: NewVault,
    /// Contact details used for warnings and reminders.
    #[serde(default)]
    owner: Option<OwnerProfile>,
}

pub(super) async fn create_vault(
    State(state): State<ServiceState>,
    Json(request): Json<CreateVaultRequest>,
) -> Result<(StatusCode, Json<VaultView>), ApiError> {
    let vault = state.registry.create_vault(request.vault).await?;
    if let Some(owner) = request.owner {
        state.store.upsert_owner(&vault.vault_id, owner).await?;
    }
    Ok((StatusCode::CREATED, Json(VaultView::from(&vault))))
}

pub(super) async fn add_beneficiary(
    Path(vault_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<NewBeneficiary>,
) -> Result<(StatusCode, Json<BeneficiaryView>), ApiError> {
    let beneficiary = state.registry.add_beneficiary(&vault_id, request).await?;
    Ok((StatusCode::CREATED, Json(BeneficiaryView::from(&beneficiary))))
}

pub(super) async fn store_payload(
    Path(vault_id): Path<String>,
    State(state): State<ServiceState>,
    Json(payload): Json<EncryptedPayload>,
) -> Result<Json<VaultView>, ApiError> {
    let vault = state.registry.store_payload(&vault_id, payload).await?;
    Ok(Json(VaultView::from(&vault)))
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct FrequencyRequest {
    days: u32,
}

pub(super) async fn set_heartbeat_frequency(
    Path(vault_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<FrequencyRequest>,
) -> Result<Json<VaultView>, ApiError> {
    let vault = state
        .registry
        .set_heartbeat_frequency(&vault_id, request.days)
        .await?;
    Ok(Json(VaultView::from(&vault)))
}

pub(super) async fn record_heartbeat(
    Path(vault_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<VaultView>, ApiError> {
    let vault = state.heartbeats.record_heartbeat(&vault_id).await?;
    Ok(Json(VaultView::from(&vault)))
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct VerifyRequest {
    #[serde(default)]
    token: String,
}

pub(super) async fn verify_owner(
    Path(vault_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VaultView>, ApiError> {
    let vault = state
        .heartbeats
        .verify_owner(&vault_id, &request.token)
        .await?;
    Ok(Json(VaultView::from(&vault)))
}

#[derive(Debug, Clone, Serialize)]
pub(super) struct EventsResponse {
    vault_id: String,
    total: usize,
    items: Vec<DeadManSwitchEvent>,
}

pub(super) async fn list_events(
    Path(vault_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<EventsResponse>, ApiError> {
    if state.store.get_vault(&vault_id).await?.is_none() {
        return Err(ApiError::not_found(format!("vault '{vault_id}' not found")));
    }
    let items = state.store.list_events(Some(vault_id.as_str())).await?;
    Ok(Json(EventsResponse {
        vault_id,
        total: items.len(),
        items,
    }))
}

pub(super) async fn entitlements(
    Path(vault_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<EntitlementSummary>, ApiError> {
    Ok(Json(state.registry.entitlements(&vault_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct DecryptionRequest {
    #[serde(default)]
    release_token: String,
}

pub(super) async fn record_decryption(
    Path(beneficiary_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<DecryptionRequest>,
) -> Result<Json<DecryptionReceipt>, ApiError> {
    Ok(Json(
        state
            .access
            .record_decryption(&beneficiary_id, &request.release_token)
            .await?,
    ))
}
