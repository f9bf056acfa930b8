//! Administrator corrections. Every call names an actor and a reason.

use crate::{ApiError, ServiceState};
use axum::extract::{Path, Query, State};
use axum::Json;
use heirloom_core::{
    AdjustmentMode, AdminContext, CompensationLogEntry, DecryptionTarget, ReissueOutcome,
};
use serde::{Deserialize, Serialize};

/// Missing fields deserialize as empty so the ledger reports them as validation errors.
#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct AdminFields {
    #[serde(default)]
    actor: String,
    #[serde(default)]
    reason: String,
}

impl AdminFields {
    fn context(&self) -> AdminContext {
        AdminContext::new(self.actor.clone(), self.reason.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct ExtendRequest {
    days: u32,
    #[serde(flatten)]
    admin: AdminFields,
}

pub(super) async fn extend_subscription(
    Path(vault_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ExtendRequest>,
) -> Result<Json<CompensationLogEntry>, ApiError> {
    Ok(Json(
        state
            .ledger
            .extend_subscription(&vault_id, request.days, &request.admin.context())
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct ResetRequest {
    target: DecryptionTarget,
    #[serde(flatten)]
    admin: AdminFields,
}

pub(super) async fn reset_decryptions(
    State(state): State<ServiceState>,
    Json(request): Json<ResetRequest>,
) -> Result<Json<CompensationLogEntry>, ApiError> {
    Ok(Json(
        state
            .ledger
            .reset_decryption_count(&request.target, &request.admin.context())
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct AdjustRequest {
    target: DecryptionTarget,
    delta: u32,
    mode: AdjustmentMode,
    #[serde(flatten)]
    admin: AdminFields,
}

pub(super) async fn adjust_decryptions(
    State(state): State<ServiceState>,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<CompensationLogEntry>, ApiError> {
    Ok(Json(
        state
            .ledger
            .adjust_decryption_count(
                &request.target,
                request.delta,
                request.mode,
                &request.admin.context(),
            )
            .await?,
    ))
}

pub(super) async fn reissue_release_token(
    Path(beneficiary_id): Path<String>,
    State(state): State<ServiceState>,
    Json(admin): Json<AdminFields>,
) -> Result<Json<ReissueOutcome>, ApiError> {
    Ok(Json(
        state
            .ledger
            .reissue_release_token(&beneficiary_id, &admin.context())
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct CompensationsQuery {
    vault_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(super) struct CompensationsResponse {
    total: usize,
    items: Vec<CompensationLogEntry>,
}

pub(super) async fn list_compensations(
    State(state): State<ServiceState>,
    Query(query): Query<CompensationsQuery>,
) -> Result<Json<CompensationsResponse>, ApiError> {
    let items = state.ledger.entries(query.vault_id.as_deref()).await?;
    Ok(Json(CompensationsResponse {
        total: items.len(),
        items,
    }))
}

#[derive(Debug, Clone, Serialize)]
pub(super) struct ChainsResponse {
    valid: bool,
}

pub(super) async fn verify_chains(
    State(state): State<ServiceState>,
) -> Result<Json<ChainsResponse>, ApiError> {
    Ok(Json(ChainsResponse {
        valid: state.store.verify_chains().await?,
    }))
}
