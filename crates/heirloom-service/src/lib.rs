#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod scheduler;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use heirloom_adapters::{
    HttpAccountDirectory, HttpNotificationSender, HttpShipmentRequester,
    LoggingNotificationSender, MockShipmentRequester, StoreAccountDirectory,
};
use heirloom_core::{
    open_store, AccountDirectory, Collaborators, CompensationLedger, EngineConfig,
    HeartbeatRecorder, HeirloomError, NotificationSender, ReconciliationEngine, ReleaseAccess,
    ShipmentRequester, VaultRegistry, VaultStore,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use api::build_router;
pub use config::ServiceConfig;

#[derive(Clone)]
pub struct ServiceState {
    pub store: Arc<dyn VaultStore>,
    pub registry: VaultRegistry,
    pub heartbeats: HeartbeatRecorder,
    pub access: ReleaseAccess,
    pub engine: Arc<ReconciliationEngine>,
    pub ledger: CompensationLedger,
}

impl ServiceState {
    pub async fn bootstrap(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let store = open_store(&config.storage).await?;
        info!(backend = store.backend_label(), "Storage opened");

        let notifier: Arc<dyn NotificationSender> =
            match config.collaborators.notification_webhook_url.as_deref() {
                Some(url) => Arc::new(HttpNotificationSender::new(url)),
                None => Arc::new(LoggingNotificationSender),
            };
        let shipper: Arc<dyn ShipmentRequester> =
            match config.collaborators.shipment_api_url.as_deref() {
                Some(url) => Arc::new(HttpShipmentRequester::new(url)),
                None => Arc::new(MockShipmentRequester),
            };
        let directory: Arc<dyn AccountDirectory> =
            match config.collaborators.account_directory_url.as_deref() {
                Some(url) => Arc::new(HttpAccountDirectory::new(url)),
                None => Arc::new(StoreAccountDirectory::new(store.clone())),
            };
        info!(
            notifier = notifier.provider(),
            shipper = shipper.provider(),
            directory = if config.collaborators.account_directory_url.is_some() {
                "account-api"
            } else {
                "store"
            },
            "Collaborators configured"
        );

        let collaborators = Collaborators::new(
            notifier,
            shipper,
            directory,
            config.engine.collaborator_timeout(),
        );
        Ok(Self::assemble(store, collaborators, config.engine.clone()))
    }

    /// Assemble the entry points over an already opened store, resolving owners from
    /// the profiles recorded in it.
    pub fn with_collaborators(
        store: Arc<dyn VaultStore>,
        notifier: Arc<dyn NotificationSender>,
        shipper: Arc<dyn ShipmentRequester>,
        engine_config: EngineConfig,
    ) -> Self {
        let collaborators = Collaborators::new(
            notifier,
            shipper,
            Arc::new(StoreAccountDirectory::new(store.clone())),
            engine_config.collaborator_timeout(),
        );
        Self::assemble(store, collaborators, engine_config)
    }

    pub fn assemble(
        store: Arc<dyn VaultStore>,
        collaborators: Collaborators,
        engine_config: EngineConfig,
    ) -> Self {
        let engine = ReconciliationEngine::new(store.clone(), collaborators, engine_config);
        let ledger = CompensationLedger::new(store.clone(), engine.orchestrator().clone());

        Self {
            registry: VaultRegistry::new(store.clone()),
            heartbeats: HeartbeatRecorder::new(store.clone()),
            access: ReleaseAccess::new(store.clone()),
            engine: Arc::new(engine),
            ledger,
            store,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core error: {0}")]
    Core(#[from] HeirloomError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] HeirloomError),
}

impl ApiError {
    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Http { status, .. } => *status,
            ApiError::Core(err) => match err {
                HeirloomError::NotFound { .. } => StatusCode::NOT_FOUND,
                HeirloomError::EntitlementDenied { .. } => StatusCode::FORBIDDEN,
                HeirloomError::Validation(_) => StatusCode::BAD_REQUEST,
                HeirloomError::Conflict(_) => StatusCode::CONFLICT,
                HeirloomError::ExternalServiceFailure { .. }
                | HeirloomError::Timeout { .. }
                | HeirloomError::Storage(_)
                | HeirloomError::Serialization(_)
                | HeirloomError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Core(HeirloomError::EntitlementDenied { code, reason }) => {
                serde_json::json!({ "error": self.to_string(), "code": code, "reason": reason })
            }
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
