use crate::error::HeirloomError;
use crate::types::{OwnerProfile, ShippingAddress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Notification kinds the core requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Warning,
    Reminder,
    InheritanceNotice,
}

impl NotificationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Reminder => "reminder",
            Self::InheritanceNotice => "inheritance_notice",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub recipient: String,
    pub template_data: BTreeMap<String, String>,
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationReceipt {
    pub message_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShipmentReceipt {
    pub tracking_number: String,
    pub carrier_status: String,
}

/// Delivers warning, reminder, and inheritance-notice messages.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn send(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationReceipt, HeirloomError>;
}

/// Requests a physical shipment of recovery material to a beneficiary.
#[async_trait]
pub trait ShipmentRequester: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn create_shipment(
        &self,
        address: &ShippingAddress,
        asset_description: &str,
    ) -> Result<ShipmentReceipt, HeirloomError>;
}

/// Read-only owner lookup used to personalise warnings and reminders.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn get_owner(&self, vault_id: &str) -> Result<OwnerProfile, HeirloomError>;
}

/// External collaborators the engine and orchestrator call out to.
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn NotificationSender>,
    pub shipper: Arc<dyn ShipmentRequester>,
    pub directory: Arc<dyn AccountDirectory>,
    pub timeout: Duration,
}

impl Collaborators {
    pub fn new(
        notifier: Arc<dyn NotificationSender>,
        shipper: Arc<dyn ShipmentRequester>,
        directory: Arc<dyn AccountDirectory>,
        timeout: Duration,
    ) -> Self {
        Self {
            notifier,
            shipper,
            directory,
            timeout,
        }
    }

    pub async fn notify(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationReceipt, HeirloomError> {
        bounded(
            self.notifier.provider(),
            self.timeout,
            self.notifier.send(request),
        )
        .await
    }

    pub async fn ship(
        &self,
        address: &ShippingAddress,
        asset_description: &str,
    ) -> Result<ShipmentReceipt, HeirloomError> {
        bounded(
            self.shipper.provider(),
            self.timeout,
            self.shipper.create_shipment(address, asset_description),
        )
        .await
    }

    pub async fn owner(&self, vault_id: &str) -> Result<OwnerProfile, HeirloomError> {
        bounded(
            "account_directory",
            self.timeout,
            self.directory.get_owner(vault_id),
        )
        .await
    }
}

/// Run a collaborator call under the configured timeout; expiry becomes `Timeout`.
async fn bounded<T, F>(service: &str, timeout: Duration, call: F) -> Result<T, HeirloomError>
where
    F: Future<Output = Result<T, HeirloomError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(HeirloomError::Timeout {
            service: service.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
