//! Collaborator adapters for Heirloom.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use heirloom_core::connectors::{
    AccountDirectory, NotificationReceipt, NotificationRequest, NotificationSender,
    ShipmentReceipt, ShipmentRequester,
};
use heirloom_core::error::HeirloomError;
use heirloom_core::storage::VaultStore;
use heirloom_core::types::{OwnerProfile, ShippingAddress};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Owner directory backed by the profiles recorded with each vault.
///
/// Every process opened over the same store (a `serve` instance, a cron `run-once`)
/// sees the same owners.
#[derive(Clone)]
pub struct StoreAccountDirectory {
    store: Arc<dyn VaultStore>,
}

impl StoreAccountDirectory {
    pub fn new(store: Arc<dyn VaultStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AccountDirectory for StoreAccountDirectory {
    async fn get_owner(&self, vault_id: &str) -> Result<OwnerProfile, HeirloomError> {
        self.store
            .get_owner(vault_id)
            .await?
            .ok_or_else(|| HeirloomError::owner_not_found(vault_id))
    }
}

/// Resolves owners from an account service at `GET {base_url}/{vault_id}`.
#[derive(Debug, Clone)]
pub struct HttpAccountDirectory {
    client: Client,
    base_url: String,
}

impl HttpAccountDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AccountDirectory for HttpAccountDirectory {
    async fn get_owner(&self, vault_id: &str) -> Result<OwnerProfile, HeirloomError> {
        let response = self
            .client
            .get(format!("{}/{vault_id}", self.base_url))
            .send()
            .await
            .map_err(|e| HeirloomError::external("account-api", format!("request failed: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(HeirloomError::owner_not_found(vault_id));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HeirloomError::external(
                "account-api",
                format!("status {status}: {}", truncate(&body, 240)),
            ));
        }

        let owner = response.json::<OwnerProfile>().await.map_err(|e| {
            HeirloomError::external("account-api", format!("invalid response: {e}"))
        })?;
        debug!(vault_id = %vault_id, "Owner resolved from account service");
        Ok(owner)
    }
}

/// Keeps every accepted request; useful for local runs and tests.
#[derive(Debug, Default)]
pub struct RecordingNotificationSender {
    sent: Mutex<Vec<NotificationRequest>>,
}

impl RecordingNotificationSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotificationSender {
    fn provider(&self) -> &'static str {
        "recording"
    }

    async fn send(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationReceipt, HeirloomError> {
        let mut sent = self.sent.lock().await;
        sent.push(request.clone());
        Ok(NotificationReceipt {
            message_id: format!("rec-{}", sent.len()),
            accepted_at: Utc::now(),
        })
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotificationSender;

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    fn provider(&self) -> &'static str {
        "log"
    }

    async fn send(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationReceipt, HeirloomError> {
        let digest = blake3::hash(serde_json::to_string(request)?.as_bytes()).to_hex();
        let message_id = format!("log-{}", &digest[..12]);
        info!(
            kind = request.kind.name(),
            recipient = %request.recipient,
            locale = %request.locale,
            message_id = %message_id,
            "Notification (not delivered)"
        );
        Ok(NotificationReceipt {
            message_id,
            accepted_at: Utc::now(),
        })
    }
}

/// Deterministic failing sender useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailNotificationSender {
    provider_name: &'static str,
    reason: String,
}

impl AlwaysFailNotificationSender {
    pub fn new(provider_name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            provider_name,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl NotificationSender for AlwaysFailNotificationSender {
    fn provider(&self) -> &'static str {
        self.provider_name
    }

    async fn send(
        &self,
        _request: &NotificationRequest,
    ) -> Result<NotificationReceipt, HeirloomError> {
        Err(HeirloomError::external(self.provider_name, self.reason.clone()))
    }
}

/// Mock carrier issuing deterministic tracking numbers derived from the address.
#[derive(Debug, Clone, Default)]
pub struct MockShipmentRequester;

#[async_trait]
impl ShipmentRequester for MockShipmentRequester {
    fn provider(&self) -> &'static str {
        "mock-carrier"
    }

    async fn create_shipment(
        &self,
        address: &ShippingAddress,
        asset_description: &str,
    ) -> Result<ShipmentReceipt, HeirloomError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(serde_json::to_string(address)?.as_bytes());
        hasher.update(asset_description.as_bytes());
        let digest = hasher.finalize().to_hex();

        Ok(ShipmentReceipt {
            tracking_number: format!("HL{}", digest[..12].to_ascii_uppercase()),
            carrier_status: "label_created".to_string(),
        })
    }
}

/// Deterministic failing carrier.
#[derive(Debug, Clone)]
pub struct AlwaysFailShipmentRequester {
    provider_name: &'static str,
    reason: String,
}

impl AlwaysFailShipmentRequester {
    pub fn new(provider_name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            provider_name,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ShipmentRequester for AlwaysFailShipmentRequester {
    fn provider(&self) -> &'static str {
        self.provider_name
    }

    async fn create_shipment(
        &self,
        _address: &ShippingAddress,
        _asset_description: &str,
    ) -> Result<ShipmentReceipt, HeirloomError> {
        Err(HeirloomError::external(self.provider_name, self.reason.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct WebhookAccepted {
    #[serde(default)]
    message_id: Option<String>,
}

/// Posts each notification as JSON to a webhook (mail relay, queue bridge, ...).
#[derive(Debug, Clone)]
pub struct HttpNotificationSender {
    client: Client,
    url: String,
}

impl HttpNotificationSender {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), url)
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSender for HttpNotificationSender {
    fn provider(&self) -> &'static str {
        "webhook"
    }

    async fn send(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationReceipt, HeirloomError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| HeirloomError::external(self.provider(), format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HeirloomError::external(
                self.provider(),
                format!("status {status}: {}", truncate(&body, 240)),
            ));
        }

        let accepted: WebhookAccepted = response
            .json()
            .await
            .unwrap_or(WebhookAccepted { message_id: None });
        let message_id = accepted
            .message_id
            .unwrap_or_else(|| format!("webhook-{}", Utc::now().timestamp_millis()));
        debug!(kind = request.kind.name(), message_id = %message_id, "Webhook accepted notification");
        Ok(NotificationReceipt {
            message_id,
            accepted_at: Utc::now(),
        })
    }
}

/// Requests shipments from a carrier HTTP API.
#[derive(Debug, Clone)]
pub struct HttpShipmentRequester {
    client: Client,
    url: String,
}

impl HttpShipmentRequester {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), url)
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ShipmentRequester for HttpShipmentRequester {
    fn provider(&self) -> &'static str {
        "carrier-api"
    }

    async fn create_shipment(
        &self,
        address: &ShippingAddress,
        asset_description: &str,
    ) -> Result<ShipmentReceipt, HeirloomError> {
        let payload = json!({
            "address": address,
            "asset_description": asset_description,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| HeirloomError::external(self.provider(), format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HeirloomError::external(
                self.provider(),
                format!("status {status}: {}", truncate(&body, 240)),
            ));
        }

        response.json::<ShipmentReceipt>().await.map_err(|e| {
            HeirloomError::external(self.provider(), format!("invalid response: {e}"))
        })
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut cut: String = value.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
