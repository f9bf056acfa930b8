use crate::ledger::{ChainLink, ChainRecord};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Subscription tier bounding what a vault may do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Base,
    Pro,
}

impl PlanTier {
    pub fn name(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Base => "base",
            Self::Pro => "pro",
        }
    }
}

/// Monitoring status of a vault.
///
/// `Triggered` is terminal: once assets are released no transition leaves it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VaultStatus {
    Active,
    PendingVerification,
    Triggered,
    Inactive,
}

impl VaultStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingVerification => "pending_verification",
            Self::Triggered => "triggered",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "pending_verification" => Some(Self::PendingVerification),
            "triggered" => Some(Self::Triggered),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Triggered)
    }
}

/// Opaque client-side encrypted blob. The core never interprets these fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub salt: String,
    pub iv: String,
    pub size_bytes: u64,
}

/// An owner's encrypted container plus its monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vault {
    pub vault_id: String,
    pub owner_id: String,
    pub payload: Option<EncryptedPayload>,
    pub status: VaultStatus,
    pub heartbeat_frequency_days: u32,
    pub grace_period_days: u32,
    pub last_seen_at: DateTime<Utc>,
    pub warning_email_sent_at: Option<DateTime<Utc>>,
    pub warning_email_count: u32,
    pub reminder_email_sent_at: Option<DateTime<Utc>>,
    pub verification_token: Option<String>,
    pub verification_token_expires_at: Option<DateTime<Utc>>,
    pub plan_level: PlanTier,
    pub current_period_end: DateTime<Utc>,
    pub bonus_days: u32,
    pub triggered_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful update; used for conditional writes.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Vault {
    /// Moment the owner becomes overdue for a check-in.
    pub fn heartbeat_due_at(&self) -> DateTime<Utc> {
        self.last_seen_at + Duration::days(i64::from(self.heartbeat_frequency_days))
    }

    /// Moment after which the vault is released: `lastSeenAt + frequency + grace`.
    pub fn release_deadline(&self) -> DateTime<Utc> {
        self.heartbeat_due_at() + Duration::days(i64::from(self.grace_period_days))
    }

    /// Tier used for entitlement checks. A lapsed subscription falls back to free limits.
    pub fn effective_tier(&self) -> PlanTier {
        match self.status {
            VaultStatus::Inactive => PlanTier::Free,
            _ => self.plan_level,
        }
    }

    pub fn stored_bytes(&self) -> u64 {
        self.payload.as_ref().map(|p| p.size_bytes).unwrap_or(0)
    }
}

/// Physical delivery address for a beneficiary.
///
/// All-or-nothing: complete only when every required field is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ShippingAddress {
    #[serde(default)]
    pub recipient_name: String,
    #[serde(default)]
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub phone: String,
}

impl ShippingAddress {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let required = [
            ("recipient_name", &self.recipient_name),
            ("line1", &self.line1),
            ("city", &self.city),
            ("region", &self.region),
            ("postal_code", &self.postal_code),
            ("country", &self.country),
            ("phone", &self.phone),
        ];
        required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

/// Beneficiary progress. Only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BeneficiaryStatus {
    Pending,
    Notified,
    Released,
}

impl BeneficiaryStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Notified => "notified",
            Self::Released => "released",
        }
    }

    /// Monotonic advance: never returns a status earlier than `self`.
    pub fn advance_to(self, next: Self) -> Self {
        self.max(next)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Beneficiary {
    pub beneficiary_id: String,
    pub vault_id: String,
    pub name: String,
    pub email: String,
    pub locale: Option<String>,
    pub shipping_address: Option<ShippingAddress>,
    pub status: BeneficiaryStatus,
    pub release_token: Option<String>,
    pub release_token_expires_at: Option<DateTime<Utc>>,
    pub decryption_count: u32,
    /// `None` means unlimited.
    pub decryption_limit: Option<u32>,
    pub bonus_decryption_count: u32,
    pub notified_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Beneficiary {
    pub fn has_complete_address(&self) -> bool {
        self.shipping_address
            .as_ref()
            .map(ShippingAddress::is_complete)
            .unwrap_or(false)
    }
}

/// Owner contact details served by the external account directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerProfile {
    pub email: String,
    pub name: String,
    pub locale: String,
}

/// Significant lifecycle transitions recorded in the event log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SwitchEventKind {
    WarningSent,
    WarningDeliveryFailed,
    ReminderSent,
    AssetsReleased,
    /// A later run finished a release that an earlier run left incomplete.
    ReleaseResumed,
    HeartbeatRecorded,
    OwnerVerified,
    DecryptionRecorded,
}

impl SwitchEventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::WarningSent => "warning_sent",
            Self::WarningDeliveryFailed => "warning_delivery_failed",
            Self::ReminderSent => "reminder_sent",
            Self::AssetsReleased => "assets_released",
            Self::ReleaseResumed => "release_resumed",
            Self::HeartbeatRecorded => "heartbeat_recorded",
            Self::OwnerVerified => "owner_verified",
            Self::DecryptionRecorded => "decryption_recorded",
        }
    }
}

/// Immutable lifecycle event. Sealed into the hash chain by the store on append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadManSwitchEvent {
    pub event_id: String,
    pub vault_id: String,
    pub kind: SwitchEventKind,
    pub detail: Value,
    pub occurred_at: DateTime<Utc>,
    pub link: ChainLink,
}

impl DeadManSwitchEvent {
    pub fn new(
        vault_id: impl Into<String>,
        kind: SwitchEventKind,
        detail: Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            vault_id: vault_id.into(),
            kind,
            detail,
            occurred_at,
            link: ChainLink::default(),
        }
    }
}

impl ChainRecord for DeadManSwitchEvent {
    fn link(&self) -> &ChainLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut ChainLink {
        &mut self.link
    }
}

/// How an administrator adjustment of decryption attempts is applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentMode {
    /// Lower `decryption_count`, floored at zero.
    Consume,
    /// Raise `bonus_decryption_count`.
    Bonus,
}

/// Administrator action recorded in the compensation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompensationAction {
    ExtendSubscription { days: u32 },
    ResetDecryptionCount,
    AdjustDecryptionCount { delta: u32, mode: AdjustmentMode },
    ReissueReleaseToken,
}

impl CompensationAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExtendSubscription { .. } => "extend_subscription",
            Self::ResetDecryptionCount => "reset_decryption_count",
            Self::AdjustDecryptionCount { .. } => "adjust_decryption_count",
            Self::ReissueReleaseToken => "reissue_release_token",
        }
    }
}

/// Write-once audit record for an administrator mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompensationLogEntry {
    pub entry_id: String,
    pub actor: String,
    pub action: CompensationAction,
    pub vault_id: String,
    pub beneficiary_ids: Vec<String>,
    pub reason: String,
    pub before: Value,
    pub after: Value,
    pub created_at: DateTime<Utc>,
    pub link: ChainLink,
}

impl ChainRecord for CompensationLogEntry {
    fn link(&self) -> &ChainLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut ChainLink {
        &mut self.link
    }
}
