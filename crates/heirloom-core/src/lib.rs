//! Heirloom core: a dead man's switch for digital-asset inheritance.
//!
//! Owners keep an encrypted vault alive with periodic heartbeats. When they go quiet, the
//! reconciliation engine escalates from warnings to a reminder and finally releases the
//! vault to its beneficiaries. Plan tiers bound what each vault may do, and every
//! administrator correction is recorded in a hash-chained audit log.

#![deny(unsafe_code)]

pub mod access;
pub mod compensation;
pub mod connectors;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod guard;
pub mod heartbeat;
pub mod ledger;
pub mod plan;
pub mod registry;
pub mod release;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

pub use access::{DecryptionReceipt, ReleaseAccess};
pub use compensation::{AdminContext, CompensationLedger, DecryptionTarget, ReissueOutcome};
pub use connectors::{
    AccountDirectory, Collaborators, NotificationKind, NotificationReceipt, NotificationRequest,
    NotificationSender, ShipmentReceipt, ShipmentRequester,
};
pub use engine::{EngineConfig, ReconciliationEngine, RunError, RunReport};
pub use error::HeirloomError;
pub use guard::{EntitlementDecision, EntitlementGuard};
pub use heartbeat::HeartbeatRecorder;
pub use ledger::{AppendOnlyLog, ChainLink, ChainRecord};
pub use plan::{limits_for, HeartbeatRange, PlanLimits};
pub use registry::{EntitlementSummary, NewBeneficiary, NewVault, VaultRegistry};
pub use release::{BeneficiaryReleaseResult, ReleaseOrchestrator, ReleaseSettings, ShipmentOutcome};
pub use storage::{open_store, InMemoryStore, PostgresStore, StorageConfig, VaultStore};
pub use types::{
    AdjustmentMode, Beneficiary, BeneficiaryStatus, CompensationAction, CompensationLogEntry,
    DeadManSwitchEvent, EncryptedPayload, OwnerProfile, PlanTier, ShippingAddress,
    SwitchEventKind, Vault, VaultStatus,
};
