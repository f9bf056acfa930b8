//! Plan policy: pure mapping from a tier to its limits.

use crate::types::PlanTier;
use serde::Serialize;

const MIB: u64 = 1024 * 1024;

/// Inclusive bounds on the owner-configured heartbeat frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeartbeatRange {
    pub min_days: u32,
    pub max_days: u32,
}

impl HeartbeatRange {
    pub fn contains(&self, days: u32) -> bool {
        (self.min_days..=self.max_days).contains(&days)
    }
}

/// Limits granted by a plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub tier: PlanTier,
    pub storage_bytes: u64,
    pub max_beneficiaries: u32,
    pub heartbeat_range: HeartbeatRange,
    /// `None` is unlimited.
    pub decryption_limit: Option<u32>,
    /// Free vaults are never touched by the reconciliation engine.
    pub automated_monitoring: bool,
}

pub fn limits_for(tier: PlanTier) -> PlanLimits {
    match tier {
        PlanTier::Free => PlanLimits {
            tier,
            storage_bytes: 10 * MIB,
            max_beneficiaries: 1,
            heartbeat_range: HeartbeatRange {
                min_days: 30,
                max_days: 90,
            },
            decryption_limit: Some(3),
            automated_monitoring: false,
        },
        PlanTier::Base => PlanLimits {
            tier,
            storage_bytes: 250 * MIB,
            max_beneficiaries: 5,
            heartbeat_range: HeartbeatRange {
                min_days: 30,
                max_days: 180,
            },
            decryption_limit: Some(10),
            automated_monitoring: true,
        },
        PlanTier::Pro => PlanLimits {
            tier,
            storage_bytes: 5 * 1024 * MIB,
            max_beneficiaries: 25,
            heartbeat_range: HeartbeatRange {
                min_days: 7,
                max_days: 365,
            },
            decryption_limit: None,
            automated_monitoring: true,
        },
    }
}

pub fn has_automated_monitoring(tier: PlanTier) -> bool {
    limits_for(tier).automated_monitoring
}
