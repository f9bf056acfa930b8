use thiserror::Error;

/// Heirloom core errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeirloomError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Entitlement denied ({code}): {reason}")]
    EntitlementDenied { code: String, reason: String },

    #[error("External service '{service}' failed: {message}")]
    ExternalServiceFailure { service: String, message: String },

    #[error("External service '{service}' timed out after {timeout_ms}ms")]
    Timeout { service: String, timeout_ms: u64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conditional update rejected: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl HeirloomError {
    pub fn vault_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "vault",
            id: id.into(),
        }
    }

    pub fn beneficiary_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "beneficiary",
            id: id.into(),
        }
    }

    pub fn owner_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "owner",
            id: id.into(),
        }
    }

    pub fn denied(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EntitlementDenied {
            code: code.into(),
            reason: reason.into(),
        }
    }

    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalServiceFailure {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Per-item failures are collected into the run report; only these abort a run.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// True for provider errors and timeouts, which are recorded and never retried in-run.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Self::ExternalServiceFailure { .. } | Self::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for HeirloomError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
