//! Storage layer for vault, beneficiary, event, and compensation records.

mod memory;
mod postgres;
mod traits;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use traits::{StorageResult, VaultPrecondition, VaultStore};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persistence backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Keep all records in process memory only.
    #[default]
    Memory,
    /// Persist records in PostgreSQL; the audit chains are verified on startup.
    Postgres {
        database_url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

/// Open the configured backend.
pub async fn open_store(config: &StorageConfig) -> StorageResult<Arc<dyn VaultStore>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(InMemoryStore::new())),
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => Ok(Arc::new(
            PostgresStore::connect(database_url, *max_connections).await?,
        )),
    }
}
