//! PostgreSQL storage implementation
//!
//! Vault, beneficiary and owner records are stored as JSONB documents next to the
//! indexed columns used for scans and conditional updates.
//!
//! The event and compensation chains live only in their tables. An append takes a
//! transaction-scoped advisory lock per chain, reads the tail row and inserts its
//! successor before committing, so any number of processes (a `serve` instance and a
//! cron `run-once`) can write the same chain.

use super::traits::*;
use crate::error::HeirloomError;
use crate::ledger::{self, AppendOnlyLog, ChainRecord};
use crate::types::{
    Beneficiary, CompensationLogEntry, DeadManSwitchEvent, OwnerProfile, Vault, VaultStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

const EVENTS_TABLE: &str = "heirloom_events";
const COMPENSATIONS_TABLE: &str = "heirloom_compensations";

/// Advisory lock keys serializing appends to each chain.
const EVENTS_LOCK_KEY: i64 = 0x4845_4952_0001;
const COMPENSATIONS_LOCK_KEY: i64 = 0x4845_4952_0002;

#[derive(Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

/// Indexed columns stored next to each chained record.
struct LogColumns {
    entry_id: String,
    vault_id: String,
    kind: &'static str,
    recorded_at: DateTime<Utc>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| HeirloomError::Storage(format!("postgres connect failed: {e}")))?;

        ensure_schema(&pool).await?;
        // Refuse to start over a broken chain.
        AppendOnlyLog::from_entries(
            load_log::<DeadManSwitchEvent>(&pool, EVENTS_TABLE, None).await?,
        )?;
        AppendOnlyLog::from_entries(
            load_log::<CompensationLogEntry>(&pool, COMPENSATIONS_TABLE, None).await?,
        )?;

        Ok(Self { pool })
    }

    async fn append_chained<T>(
        &self,
        table: &str,
        lock_key: i64,
        record: T,
        columns: fn(&T) -> LogColumns,
    ) -> StorageResult<T>
    where
        T: ChainRecord + Send + Sync + Unpin + 'static,
    {
        let storage = |e: sqlx::Error| {
            HeirloomError::Storage(format!("postgres append to {table} failed: {e}"))
        };

        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        // Table names come from this module only.
        let tail_query = format!("SELECT record FROM {table} ORDER BY log_index DESC LIMIT 1");
        let tail = sqlx::query(&tail_query)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .map(|row| decode_record::<T>(&row))
            .transpose()?;

        let sealed = ledger::seal_after(tail.as_ref().map(|t| t.link()), record)?;
        let indexed = columns(&sealed);
        let insert = format!(
            "INSERT INTO {table} (log_index, entry_id, vault_id, kind, recorded_at, record) \
             VALUES ($1, $2, $3, $4, $5, $6)"
        );
        sqlx::query(&insert)
            .bind(to_db_revision(sealed.link().index)?)
            .bind(indexed.entry_id)
            .bind(indexed.vault_id)
            .bind(indexed.kind)
            .bind(indexed.recorded_at)
            .bind(Json(&sealed))
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(sealed)
    }
}

fn event_columns(event: &DeadManSwitchEvent) -> LogColumns {
    LogColumns {
        entry_id: event.event_id.clone(),
        vault_id: event.vault_id.clone(),
        kind: event.kind.name(),
        recorded_at: event.occurred_at,
    }
}

fn compensation_columns(entry: &CompensationLogEntry) -> LogColumns {
    LogColumns {
        entry_id: entry.entry_id.clone(),
        vault_id: entry.vault_id.clone(),
        kind: entry.action.name(),
        recorded_at: entry.created_at,
    }
}

#[async_trait]
impl VaultStore for PostgresStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn insert_vault(&self, vault: Vault) -> StorageResult<Vault> {
        let result = sqlx::query(
            r#"
            INSERT INTO heirloom_vaults (vault_id, status, revision, document, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (vault_id) DO NOTHING
            "#,
        )
        .bind(&vault.vault_id)
        .bind(vault.status.name())
        .bind(to_db_revision(vault.revision)?)
        .bind(Json(&vault))
        .bind(vault.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| HeirloomError::Storage(format!("postgres vault insert failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(HeirloomError::Conflict(format!(
                "vault '{}' already exists",
                vault.vault_id
            )));
        }
        Ok(vault)
    }

    async fn get_vault(&self, vault_id: &str) -> StorageResult<Option<Vault>> {
        let row = sqlx::query("SELECT document FROM heirloom_vaults WHERE vault_id = $1")
            .bind(vault_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HeirloomError::Storage(format!("postgres vault load failed: {e}")))?;

        row.map(|row| decode_document::<Vault>(&row)).transpose()
    }

    async fn list_vaults_by_status(&self, status: VaultStatus) -> StorageResult<Vec<Vault>> {
        let rows = sqlx::query(
            "SELECT document FROM heirloom_vaults WHERE status = $1 ORDER BY vault_id ASC",
        )
        .bind(status.name())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HeirloomError::Storage(format!("postgres vault scan failed: {e}")))?;

        rows.iter().map(decode_document::<Vault>).collect()
    }

    async fn update_vault(
        &self,
        mut vault: Vault,
        expected: VaultPrecondition,
    ) -> StorageResult<Vault> {
        if expected.status.is_terminal() && vault.status != expected.status {
            return Err(HeirloomError::Conflict(format!(
                "vault '{}' is triggered; status is terminal",
                vault.vault_id
            )));
        }

        vault.revision = expected.revision + 1;
        let result = sqlx::query(
            r#"
            UPDATE heirloom_vaults
            SET status = $1, revision = $2, document = $3, updated_at = $4
            WHERE vault_id = $5 AND status = $6 AND revision = $7
            "#,
        )
        .bind(vault.status.name())
        .bind(to_db_revision(vault.revision)?)
        .bind(Json(&vault))
        .bind(vault.updated_at)
        .bind(&vault.vault_id)
        .bind(expected.status.name())
        .bind(to_db_revision(expected.revision)?)
        .execute(&self.pool)
        .await
        .map_err(|e| HeirloomError::Storage(format!("postgres vault update failed: {e}")))?;

        if result.rows_affected() == 0 {
            return match self.get_vault(&vault.vault_id).await? {
                None => Err(HeirloomError::vault_not_found(&vault.vault_id)),
                Some(current) => {
                    check_vault_precondition(&current, &vault, expected)?;
                    Err(HeirloomError::Conflict(format!(
                        "vault '{}' changed concurrently",
                        vault.vault_id
                    )))
                }
            };
        }
        Ok(vault)
    }

    async fn upsert_owner(&self, vault_id: &str, owner: OwnerProfile) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO heirloom_owners (vault_id, document, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (vault_id) DO UPDATE
            SET document = EXCLUDED.document, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(vault_id)
        .bind(Json(&owner))
        .execute(&self.pool)
        .await
        .map_err(|e| HeirloomError::Storage(format!("postgres owner upsert failed: {e}")))?;
        Ok(())
    }

    async fn get_owner(&self, vault_id: &str) -> StorageResult<Option<OwnerProfile>> {
        let row = sqlx::query("SELECT document FROM heirloom_owners WHERE vault_id = $1")
            .bind(vault_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HeirloomError::Storage(format!("postgres owner load failed: {e}")))?;

        row.map(|row| decode_document::<OwnerProfile>(&row))
            .transpose()
    }

    async fn insert_beneficiary(&self, beneficiary: Beneficiary) -> StorageResult<Beneficiary> {
        let result = sqlx::query(
            r#"
            INSERT INTO heirloom_beneficiaries
                (beneficiary_id, vault_id, status, revision, document, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (beneficiary_id) DO NOTHING
            "#,
        )
        .bind(&beneficiary.beneficiary_id)
        .bind(&beneficiary.vault_id)
        .bind(beneficiary.status.name())
        .bind(to_db_revision(beneficiary.revision)?)
        .bind(Json(&beneficiary))
        .bind(beneficiary.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            HeirloomError::Storage(format!("postgres beneficiary insert failed: {e}"))
        })?;

        if result.rows_affected() == 0 {
            return Err(HeirloomError::Conflict(format!(
                "beneficiary '{}' already exists",
                beneficiary.beneficiary_id
            )));
        }
        Ok(beneficiary)
    }

    async fn get_beneficiary(&self, beneficiary_id: &str) -> StorageResult<Option<Beneficiary>> {
        let row =
            sqlx::query("SELECT document FROM heirloom_beneficiaries WHERE beneficiary_id = $1")
                .bind(beneficiary_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    HeirloomError::Storage(format!("postgres beneficiary load failed: {e}"))
                })?;

        row.map(|row| decode_document::<Beneficiary>(&row))
            .transpose()
    }

    async fn list_beneficiaries(&self, vault_id: &str) -> StorageResult<Vec<Beneficiary>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM heirloom_beneficiaries
            WHERE vault_id = $1
            ORDER BY created_at ASC, beneficiary_id ASC
            "#,
        )
        .bind(vault_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HeirloomError::Storage(format!("postgres beneficiary scan failed: {e}")))?;

        rows.iter().map(decode_document::<Beneficiary>).collect()
    }

    async fn update_beneficiary(
        &self,
        mut beneficiary: Beneficiary,
        expected_revision: u64,
    ) -> StorageResult<Beneficiary> {
        let current = self
            .get_beneficiary(&beneficiary.beneficiary_id)
            .await?
            .ok_or_else(|| HeirloomError::beneficiary_not_found(&beneficiary.beneficiary_id))?;
        check_beneficiary_precondition(&current, &beneficiary, expected_revision)?;

        beneficiary.revision = expected_revision + 1;
        let result = sqlx::query(
            r#"
            UPDATE heirloom_beneficiaries
            SET status = $1, revision = $2, document = $3
            WHERE beneficiary_id = $4 AND revision = $5
            "#,
        )
        .bind(beneficiary.status.name())
        .bind(to_db_revision(beneficiary.revision)?)
        .bind(Json(&beneficiary))
        .bind(&beneficiary.beneficiary_id)
        .bind(to_db_revision(expected_revision)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            HeirloomError::Storage(format!("postgres beneficiary update failed: {e}"))
        })?;

        if result.rows_affected() == 0 {
            return Err(HeirloomError::Conflict(format!(
                "beneficiary '{}' changed concurrently",
                beneficiary.beneficiary_id
            )));
        }
        Ok(beneficiary)
    }

    async fn append_event(&self, event: DeadManSwitchEvent) -> StorageResult<DeadManSwitchEvent> {
        self.append_chained(EVENTS_TABLE, EVENTS_LOCK_KEY, event, event_columns)
            .await
    }

    async fn list_events(&self, vault_id: Option<&str>) -> StorageResult<Vec<DeadManSwitchEvent>> {
        load_log(&self.pool, EVENTS_TABLE, vault_id).await
    }

    async fn append_compensation(
        &self,
        entry: CompensationLogEntry,
    ) -> StorageResult<CompensationLogEntry> {
        self.append_chained(
            COMPENSATIONS_TABLE,
            COMPENSATIONS_LOCK_KEY,
            entry,
            compensation_columns,
        )
        .await
    }

    async fn list_compensations(
        &self,
        vault_id: Option<&str>,
    ) -> StorageResult<Vec<CompensationLogEntry>> {
        load_log(&self.pool, COMPENSATIONS_TABLE, vault_id).await
    }

    async fn verify_chains(&self) -> StorageResult<bool> {
        let events = load_log::<DeadManSwitchEvent>(&self.pool, EVENTS_TABLE, None).await?;
        let compensations =
            load_log::<CompensationLogEntry>(&self.pool, COMPENSATIONS_TABLE, None).await?;
        Ok(ledger::verify_records(&events) && ledger::verify_records(&compensations))
    }
}

async fn ensure_schema(pool: &PgPool) -> StorageResult<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS heirloom_vaults (
            vault_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            revision BIGINT NOT NULL,
            document JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_heirloom_vaults_status ON heirloom_vaults (status)",
        r#"
        CREATE TABLE IF NOT EXISTS heirloom_beneficiaries (
            beneficiary_id TEXT PRIMARY KEY,
            vault_id TEXT NOT NULL,
            status TEXT NOT NULL,
            revision BIGINT NOT NULL,
            document JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_heirloom_beneficiaries_vault ON heirloom_beneficiaries (vault_id)",
        r#"
        CREATE TABLE IF NOT EXISTS heirloom_owners (
            vault_id TEXT PRIMARY KEY,
            document JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS heirloom_events (
            log_index BIGINT PRIMARY KEY,
            entry_id TEXT NOT NULL UNIQUE,
            vault_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL,
            record JSONB NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS heirloom_compensations (
            log_index BIGINT PRIMARY KEY,
            entry_id TEXT NOT NULL UNIQUE,
            vault_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL,
            record JSONB NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_heirloom_events_vault ON heirloom_events (vault_id)",
        "CREATE INDEX IF NOT EXISTS idx_heirloom_compensations_vault ON heirloom_compensations (vault_id)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| HeirloomError::Storage(format!("postgres schema create failed: {e}")))?;
    }
    Ok(())
}

async fn load_log<T>(
    pool: &PgPool,
    table: &str,
    vault_id: Option<&str>,
) -> StorageResult<Vec<T>>
where
    T: ChainRecord + Send + Unpin + 'static,
{
    // Table names come from this module only.
    let query = format!(
        "SELECT record FROM {table} WHERE ($1::TEXT IS NULL OR vault_id = $1) ORDER BY log_index ASC"
    );
    let rows = sqlx::query(&query)
        .bind(vault_id)
        .fetch_all(pool)
        .await
        .map_err(|e| HeirloomError::Storage(format!("postgres load of {table} failed: {e}")))?;

    rows.iter().map(decode_record::<T>).collect()
}

fn decode_record<T>(row: &sqlx::postgres::PgRow) -> StorageResult<T>
where
    T: serde::de::DeserializeOwned,
{
    row.try_get::<Json<T>, _>("record")
        .map(|json| json.0)
        .map_err(|e| HeirloomError::Storage(format!("postgres decode record failed: {e}")))
}

fn decode_document<T>(row: &sqlx::postgres::PgRow) -> StorageResult<T>
where
    T: serde::de::DeserializeOwned,
{
    row.try_get::<Json<T>, _>("document")
        .map(|json| json.0)
        .map_err(|e| HeirloomError::Storage(format!("postgres decode document failed: {e}")))
}

fn to_db_revision(value: u64) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| HeirloomError::Storage("value exceeds postgres BIGINT range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SwitchEventKind;

    #[test]
    fn revision_conversion_rejects_overflow() {
        assert_eq!(to_db_revision(7).unwrap(), 7);
        assert!(to_db_revision(u64::MAX).is_err());
    }

    async fn append_heartbeats(store: &PostgresStore, vault_id: &str, n: usize) {
        for _ in 0..n {
            store
                .append_event(DeadManSwitchEvent::new(
                    vault_id,
                    SwitchEventKind::HeartbeatRecorded,
                    serde_json::Value::Null,
                    Utc::now(),
                ))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires HEIRLOOM_TEST_DATABASE_URL"]
    async fn two_stores_share_one_event_chain() {
        let Ok(url) = std::env::var("HEIRLOOM_TEST_DATABASE_URL") else {
            return;
        };
        let a = PostgresStore::connect(&url, 2).await.unwrap();
        let b = PostgresStore::connect(&url, 2).await.unwrap();
        let vault_id = format!("chain-{}", uuid::Uuid::new_v4());

        tokio::join!(
            append_heartbeats(&a, &vault_id, 10),
            append_heartbeats(&b, &vault_id, 10)
        );

        assert_eq!(a.list_events(Some(vault_id.as_str())).await.unwrap().len(), 20);
        assert_eq!(b.list_events(Some(vault_id.as_str())).await.unwrap().len(), 20);
        assert!(a.verify_chains().await.unwrap());
    }
}
