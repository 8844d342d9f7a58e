//! SQLite transfer record store

use crate::chain::Chain;
use crate::config::StoreConfig;
use crate::coordination::{FailureReason, TransferRecord, TransferStatus, TransferUpdate};
use crate::error::{StoreError, StoreResult};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Compare-and-set attempts before giving up on a contended record
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Durable keyed store of transfer records
pub struct TransferStore {
    pool: SqlitePool,
    /// Serializes writers of the same transfer within this process
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl TransferStore {
    /// Open (or create) the store
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            locks: DashMap::new(),
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                transfer_id TEXT PRIMARY KEY,
                asset_id TEXT NOT NULL,
                source_chain TEXT NOT NULL,
                destination_chain TEXT NOT NULL,
                receiver TEXT NOT NULL,
                sender TEXT,
                status TEXT NOT NULL,
                source_tx_hash TEXT,
                relay_message_id TEXT,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                CHECK (source_chain <> destination_chain)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_status
            ON transfers (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Transfer store migrations complete");
        Ok(())
    }

    /// Persist a new record
    pub async fn create(&self, record: &TransferRecord) -> StoreResult<()> {
        record
            .check_shape()
            .map_err(|reason| StoreError::InvalidTransition {
                transfer_id: record.transfer_id,
                source: crate::coordination::TransitionError {
                    from: record.status,
                    to: record.status,
                    reason: reason.to_string(),
                },
            })?;

        let lock = self.key_lock(record.transfer_id);
        let result = {
            let _guard = lock.lock().await;
            self.insert(record).await
        };
        self.release_key_lock(record.transfer_id, lock);
        result
    }

    async fn insert(&self, record: &TransferRecord) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers
                (transfer_id, asset_id, source_chain, destination_chain, receiver, sender,
                 status, source_tx_hash, relay_message_id, failure_reason, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(record.transfer_id.to_string())
        .bind(&record.asset_id)
        .bind(record.source_chain.as_str())
        .bind(record.destination_chain.as_str())
        .bind(&record.receiver)
        .bind(&record.sender)
        .bind(record.status.as_str())
        .bind(&record.source_tx_hash)
        .bind(&record.relay_message_id)
        .bind(record.failure_reason.map(|r| r.as_str()))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Created transfer {} ({})", record.transfer_id, record.status);
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateKey {
                    transfer_id: record.transfer_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Merge an update into an existing record
    pub async fn update(
        &self,
        transfer_id: Uuid,
        update: TransferUpdate,
    ) -> StoreResult<TransferRecord> {
        let lock = self.key_lock(transfer_id);
        let result = {
            let _guard = lock.lock().await;
            self.compare_and_set(transfer_id, &update).await
        };
        self.release_key_lock(transfer_id, lock);
        result
    }

    async fn compare_and_set(
        &self,
        transfer_id: Uuid,
        update: &TransferUpdate,
    ) -> StoreResult<TransferRecord> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let (current, version) = self
                .fetch(transfer_id)
                .await?
                .ok_or(StoreError::NotFound { transfer_id })?;

            let next = current
                .apply(update, Utc::now())
                .map_err(|source| StoreError::InvalidTransition {
                    transfer_id,
                    source,
                })?;

            if next == current {
                return Ok(next);
            }

            let result = sqlx::query(
                r#"
                UPDATE transfers
                SET status = ?1, sender = ?2, source_tx_hash = ?3, relay_message_id = ?4,
                    failure_reason = ?5, updated_at = ?6, version = version + 1
                WHERE transfer_id = ?7 AND version = ?8
                "#,
            )
            .bind(next.status.as_str())
            .bind(&next.sender)
            .bind(&next.source_tx_hash)
            .bind(&next.relay_message_id)
            .bind(next.failure_reason.map(|r| r.as_str()))
            .bind(next.updated_at)
            .bind(transfer_id.to_string())
            .bind(version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                debug!(
                    "Updated transfer {}: {} -> {}",
                    transfer_id, current.status, next.status
                );
                return Ok(next);
            }

            warn!(
                "Transfer {} changed underneath us (attempt {}/{}), retrying",
                transfer_id, attempt, MAX_WRITE_ATTEMPTS
            );
        }

        Err(StoreError::Conflict { transfer_id })
    }

    /// Get the current record
    pub async fn get(&self, transfer_id: Uuid) -> StoreResult<TransferRecord> {
        self.fetch(transfer_id)
            .await?
            .map(|(record, _)| record)
            .ok_or(StoreError::NotFound { transfer_id })
    }

    /// Snapshot of all records, oldest first
    pub async fn list(&self, status: Option<TransferStatus>) -> StoreResult<Vec<TransferRecord>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM transfers WHERE status = ?1 ORDER BY created_at, transfer_id",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM transfers ORDER BY created_at, transfer_id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|row| row_to_record(row).map(|(record, _)| record))
            .collect()
    }

    /// Get transfer statistics
    pub async fn stats(&self) -> StoreResult<TransferStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'initiated') as initiated,
                COUNT(*) FILTER (WHERE status = 'in-progress') as in_progress,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM transfers
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TransferStats {
            initiated: row.try_get::<i64, _>("initiated")? as u64,
            in_progress: row.try_get::<i64, _>("in_progress")? as u64,
            completed: row.try_get::<i64, _>("completed")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
        })
    }

    async fn fetch(&self, transfer_id: Uuid) -> StoreResult<Option<(TransferRecord, i64)>> {
        let row = sqlx::query("SELECT * FROM transfers WHERE transfer_id = ?1")
            .bind(transfer_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    fn key_lock(&self, transfer_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(transfer_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock of a transfer nobody else is waiting on
    fn release_key_lock(&self, transfer_id: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(&transfer_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn row_to_record(row: &SqliteRow) -> StoreResult<(TransferRecord, i64)> {
    let id: String = row.try_get("transfer_id")?;
    let corrupt = |message: String| StoreError::Corrupt {
        transfer_id: id.clone(),
        message,
    };

    let transfer_id = Uuid::parse_str(&id).map_err(|e| corrupt(e.to_string()))?;
    let source_chain = Chain::from_str(&row.try_get::<String, _>("source_chain")?).map_err(corrupt)?;
    let destination_chain =
        Chain::from_str(&row.try_get::<String, _>("destination_chain")?).map_err(corrupt)?;
    let status = TransferStatus::from_str(&row.try_get::<String, _>("status")?).map_err(corrupt)?;
    let failure_reason = row
        .try_get::<Option<String>, _>("failure_reason")?
        .map(|r| FailureReason::from_str(&r))
        .transpose()
        .map_err(corrupt)?;

    let record = TransferRecord {
        transfer_id,
        asset_id: row.try_get("asset_id")?,
        source_chain,
        destination_chain,
        receiver: row.try_get("receiver")?,
        sender: row.try_get("sender")?,
        status,
        source_tx_hash: row.try_get("source_tx_hash")?,
        relay_message_id: row.try_get("relay_message_id")?,
        failure_reason,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    };

    Ok((record, row.try_get("version")?))
}

/// Transfer counts per status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    pub initiated: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::TransferRequest;
    use futures::future::join_all;
    use tokio_test::assert_ok;

    async fn open_store(dir: &tempfile::TempDir) -> TransferStore {
        let config = StoreConfig {
            path: dir.path().join("data").join("transfers.db"),
            max_connections: 4,
            busy_timeout_ms: 5_000,
        };
        let store = TransferStore::connect(&config).await.unwrap();
        store.run_migrations().await.unwrap();
        store
    }

    fn new_record() -> TransferRecord {
        TransferRecord::initiated(
            &TransferRequest {
                asset_id: "42".to_string(),
                source_chain: Chain::AvalancheFuji,
                destination_chain: Chain::ArbitrumSepolia,
                receiver: "0xABC".to_string(),
            },
            Utc::now(),
        )
    }

    fn without_updated_at(mut record: TransferRecord) -> TransferRecord {
        record.updated_at = record.created_at;
        record
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let record = new_record();

        assert_ok!(store.create(&record).await);
        let loaded = store.get(record.transfer_id).await.unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let record = new_record();

        store.create(&record).await.unwrap();
        let err = store.create(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { transfer_id } if transfer_id == record.transfer_id));
    }

    #[tokio::test]
    async fn test_missing_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let id = Uuid::new_v4();

        assert!(matches!(store.get(id).await, Err(StoreError::NotFound { .. })));
        assert!(matches!(
            store.update(id, TransferUpdate::failed(FailureReason::Network)).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let record = new_record();
        let id = record.transfer_id;
        store.create(&record).await.unwrap();

        store
            .update(id, TransferUpdate::submitted("0xSENDER", "0xHASH"))
            .await
            .unwrap();
        let completed = store
            .update(id, TransferUpdate::completed(Some("msg-1".to_string())))
            .await
            .unwrap();

        let backwards = TransferUpdate {
            status: Some(TransferStatus::Initiated),
            ..Default::default()
        };
        let err = store.update(id, backwards).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.get(id).await.unwrap(), completed);
    }

    #[tokio::test]
    async fn test_hash_with_pre_submission_failure_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let record = new_record();
        let id = record.transfer_id;
        store.create(&record).await.unwrap();

        let update = TransferUpdate {
            source_tx_hash: Some("0xHASH".to_string()),
            ..TransferUpdate::failed(FailureReason::Network)
        };
        let err = store.update(id, update).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.status, TransferStatus::Initiated);
        assert!(stored.source_tx_hash.is_none());
        assert!(store.locks.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_update_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let record = new_record();
        let id = record.transfer_id;
        store.create(&record).await.unwrap();

        let update = TransferUpdate::submitted("0xSENDER", "0xHASH");
        let first = store.update(id, update.clone()).await.unwrap();
        let second = store.update(id, update).await.unwrap();
        assert_eq!(without_updated_at(first), without_updated_at(second));

        let done = TransferUpdate::completed(None);
        let first = store.update(id, done.clone()).await.unwrap();
        let second = store.update(id, done).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let record = new_record();
        {
            let store = open_store(&dir).await;
            store.create(&record).await.unwrap();
            store
                .update(record.transfer_id, TransferUpdate::submitted("0xSENDER", "0xHASH"))
                .await
                .unwrap();
            store.pool.close().await;
        }

        let store = open_store(&dir).await;
        let loaded = store.get(record.transfer_id).await.unwrap();
        assert_eq!(loaded.status, TransferStatus::InProgress);
        assert_eq!(loaded.source_tx_hash.as_deref(), Some("0xHASH"));
        assert_eq!(loaded.sender.as_deref(), Some("0xSENDER"));
    }

    #[tokio::test]
    async fn test_racing_terminal_writes_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(&dir).await);
        let record = new_record();
        let id = record.transfer_id;
        store.create(&record).await.unwrap();
        store
            .update(id, TransferUpdate::submitted("0xSENDER", "0xHASH"))
            .await
            .unwrap();

        let writes = (0..8).map(|i| {
            let store = store.clone();
            let update = if i % 2 == 0 {
                TransferUpdate::completed(Some("msg-1".to_string()))
            } else {
                TransferUpdate::failed(FailureReason::Timeout)
            };
            tokio::spawn(async move { store.update(id, update).await })
        });
        let results: Vec<_> = join_all(writes)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let final_record = store.get(id).await.unwrap();
        assert!(final_record.status.is_terminal());
        assert!(store.locks.is_empty());
        for result in results {
            match result {
                Ok(record) => assert_eq!(record, final_record),
                Err(err) => assert!(matches!(err, StoreError::InvalidTransition { .. })),
            }
        }
    }

    #[tokio::test]
    async fn test_distinct_transfers_update_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(&dir).await);

        let records: Vec<_> = (0..10).map(|_| new_record()).collect();
        for record in &records {
            store.create(record).await.unwrap();
        }

        let writes = records.iter().map(|record| {
            let store = store.clone();
            let id = record.transfer_id;
            tokio::spawn(async move {
                store
                    .update(id, TransferUpdate::submitted("0xSENDER", format!("0x{}", id.simple())))
                    .await?;
                store.update(id, TransferUpdate::completed(None)).await
            })
        });
        for joined in join_all(writes).await {
            assert_ok!(joined.unwrap());
        }

        assert!(store.locks.is_empty());

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            TransferStats {
                completed: 10,
                ..Default::default()
            }
        );
        assert_eq!(
            store.list(Some(TransferStatus::Completed)).await.unwrap().len(),
            10
        );
        assert!(store.list(Some(TransferStatus::Failed)).await.unwrap().is_empty());
    }
}
