//! Durable per-subscription cursors.
//!
//! Rows are data-only: the ABI fragment and handler are reattached from
//! the contract registry when the engine rehydrates a persisted
//! subscription (the id carries the topic0 needed for the match).

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::str::FromStr;

use logtide_common::error::StoreError;
use logtide_common::types::{Subscription, ToBlock};

use crate::db;

/// Persisted form of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSubscription {
    pub id: String,
    pub chain_id: u64,
    pub contract_name: String,
    pub contract_address: Address,
    pub from_block: u64,
    pub to_block: ToBlock,
    pub indexed_to_block: i64,
    pub indexed_to_log_index: u64,
}

impl StoredSubscription {
    /// The topic0 embedded in the subscription id
    /// (`<chainId>-<address>-<topic0>`).
    pub fn topic0(&self) -> Option<B256> {
        let raw = self.id.split('-').nth(2)?;
        B256::from_str(raw).ok()
    }
}

impl From<&Subscription> for StoredSubscription {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id.clone(),
            chain_id: sub.chain_id,
            contract_name: sub.contract_name.clone(),
            contract_address: sub.contract_address,
            from_block: sub.from_block,
            to_block: sub.to_block,
            indexed_to_block: sub.indexed_to_block,
            indexed_to_log_index: sub.indexed_to_log_index,
        }
    }
}

/// Subscription persistence contract.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn init(&self) -> Result<(), StoreError>;

    /// Upsert by id.
    async fn save(&self, sub: &StoredSubscription) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<StoredSubscription>, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn all(&self, chain_id: u64) -> Result<Vec<StoredSubscription>, StoreError>;

    async fn update_cursor(
        &self,
        id: &str,
        indexed_to_block: i64,
        indexed_to_log_index: u64,
    ) -> Result<(), StoreError>;
}

/// Embedded SQLite subscription store.
#[derive(Clone)]
pub struct SqliteSubscriptionStore {
    pool: SqlitePool,
}

impl SqliteSubscriptionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        Ok(Self::new(db::create_pool(database_url, max_connections).await?))
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(db::create_memory_pool().await?))
    }
}

type SubscriptionRow = (String, i64, String, String, i64, String, i64, i64);

fn row_to_subscription(row: SubscriptionRow) -> Result<StoredSubscription, StoreError> {
    let (id, chain_id, contract_name, contract_address, from_block, to_block, indexed_to_block, indexed_to_log_index) =
        row;

    Ok(StoredSubscription {
        id,
        chain_id: chain_id as u64,
        contract_name,
        contract_address: Address::from_str(&contract_address)
            .map_err(|_| StoreError::Corrupt(format!("invalid address: {contract_address}")))?,
        from_block: from_block as u64,
        to_block: ToBlock::from_str(&to_block)
            .map_err(|_| StoreError::Corrupt(format!("invalid to_block: {to_block}")))?,
        indexed_to_block,
        indexed_to_log_index: indexed_to_log_index as u64,
    })
}

#[async_trait]
impl SubscriptionStore for SqliteSubscriptionStore {
    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                chain_id INTEGER NOT NULL,
                contract_name TEXT NOT NULL,
                contract_address TEXT NOT NULL,
                from_block INTEGER NOT NULL,
                to_block TEXT NOT NULL,
                indexed_to_block INTEGER NOT NULL,
                indexed_to_log_index INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        tracing::debug!("Subscription store schema ready");
        Ok(())
    }

    async fn save(&self, sub: &StoredSubscription) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO subscriptions
                (id, chain_id, contract_name, contract_address, from_block, to_block,
                 indexed_to_block, indexed_to_log_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (id) DO UPDATE SET
                chain_id = excluded.chain_id,
                contract_name = excluded.contract_name,
                contract_address = excluded.contract_address,
                from_block = excluded.from_block,
                to_block = excluded.to_block,
                indexed_to_block = excluded.indexed_to_block,
                indexed_to_log_index = excluded.indexed_to_log_index",
        )
        .bind(&sub.id)
        .bind(sub.chain_id as i64)
        .bind(&sub.contract_name)
        .bind(format!("{:#x}", sub.contract_address))
        .bind(sub.from_block as i64)
        .bind(sub.to_block.to_string())
        .bind(sub.indexed_to_block)
        .bind(sub.indexed_to_log_index as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredSubscription>, StoreError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT id, chain_id, contract_name, contract_address, from_block, to_block,
                    indexed_to_block, indexed_to_log_index
             FROM subscriptions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_subscription).transpose()
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::debug!(subscription_id = id, "Subscription deleted");
        }
        Ok(())
    }

    async fn all(&self, chain_id: u64) -> Result<Vec<StoredSubscription>, StoreError> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            "SELECT id, chain_id, contract_name, contract_address, from_block, to_block,
                    indexed_to_block, indexed_to_log_index
             FROM subscriptions WHERE chain_id = ?1 ORDER BY id",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_subscription).collect()
    }

    async fn update_cursor(
        &self,
        id: &str,
        indexed_to_block: i64,
        indexed_to_log_index: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE subscriptions
             SET indexed_to_block = ?2, indexed_to_log_index = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(indexed_to_block)
        .bind(indexed_to_log_index as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logtide_common::types::subscription_id;

    fn make_stored(chain_id: u64, seed: u8, to_block: ToBlock) -> StoredSubscription {
        let address = Address::repeat_byte(seed);
        let topic0 = B256::repeat_byte(seed);
        StoredSubscription {
            id: subscription_id(chain_id, address, topic0),
            chain_id,
            contract_name: "Counter".to_string(),
            contract_address: address,
            from_block: 10,
            to_block,
            indexed_to_block: 9,
            indexed_to_log_index: 0,
        }
    }

    async fn setup() -> SqliteSubscriptionStore {
        let store = SqliteSubscriptionStore::in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_and_get_round_trip() {
        let store = setup().await;
        let sub = make_stored(1, 0x11, ToBlock::Latest);

        store.save(&sub).await.unwrap();
        assert_eq!(store.get(&sub.id).await.unwrap(), Some(sub.clone()));
        assert_eq!(sub.topic0(), Some(B256::repeat_byte(0x11)));
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let store = setup().await;
        let mut sub = make_stored(1, 0x11, ToBlock::Latest);

        store.save(&sub).await.unwrap();
        sub.indexed_to_block = 42;
        store.save(&sub).await.unwrap();

        let loaded = store.get(&sub.id).await.unwrap().unwrap();
        assert_eq!(loaded.indexed_to_block, 42);
        assert_eq!(store.all(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finite_to_block_round_trips_as_decimal() {
        let store = setup().await;
        let sub = make_stored(1, 0x22, ToBlock::Block(123));

        store.save(&sub).await.unwrap();
        let loaded = store.get(&sub.id).await.unwrap().unwrap();
        assert_eq!(loaded.to_block, ToBlock::Block(123));
    }

    #[tokio::test]
    async fn test_all_is_scoped_by_chain() {
        let store = setup().await;
        store.save(&make_stored(1, 0x11, ToBlock::Latest)).await.unwrap();
        store.save(&make_stored(1, 0x22, ToBlock::Latest)).await.unwrap();
        store.save(&make_stored(5, 0x33, ToBlock::Latest)).await.unwrap();

        assert_eq!(store.all(1).await.unwrap().len(), 2);
        assert_eq!(store.all(5).await.unwrap().len(), 1);
        assert!(store.all(9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_cursor() {
        let store = setup().await;
        let sub = make_stored(1, 0x11, ToBlock::Latest);
        store.save(&sub).await.unwrap();

        store.update_cursor(&sub.id, 100, 7).await.unwrap();
        let loaded = store.get(&sub.id).await.unwrap().unwrap();
        assert_eq!(loaded.indexed_to_block, 100);
        assert_eq!(loaded.indexed_to_log_index, 7);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = setup().await;
        let sub = make_stored(1, 0x11, ToBlock::Latest);
        store.save(&sub).await.unwrap();

        store.delete(&sub.id).await.unwrap();
        store.delete(&sub.id).await.unwrap();
        assert!(store.get(&sub.id).await.unwrap().is_none());
    }
}
