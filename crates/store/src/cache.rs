//! Durable cache of fetched log ranges, decoded events, block metadata and
//! contract-read results.
//!
//! The cache's core guarantee is on `log_ranges`: after every mutation, the
//! stored ranges for a `(chain_id, address)` pair are pairwise disjoint and
//! non-adjacent. Any insertion touching or overlapping existing ranges
//! collapses them into a single merged range inside one transaction, so the
//! planner can trust a covering range completely.

use alloy::primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::SqlitePool;
use std::str::FromStr;

use logtide_common::error::StoreError;
use logtide_common::types::{BlockHeader, ContractCall, Event};

use crate::db;

/// Query for a cached range of events for one subscription.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub chain_id: u64,
    pub address: Address,
    pub topic0: B256,
    pub from_block: u64,
    pub to_block: u64,
}

/// The covered contiguous prefix of a query, events ascending by
/// `(block_number, log_index)`.
#[derive(Debug, Clone)]
pub struct CachedRange {
    pub from_block: u64,
    pub to_block: u64,
    pub events: Vec<Event>,
}

/// A fetched window of decoded events for one address, ready for insertion.
///
/// An empty `events` list is a valid batch: it records that the range was
/// fetched and held nothing, which is what prevents refetching.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub chain_id: u64,
    pub address: Address,
    pub from_block: u64,
    pub to_block: u64,
    pub events: Vec<Event>,
}

/// Log cache contract. See `SqliteCache` for the embedded backend.
#[async_trait]
pub trait LogCache: Send + Sync {
    async fn init(&self) -> Result<(), StoreError>;

    /// Return the contiguous prefix of `[from_block, to_block]` covered by
    /// a stored range, or `None` when nothing covers `from_block`.
    async fn get_events(&self, query: &EventQuery) -> Result<Option<CachedRange>, StoreError>;

    /// Upsert the batch's events and merge its range with any stored
    /// ranges it touches or overlaps, atomically.
    async fn insert_events(&self, batch: &EventBatch) -> Result<(), StoreError>;

    async fn get_block(&self, chain_id: u64, number: u64)
    -> Result<Option<BlockHeader>, StoreError>;

    async fn insert_block(&self, chain_id: u64, header: &BlockHeader) -> Result<(), StoreError>;

    async fn get_contract_read(
        &self,
        chain_id: u64,
        call: &ContractCall,
    ) -> Result<Option<Bytes>, StoreError>;

    async fn insert_contract_read(
        &self,
        chain_id: u64,
        call: &ContractCall,
        result: &Bytes,
    ) -> Result<(), StoreError>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        chain_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        params TEXT NOT NULL,
        address TEXT NOT NULL,
        topic0 TEXT NOT NULL,
        transaction_hash TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        log_index INTEGER NOT NULL,
        PRIMARY KEY (chain_id, block_number, log_index)
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_by_address
        ON events (chain_id, address, topic0, block_number, log_index)",
    "CREATE TABLE IF NOT EXISTS log_ranges (
        chain_id INTEGER NOT NULL,
        address TEXT NOT NULL,
        from_block INTEGER NOT NULL,
        to_block INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_log_ranges_by_address
        ON log_ranges (chain_id, address, from_block, to_block)",
    "CREATE TABLE IF NOT EXISTS contract_reads (
        chain_id INTEGER NOT NULL,
        address TEXT NOT NULL,
        data TEXT NOT NULL,
        function_name TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        result TEXT NOT NULL,
        PRIMARY KEY (chain_id, address, data, function_name, block_number)
    )",
    "CREATE TABLE IF NOT EXISTS blocks (
        chain_id INTEGER NOT NULL,
        block_number INTEGER NOT NULL,
        block_hash TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (chain_id, block_number)
    )",
];

/// Embedded SQLite log cache.
#[derive(Clone)]
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a file-backed cache.
    pub async fn open(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        Ok(Self::new(db::create_pool(database_url, max_connections).await?))
    }

    /// Ephemeral in-memory cache, mainly for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(db::create_memory_pool().await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn address_key(address: Address) -> String {
    format!("{address:#x}")
}

fn parse_b256(raw: &str) -> Result<B256, StoreError> {
    B256::from_str(raw).map_err(|_| StoreError::Corrupt(format!("invalid hash: {raw}")))
}

#[async_trait]
impl LogCache for SqliteCache {
    async fn init(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("Log cache schema ready");
        Ok(())
    }

    async fn get_events(&self, query: &EventQuery) -> Result<Option<CachedRange>, StoreError> {
        // A covering range must contain the query's starting block; the
        // disjointness invariant means there is at most one.
        let covering: Option<(i64, i64)> = sqlx::query_as(
            "SELECT from_block, to_block FROM log_ranges
             WHERE chain_id = ?1 AND address = ?2 AND from_block <= ?3 AND to_block >= ?3
             LIMIT 1",
        )
        .bind(query.chain_id as i64)
        .bind(address_key(query.address))
        .bind(query.from_block as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some((_, stored_to)) = covering else {
            return Ok(None);
        };

        let to_block = (stored_to as u64).min(query.to_block);
        let rows: Vec<(String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT name, params, transaction_hash, block_number, log_index FROM events
             WHERE chain_id = ?1 AND address = ?2 AND topic0 = ?3
               AND block_number BETWEEN ?4 AND ?5
             ORDER BY block_number ASC, log_index ASC",
        )
        .bind(query.chain_id as i64)
        .bind(address_key(query.address))
        .bind(format!("{:#x}", query.topic0))
        .bind(query.from_block as i64)
        .bind(to_block as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for (name, params, transaction_hash, block_number, log_index) in rows {
            events.push(Event {
                name,
                params: serde_json::from_str(&params)?,
                address: query.address,
                topic0: query.topic0,
                transaction_hash: parse_b256(&transaction_hash)?,
                block_number: block_number as u64,
                log_index: log_index as u64,
            });
        }

        Ok(Some(CachedRange {
            from_block: query.from_block,
            to_block,
            events,
        }))
    }

    async fn insert_events(&self, batch: &EventBatch) -> Result<(), StoreError> {
        if batch.to_block < batch.from_block {
            return Err(StoreError::InvalidRange {
                from: batch.from_block,
                to: batch.to_block,
            });
        }

        let mut tx = self.pool.begin().await?;

        for event in &batch.events {
            sqlx::query(
                "INSERT INTO events
                    (chain_id, name, params, address, topic0, transaction_hash, block_number, log_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (chain_id, block_number, log_index) DO UPDATE SET
                    name = excluded.name,
                    params = excluded.params,
                    address = excluded.address,
                    topic0 = excluded.topic0,
                    transaction_hash = excluded.transaction_hash",
            )
            .bind(batch.chain_id as i64)
            .bind(&event.name)
            .bind(serde_json::to_string(&event.params)?)
            .bind(address_key(event.address))
            .bind(format!("{:#x}", event.topic0))
            .bind(format!("{:#x}", event.transaction_hash))
            .bind(event.block_number as i64)
            .bind(event.log_index as i64)
            .execute(&mut *tx)
            .await?;
        }

        // Collapse every range that touches or overlaps the inserted one
        // (adjacency means a gap of at most one block) into a single span.
        let touch_from = batch.from_block as i64 - 1;
        let touch_to = batch.to_block as i64 + 1;
        let touching: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT from_block, to_block FROM log_ranges
             WHERE chain_id = ?1 AND address = ?2 AND to_block >= ?3 AND from_block <= ?4",
        )
        .bind(batch.chain_id as i64)
        .bind(address_key(batch.address))
        .bind(touch_from)
        .bind(touch_to)
        .fetch_all(&mut *tx)
        .await?;

        let mut merged_from = batch.from_block as i64;
        let mut merged_to = batch.to_block as i64;
        for (from, to) in &touching {
            merged_from = merged_from.min(*from);
            merged_to = merged_to.max(*to);
        }

        if !touching.is_empty() {
            sqlx::query(
                "DELETE FROM log_ranges
                 WHERE chain_id = ?1 AND address = ?2 AND to_block >= ?3 AND from_block <= ?4",
            )
            .bind(batch.chain_id as i64)
            .bind(address_key(batch.address))
            .bind(touch_from)
            .bind(touch_to)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("INSERT INTO log_ranges (chain_id, address, from_block, to_block) VALUES (?1, ?2, ?3, ?4)")
            .bind(batch.chain_id as i64)
            .bind(address_key(batch.address))
            .bind(merged_from)
            .bind(merged_to)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            chain_id = batch.chain_id,
            address = %batch.address,
            from_block = batch.from_block,
            to_block = batch.to_block,
            events = batch.events.len(),
            merged_from,
            merged_to,
            "Cached fetched range"
        );
        Ok(())
    }

    async fn get_block(
        &self,
        chain_id: u64,
        number: u64,
    ) -> Result<Option<BlockHeader>, StoreError> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT block_hash, timestamp FROM blocks WHERE chain_id = ?1 AND block_number = ?2",
        )
        .bind(chain_id as i64)
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(hash, timestamp)| {
            let timestamp = Utc
                .timestamp_opt(timestamp, 0)
                .single()
                .ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp: {timestamp}")))?;
            Ok(BlockHeader {
                number,
                hash: parse_b256(&hash)?,
                timestamp,
            })
        })
        .transpose()
    }

    async fn insert_block(&self, chain_id: u64, header: &BlockHeader) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO blocks (chain_id, block_number, block_hash, timestamp)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (chain_id, block_number) DO UPDATE SET
                block_hash = excluded.block_hash,
                timestamp = excluded.timestamp",
        )
        .bind(chain_id as i64)
        .bind(header.number as i64)
        .bind(format!("{:#x}", header.hash))
        .bind(header.timestamp.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_contract_read(
        &self,
        chain_id: u64,
        call: &ContractCall,
    ) -> Result<Option<Bytes>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT result FROM contract_reads
             WHERE chain_id = ?1 AND address = ?2 AND data = ?3
               AND function_name = ?4 AND block_number = ?5",
        )
        .bind(chain_id as i64)
        .bind(address_key(call.address))
        .bind(call.data.to_string())
        .bind(&call.function_name)
        .bind(call.block_number as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(raw,)| {
            Bytes::from_str(&raw).map_err(|_| StoreError::Corrupt(format!("invalid hex: {raw}")))
        })
        .transpose()
    }

    async fn insert_contract_read(
        &self,
        chain_id: u64,
        call: &ContractCall,
        result: &Bytes,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO contract_reads
                (chain_id, address, data, function_name, block_number, result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (chain_id, address, data, function_name, block_number)
                DO UPDATE SET result = excluded.result",
        )
        .bind(chain_id as i64)
        .bind(address_key(call.address))
        .bind(call.data.to_string())
        .bind(&call.function_name)
        .bind(call.block_number as i64)
        .bind(result.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CHAIN: u64 = 1;

    fn test_address() -> Address {
        Address::repeat_byte(0x01)
    }

    fn test_topic() -> B256 {
        B256::repeat_byte(0xEE)
    }

    fn make_event(block_number: u64, log_index: u64) -> Event {
        Event {
            name: "Increment".to_string(),
            params: json!({}),
            address: test_address(),
            topic0: test_topic(),
            transaction_hash: B256::repeat_byte(0x33),
            block_number,
            log_index,
        }
    }

    fn batch(from_block: u64, to_block: u64, events: Vec<Event>) -> EventBatch {
        EventBatch {
            chain_id: CHAIN,
            address: test_address(),
            from_block,
            to_block,
            events,
        }
    }

    fn query(from_block: u64, to_block: u64) -> EventQuery {
        EventQuery {
            chain_id: CHAIN,
            address: test_address(),
            topic0: test_topic(),
            from_block,
            to_block,
        }
    }

    async fn setup() -> SqliteCache {
        let cache = SqliteCache::in_memory().await.unwrap();
        cache.init().await.unwrap();
        cache
    }

    async fn stored_ranges(cache: &SqliteCache) -> Vec<(i64, i64)> {
        sqlx::query_as(
            "SELECT from_block, to_block FROM log_ranges
             WHERE chain_id = ?1 AND address = ?2
             ORDER BY from_block",
        )
        .bind(CHAIN as i64)
        .bind(address_key(test_address()))
        .fetch_all(cache.pool())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_then_get_round_trip() {
        let cache = setup().await;
        cache
            .insert_events(&batch(1, 2, vec![make_event(1, 0), make_event(2, 1)]))
            .await
            .unwrap();

        let cached = cache.get_events(&query(1, 2)).await.unwrap().unwrap();
        assert_eq!(cached.from_block, 1);
        assert_eq!(cached.to_block, 2);
        assert_eq!(cached.events.len(), 2);
        assert_eq!(cached.events[0].position(), (1, 0));
        assert_eq!(cached.events[1].position(), (2, 1));
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_by_primary_key() {
        let cache = setup().await;
        let events = vec![make_event(5, 0)];
        cache.insert_events(&batch(5, 5, events.clone())).await.unwrap();
        cache.insert_events(&batch(5, 5, events)).await.unwrap();

        let cached = cache.get_events(&query(5, 5)).await.unwrap().unwrap();
        assert_eq!(cached.events.len(), 1);
    }

    #[tokio::test]
    async fn test_get_returns_covered_prefix_only() {
        let cache = setup().await;
        cache.insert_events(&batch(0, 5, vec![make_event(4, 0)])).await.unwrap();

        let cached = cache.get_events(&query(3, 10)).await.unwrap().unwrap();
        assert_eq!(cached.from_block, 3);
        assert_eq!(cached.to_block, 5);
        assert_eq!(cached.events.len(), 1);
    }

    #[tokio::test]
    async fn test_get_misses_when_start_is_uncovered() {
        let cache = setup().await;
        cache.insert_events(&batch(5, 10, vec![])).await.unwrap();

        assert!(cache.get_events(&query(0, 10)).await.unwrap().is_none());
        assert!(cache.get_events(&query(11, 12)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_range_is_recorded() {
        let cache = setup().await;
        cache.insert_events(&batch(1, 5, vec![])).await.unwrap();

        let cached = cache.get_events(&query(1, 5)).await.unwrap().unwrap();
        assert_eq!(cached.from_block, 1);
        assert_eq!(cached.to_block, 5);
        assert!(cached.events.is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_ranges_merge() {
        let cache = setup().await;
        cache.insert_events(&batch(1, 2, vec![])).await.unwrap();
        cache.insert_events(&batch(2, 4, vec![])).await.unwrap();

        assert_eq!(stored_ranges(&cache).await, vec![(1, 4)]);
    }

    #[tokio::test]
    async fn test_adjacent_ranges_merge() {
        let cache = setup().await;
        cache.insert_events(&batch(1, 2, vec![])).await.unwrap();
        cache.insert_events(&batch(3, 4, vec![])).await.unwrap();

        assert_eq!(stored_ranges(&cache).await, vec![(1, 4)]);
    }

    #[tokio::test]
    async fn test_disjoint_ranges_stay_disjoint() {
        let cache = setup().await;
        cache.insert_events(&batch(1, 2, vec![])).await.unwrap();
        cache.insert_events(&batch(10, 12, vec![])).await.unwrap();

        assert_eq!(stored_ranges(&cache).await, vec![(1, 2), (10, 12)]);
    }

    #[tokio::test]
    async fn test_bridge_insert_merges_everything_it_touches() {
        let cache = setup().await;
        cache.insert_events(&batch(0, 2, vec![])).await.unwrap();
        cache.insert_events(&batch(8, 10, vec![])).await.unwrap();
        cache.insert_events(&batch(3, 7, vec![])).await.unwrap();

        assert_eq!(stored_ranges(&cache).await, vec![(0, 10)]);
    }

    #[tokio::test]
    async fn test_inverted_range_is_rejected() {
        let cache = setup().await;
        let err = cache.insert_events(&batch(5, 4, vec![])).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRange { from: 5, to: 4 }));
    }

    #[tokio::test]
    async fn test_block_metadata_round_trip() {
        let cache = setup().await;
        let header = BlockHeader {
            number: 7,
            hash: B256::repeat_byte(0x77),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };

        assert!(cache.get_block(CHAIN, 7).await.unwrap().is_none());
        cache.insert_block(CHAIN, &header).await.unwrap();
        cache.insert_block(CHAIN, &header).await.unwrap();
        assert_eq!(cache.get_block(CHAIN, 7).await.unwrap(), Some(header));
    }

    #[tokio::test]
    async fn test_contract_read_round_trip() {
        let cache = setup().await;
        let call = ContractCall {
            address: test_address(),
            data: Bytes::from(vec![0xde, 0xad]),
            function_name: "balanceOf".to_string(),
            block_number: 3,
        };
        let result = Bytes::from(vec![0x01; 32]);

        assert!(cache.get_contract_read(CHAIN, &call).await.unwrap().is_none());
        cache.insert_contract_read(CHAIN, &call, &result).await.unwrap();
        cache.insert_contract_read(CHAIN, &call, &result).await.unwrap();
        assert_eq!(
            cache.get_contract_read(CHAIN, &call).await.unwrap(),
            Some(result)
        );
    }
}
