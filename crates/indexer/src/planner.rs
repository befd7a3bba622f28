//! Fetch planning: turns the subscription map and a target block into the
//! minimal set of `eth_getLogs` requests.
//!
//! Subscriptions sharing an identical outstanding window share one
//! request; cache-covered prefixes never reach the RPC at all.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use alloy::primitives::Address;

use logtide_common::error::IndexerError;
use logtide_common::types::Subscription;
use logtide_store::{EventQuery, LogCache};

use crate::queue::EventQueue;

/// Maximum addresses bundled into one `eth_getLogs` request.
pub const MAX_ADDRESSES_PER_REQUEST: usize = 25;

/// One planned `eth_getLogs` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchGroup {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
}

/// A subscription with outstanding work in the current plan, and the end
/// of its window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchedSubscription {
    pub id: String,
    pub window_end: u64,
}

#[derive(Debug, Default)]
pub struct FetchPlan {
    pub groups: Vec<FetchGroup>,
    pub touched: Vec<TouchedSubscription>,
    /// Events served straight from the cache.
    pub cached_events: usize,
}

/// Compute the fetch plan for one poll iteration. Cache-covered events are
/// pushed onto the queue as a side effect.
pub async fn plan(
    subscriptions: &HashMap<String, Subscription>,
    target_block: u64,
    cache: Option<&Arc<dyn LogCache>>,
    queue: &mut EventQueue,
) -> Result<FetchPlan, IndexerError> {
    let mut plan = FetchPlan::default();
    // BTreeMap keeps group order deterministic across polls.
    let mut buckets: BTreeMap<(u64, u64), Vec<Address>> = BTreeMap::new();

    for sub in subscriptions.values() {
        if sub.indexed_to_block >= target_block as i64 {
            continue;
        }
        let mut from = sub.next_fetch_block();
        let to = sub.to_block.cap(target_block);
        if from > to {
            continue;
        }

        plan.touched.push(TouchedSubscription {
            id: sub.id.clone(),
            window_end: to,
        });

        // Cache short-circuit: a covered prefix goes straight to the queue
        // and the window shrinks to whatever remains.
        if let Some(cache) = cache {
            let query = EventQuery {
                chain_id: sub.chain_id,
                address: sub.contract_address,
                topic0: sub.topic0,
                from_block: from,
                to_block: to,
            };
            if let Some(cached) = cache.get_events(&query).await? {
                plan.cached_events += cached.events.len();
                for event in cached.events {
                    queue.push(event);
                }
                from = cached.to_block + 1;
                if from > to {
                    continue;
                }
            }
        }

        let bucket = buckets.entry((from, to)).or_default();
        if !bucket.contains(&sub.contract_address) {
            bucket.push(sub.contract_address);
        }
    }

    for ((from_block, to_block), addresses) in buckets {
        for chunk in addresses.chunks(MAX_ADDRESSES_PER_REQUEST) {
            plan.groups.push(FetchGroup {
                from_block,
                to_block,
                addresses: chunk.to_vec(),
            });
        }
    }

    if !plan.groups.is_empty() || plan.cached_events > 0 {
        tracing::debug!(
            target_block,
            groups = plan.groups.len(),
            cached_events = plan.cached_events,
            "Fetch plan ready"
        );
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::json_abi;
    use alloy::primitives::B256;
    use logtide_common::types::ToBlock;
    use logtide_store::{EventBatch, SqliteCache};

    fn make_sub(seed: u8, from_block: u64, to_block: ToBlock) -> Subscription {
        let abi = json_abi::Event::parse("event Ping()").unwrap();
        Subscription::new(1, "Pinger", Address::repeat_byte(seed), abi, from_block, to_block)
    }

    fn subs_map(subs: Vec<Subscription>) -> HashMap<String, Subscription> {
        subs.into_iter().map(|s| (s.id.clone(), s)).collect()
    }

    #[tokio::test]
    async fn test_identical_windows_share_one_group() {
        let subs = subs_map(vec![
            make_sub(0x01, 0, ToBlock::Latest),
            make_sub(0x02, 0, ToBlock::Latest),
        ]);
        let mut queue = EventQueue::new();

        let plan = plan(&subs, 10, None, &mut queue).await.unwrap();
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].from_block, 0);
        assert_eq!(plan.groups[0].to_block, 10);
        assert_eq!(plan.groups[0].addresses.len(), 2);
        assert_eq!(plan.touched.len(), 2);
    }

    #[tokio::test]
    async fn test_distinct_windows_get_distinct_groups() {
        let subs = subs_map(vec![
            make_sub(0x01, 0, ToBlock::Latest),
            make_sub(0x02, 5, ToBlock::Latest),
        ]);
        let mut queue = EventQueue::new();

        let plan = plan(&subs, 10, None, &mut queue).await.unwrap();
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].from_block, 0);
        assert_eq!(plan.groups[1].from_block, 5);
    }

    #[tokio::test]
    async fn test_addresses_chunked_per_request() {
        let subs = subs_map((0..30).map(|i| make_sub(i as u8 + 1, 0, ToBlock::Latest)).collect());
        let mut queue = EventQueue::new();

        let plan = plan(&subs, 10, None, &mut queue).await.unwrap();
        assert_eq!(plan.groups.len(), 2);
        let mut sizes: Vec<usize> = plan.groups.iter().map(|g| g.addresses.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![5, 25]);
    }

    #[tokio::test]
    async fn test_satisfied_subscriptions_are_skipped() {
        let mut caught_up = make_sub(0x01, 0, ToBlock::Latest);
        caught_up.indexed_to_block = 10;
        let mut future = make_sub(0x02, 50, ToBlock::Latest);
        future.fetched_to_block = 49;
        let subs = subs_map(vec![caught_up, future]);
        let mut queue = EventQueue::new();

        let plan = plan(&subs, 10, None, &mut queue).await.unwrap();
        assert!(plan.groups.is_empty());
        assert!(plan.touched.is_empty());
    }

    #[tokio::test]
    async fn test_window_capped_by_to_block() {
        let subs = subs_map(vec![make_sub(0x01, 2, ToBlock::Block(4))]);
        let mut queue = EventQueue::new();

        let plan = plan(&subs, 10, None, &mut queue).await.unwrap();
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].from_block, 2);
        assert_eq!(plan.groups[0].to_block, 4);
        assert_eq!(plan.touched[0].window_end, 4);
    }

    #[tokio::test]
    async fn test_cache_prefix_shrinks_the_window() {
        let sub = make_sub(0x01, 0, ToBlock::Latest);
        let cache = SqliteCache::in_memory().await.unwrap();
        cache.init().await.unwrap();
        cache
            .insert_events(&EventBatch {
                chain_id: 1,
                address: sub.contract_address,
                from_block: 0,
                to_block: 6,
                events: vec![logtide_common::types::Event {
                    name: "Ping".to_string(),
                    params: serde_json::json!({}),
                    address: sub.contract_address,
                    topic0: sub.topic0,
                    transaction_hash: B256::repeat_byte(0x09),
                    block_number: 3,
                    log_index: 0,
                }],
            })
            .await
            .unwrap();

        let cache: Arc<dyn LogCache> = Arc::new(cache);
        let subs = subs_map(vec![sub]);
        let mut queue = EventQueue::new();

        let plan = plan(&subs, 10, Some(&cache), &mut queue).await.unwrap();
        assert_eq!(plan.cached_events, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].from_block, 7);
        assert_eq!(plan.groups[0].to_block, 10);
    }

    #[tokio::test]
    async fn test_fully_cached_window_needs_no_rpc() {
        let sub = make_sub(0x01, 0, ToBlock::Block(5));
        let cache = SqliteCache::in_memory().await.unwrap();
        cache.init().await.unwrap();
        cache
            .insert_events(&EventBatch {
                chain_id: 1,
                address: sub.contract_address,
                from_block: 0,
                to_block: 5,
                events: vec![],
            })
            .await
            .unwrap();

        let cache: Arc<dyn LogCache> = Arc::new(cache);
        let subs = subs_map(vec![sub]);
        let mut queue = EventQueue::new();

        let plan = plan(&subs, 10, Some(&cache), &mut queue).await.unwrap();
        assert!(plan.groups.is_empty());
        assert_eq!(plan.touched.len(), 1, "cache-satisfied windows still count as touched");
    }
}
