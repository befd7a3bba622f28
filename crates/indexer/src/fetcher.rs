//! Log fetch execution with adaptive range splitting.
//!
//! A range-too-wide response from the provider doubles the split factor
//! (halving the attempted interval); each success lets the interval widen
//! again. Every fetched window is recorded in the cache per address, even
//! when it held no matching logs, so later runs skip it entirely.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::Address;

use logtide_common::error::{IndexerError, RpcError};
use logtide_common::types::{Event, Log, Subscription, subscription_id};
use logtide_store::{EventBatch, LogCache};

use crate::planner::FetchGroup;
use crate::queue::EventQueue;
use crate::rpc::{EthRpc, LogFilter};

/// Execute every planned request group, pushing decoded events onto the
/// queue and recording coverage in the cache.
pub async fn execute(
    groups: &[FetchGroup],
    chain_id: u64,
    subscriptions: &HashMap<String, Subscription>,
    rpc: &Arc<dyn EthRpc>,
    cache: Option<&Arc<dyn LogCache>>,
    queue: &mut EventQueue,
) -> Result<(), IndexerError> {
    for group in groups {
        fetch_group(group, chain_id, subscriptions, rpc, cache, queue).await?;
    }
    Ok(())
}

async fn fetch_group(
    group: &FetchGroup,
    chain_id: u64,
    subscriptions: &HashMap<String, Subscription>,
    rpc: &Arc<dyn EthRpc>,
    cache: Option<&Arc<dyn LogCache>>,
    queue: &mut EventQueue,
) -> Result<(), IndexerError> {
    let mut events_by_address: HashMap<Address, Vec<Event>> = group
        .addresses
        .iter()
        .map(|address| (*address, Vec::new()))
        .collect();

    // Split factor: 1 means the whole remaining range in one request.
    let mut steps: u64 = 1;
    let mut cursor = group.from_block;
    while cursor <= group.to_block {
        let span = group.to_block - cursor + 1;
        let chunk = span.div_ceil(steps);
        let to = group.to_block.min(cursor + chunk - 1);

        let filter = LogFilter {
            addresses: group.addresses.clone(),
            topics: Vec::new(),
            from_block: cursor,
            to_block: to,
        };
        match rpc.get_logs(&filter).await {
            Ok(logs) => {
                for log in logs {
                    if let Some(event) = decode_log(chain_id, subscriptions, &log)? {
                        if let Some(bucket) = events_by_address.get_mut(&event.address) {
                            bucket.push(event.clone());
                        }
                        queue.push(event);
                    }
                }
                cursor = to + 1;
                steps = (steps / 2).max(1);
            }
            Err(RpcError::RangeTooWide(message)) if chunk > 1 => {
                steps = steps.saturating_mul(2);
                tracing::debug!(
                    from_block = cursor,
                    to_block = to,
                    steps,
                    message,
                    "Log range too wide, splitting"
                );
            }
            Err(err) => return Err(err.into()),
        }
    }

    if let Some(cache) = cache {
        for (address, events) in events_by_address {
            cache
                .insert_events(&EventBatch {
                    chain_id,
                    address,
                    from_block: group.from_block,
                    to_block: group.to_block,
                    events,
                })
                .await?;
        }
    }
    Ok(())
}

fn decode_log(
    chain_id: u64,
    subscriptions: &HashMap<String, Subscription>,
    log: &Log,
) -> Result<Option<Event>, IndexerError> {
    // Pending blocks are out of scope; a log without a position is fatal.
    let (Some(block_number), Some(log_index), Some(transaction_hash)) =
        (log.block_number, log.log_index, log.transaction_hash)
    else {
        return Err(IndexerError::PendingBlock);
    };
    let Some(topic0) = log.topics.first().copied() else {
        return Ok(None);
    };

    let id = subscription_id(chain_id, log.address, topic0);
    let Some(sub) = subscriptions.get(&id) else {
        // No subscription for this topic on this address.
        return Ok(None);
    };
    if !sub.window_contains(block_number) {
        return Ok(None);
    }

    let params = match logtide_decoders::decode_event(&sub.abi, log) {
        Ok(params) => params,
        Err(err) => {
            tracing::debug!(
                subscription_id = %sub.id,
                block_number,
                log_index,
                error = %err,
                "Skipping undecodable log"
            );
            return Ok(None);
        }
    };

    Ok(Some(Event {
        name: sub.event_name.clone(),
        params,
        address: log.address,
        topic0,
        transaction_hash,
        block_number,
        log_index,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::json_abi;
    use alloy::primitives::{B256, Bytes};
    use logtide_common::types::ToBlock;

    fn make_sub(from_block: u64, to_block: ToBlock) -> Subscription {
        let abi = json_abi::Event::parse("event Ping()").unwrap();
        Subscription::new(1, "Pinger", Address::repeat_byte(0x01), abi, from_block, to_block)
    }

    fn make_log(sub: &Subscription, block_number: u64) -> Log {
        Log {
            address: sub.contract_address,
            topics: vec![sub.topic0],
            data: Bytes::new(),
            block_number: Some(block_number),
            log_index: Some(0),
            transaction_index: Some(0),
            transaction_hash: Some(B256::repeat_byte(0x55)),
            block_hash: Some(B256::repeat_byte(0x66)),
        }
    }

    #[test]
    fn test_decode_log_builds_an_event() {
        let sub = make_sub(0, ToBlock::Latest);
        let subs = HashMap::from([(sub.id.clone(), sub.clone())]);

        let event = decode_log(1, &subs, &make_log(&sub, 7)).unwrap().unwrap();
        assert_eq!(event.name, "Ping");
        assert_eq!(event.position(), (7, 0));
        assert_eq!(event.address, sub.contract_address);
    }

    #[test]
    fn test_pending_log_is_fatal() {
        let sub = make_sub(0, ToBlock::Latest);
        let subs = HashMap::from([(sub.id.clone(), sub.clone())]);
        let mut log = make_log(&sub, 7);
        log.block_number = None;

        let err = decode_log(1, &subs, &log).unwrap_err();
        assert!(matches!(err, IndexerError::PendingBlock));
    }

    #[test]
    fn test_unknown_topic_is_skipped() {
        let sub = make_sub(0, ToBlock::Latest);
        let subs = HashMap::from([(sub.id.clone(), sub.clone())]);
        let mut log = make_log(&sub, 7);
        log.topics = vec![B256::repeat_byte(0xFF)];

        assert!(decode_log(1, &subs, &log).unwrap().is_none());
    }

    #[test]
    fn test_log_outside_the_window_is_skipped() {
        let sub = make_sub(5, ToBlock::Block(9));
        let subs = HashMap::from([(sub.id.clone(), sub.clone())]);

        assert!(decode_log(1, &subs, &make_log(&sub, 4)).unwrap().is_none());
        assert!(decode_log(1, &subs, &make_log(&sub, 10)).unwrap().is_none());
        assert!(decode_log(1, &subs, &make_log(&sub, 9)).unwrap().is_some());
    }
}
