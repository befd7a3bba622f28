use alloy::primitives::{Address, B256, Bytes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound of a subscription's block window: a fixed block, or the
/// moving chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToBlock {
    Latest,
    Block(u64),
}

impl ToBlock {
    /// Effective window end given the current target block.
    pub fn cap(&self, target: u64) -> u64 {
        match self {
            ToBlock::Latest => target,
            ToBlock::Block(b) => (*b).min(target),
        }
    }

    /// Whether `block` falls at or below this bound.
    pub fn contains(&self, block: u64) -> bool {
        match self {
            ToBlock::Latest => true,
            ToBlock::Block(b) => block <= *b,
        }
    }
}

impl std::fmt::Display for ToBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToBlock::Latest => write!(f, "latest"),
            ToBlock::Block(b) => write!(f, "{b}"),
        }
    }
}

impl std::str::FromStr for ToBlock {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "latest" {
            Ok(ToBlock::Latest)
        } else {
            s.parse::<u64>().map(ToBlock::Block)
        }
    }
}

/// A decoded on-chain event, ready for dispatch and for persistence in the
/// log cache.
///
/// `params` is a JSON object keyed by ABI parameter name; unbounded
/// integers are stored with the tagged encoding from `logtide_decoders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub params: serde_json::Value,
    pub address: Address,
    pub topic0: B256,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub log_index: u64,
}

impl Event {
    /// Chain position of the event. Orders and identifies events within a
    /// single chain.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.position() == other.position()
    }
}

impl Eq for Event {}

/// Raw log entry as returned by `eth_getLogs`.
///
/// Position fields stay optional because providers return null for logs
/// from pending blocks; the fetcher treats a missing value as fatal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
    pub transaction_index: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub block_hash: Option<B256>,
}

/// Block metadata kept in the cache for handlers that ask for timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub timestamp: DateTime<Utc>,
}

/// A contract call pinned to a block, as issued by handler contexts.
#[derive(Debug, Clone)]
pub struct ContractCall {
    pub address: Address,
    pub data: Bytes,
    pub function_name: String,
    pub block_number: u64,
}

/// Canonical subscription id: `<chainId>-<address>-<topic0>`.
pub fn subscription_id(chain_id: u64, address: Address, topic0: B256) -> String {
    format!("{chain_id}-{address:#x}-{topic0:#x}")
}

/// A (contract, address, event) triple with its delivery cursor.
///
/// Cursor fields are signed so the initial state `from_block - 1` stays
/// representable when `from_block` is zero.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub chain_id: u64,
    pub abi: alloy::json_abi::Event,
    pub contract_name: String,
    pub contract_address: Address,
    pub event_name: String,
    pub topic0: B256,
    pub from_block: u64,
    pub to_block: ToBlock,
    /// Highest block whose logs have been fetched for this subscription.
    pub fetched_to_block: i64,
    /// Block of the last dispatched event.
    pub indexed_to_block: i64,
    /// Log index of the last dispatched event within `indexed_to_block`.
    pub indexed_to_log_index: u64,
}

impl Subscription {
    pub fn new(
        chain_id: u64,
        contract_name: impl Into<String>,
        contract_address: Address,
        abi: alloy::json_abi::Event,
        from_block: u64,
        to_block: ToBlock,
    ) -> Self {
        let topic0 = abi.selector();
        let event_name = abi.name.clone();
        Self {
            id: subscription_id(chain_id, contract_address, topic0),
            chain_id,
            abi,
            contract_name: contract_name.into(),
            contract_address,
            event_name,
            topic0,
            from_block,
            to_block,
            fetched_to_block: from_block as i64 - 1,
            indexed_to_block: from_block as i64 - 1,
            indexed_to_log_index: 0,
        }
    }

    /// Dispatch guard: an event is delivered iff it sits at or past the
    /// cursor position.
    pub fn should_dispatch(&self, block_number: u64, log_index: u64) -> bool {
        let block = block_number as i64;
        block > self.indexed_to_block
            || (block == self.indexed_to_block && log_index >= self.indexed_to_log_index)
    }

    pub fn advance_cursor(&mut self, block_number: u64, log_index: u64) {
        self.indexed_to_block = block_number as i64;
        self.indexed_to_log_index = log_index;
    }

    /// First block the next fetch must cover.
    pub fn next_fetch_block(&self) -> u64 {
        let resume = self.fetched_to_block.max(self.indexed_to_block) + 1;
        (self.from_block as i64).max(resume).max(0) as u64
    }

    /// Whether `block` lies inside the configured `[from_block, to_block]`
    /// window.
    pub fn window_contains(&self, block: u64) -> bool {
        block >= self.from_block && self.to_block.contains(block)
    }
}
