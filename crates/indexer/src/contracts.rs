//! Contract configuration: ABI event fragments, static subscriptions and
//! the handler registry.
//!
//! Handlers live in a two-level map keyed by contract name then event
//! name, built once at registration. Persisted subscription rows stay
//! data-only and are rehydrated against this registry.

use std::collections::HashMap;

use alloy::json_abi;
use alloy::primitives::Address;

use logtide_common::error::IndexerError;
use logtide_common::types::{Subscription, ToBlock};
use logtide_store::StoredSubscription;

use crate::context::EventHandler;

/// An address to index at startup.
#[derive(Debug, Clone)]
pub struct StaticSubscription {
    pub address: Address,
    pub from_block: u64,
    pub to_block: ToBlock,
}

/// Configuration of one contract: its event fragments, the addresses to
/// watch at startup, and the handlers keyed by event name.
pub struct ContractConfig<C> {
    pub events: Vec<json_abi::Event>,
    pub subscriptions: Vec<StaticSubscription>,
    pub handlers: HashMap<String, EventHandler<C>>,
}

impl<C> ContractConfig<C> {
    pub fn new(events: Vec<json_abi::Event>) -> Self {
        Self {
            events,
            subscriptions: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Watch `address` from `from_block` at startup.
    pub fn subscribe(mut self, address: Address, from_block: u64, to_block: ToBlock) -> Self {
        self.subscriptions.push(StaticSubscription {
            address,
            from_block,
            to_block,
        });
        self
    }

    /// Register a handler for one of the contract's events.
    pub fn on(mut self, event_name: impl Into<String>, handler: EventHandler<C>) -> Self {
        self.handlers.insert(event_name.into(), handler);
        self
    }
}

/// All configured contracts, keyed by name.
pub struct ContractRegistry<C> {
    contracts: HashMap<String, ContractConfig<C>>,
}

impl<C> ContractRegistry<C> {
    pub fn new(contracts: HashMap<String, ContractConfig<C>>) -> Self {
        Self { contracts }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContractConfig<C>)> {
        self.contracts.iter()
    }

    pub fn handler(&self, contract_name: &str, event_name: &str) -> Option<EventHandler<C>> {
        self.contracts
            .get(contract_name)?
            .handlers
            .get(event_name)
            .cloned()
    }

    /// Build the subscriptions for `address` under `contract_name`: one per
    /// ABI event with a registered handler.
    pub fn subscriptions_for(
        &self,
        chain_id: u64,
        contract_name: &str,
        address: Address,
        from_block: u64,
        to_block: ToBlock,
    ) -> Result<Vec<Subscription>, IndexerError> {
        let contract = self
            .contracts
            .get(contract_name)
            .ok_or_else(|| IndexerError::UnknownContract(contract_name.to_string()))?;

        let mut subscriptions = Vec::new();
        for event in &contract.events {
            if !contract.handlers.contains_key(&event.name) {
                continue;
            }
            subscriptions.push(Subscription::new(
                chain_id,
                contract_name,
                address,
                event.clone(),
                from_block,
                to_block,
            ));
        }
        Ok(subscriptions)
    }

    /// Reattach a persisted row to its ABI fragment. The id's topic0 picks
    /// the event; `None` means the contract or event is no longer
    /// configured.
    pub fn rehydrate(&self, row: &StoredSubscription) -> Option<Subscription> {
        let contract = self.contracts.get(&row.contract_name)?;
        let topic0 = row.topic0()?;
        let abi = contract
            .events
            .iter()
            .find(|event| event.selector() == topic0)?
            .clone();

        let mut sub = Subscription::new(
            row.chain_id,
            row.contract_name.clone(),
            row.contract_address,
            abi,
            row.from_block,
            row.to_block,
        );
        sub.indexed_to_block = row.indexed_to_block;
        sub.indexed_to_log_index = row.indexed_to_log_index;
        // Fetch coverage is not persisted; everything up to the cursor is
        // known to be either cached or delivered.
        sub.fetched_to_block = row.indexed_to_block.max(sub.fetched_to_block);
        Some(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn noop_handler() -> EventHandler<()> {
        Arc::new(|_ctx| Box::pin(async { Ok(()) }))
    }

    fn registry() -> ContractRegistry<()> {
        let events = vec![
            json_abi::Event::parse("event Increment()").unwrap(),
            json_abi::Event::parse("event Decrement()").unwrap(),
        ];
        let config = ContractConfig::new(events)
            .subscribe(Address::repeat_byte(0x01), 0, ToBlock::Latest)
            .on("Increment", noop_handler());
        ContractRegistry::new(HashMap::from([("Counter".to_string(), config)]))
    }

    #[test]
    fn test_subscriptions_only_cover_handled_events() {
        let registry = registry();
        let subs = registry
            .subscriptions_for(1, "Counter", Address::repeat_byte(0x02), 5, ToBlock::Latest)
            .unwrap();

        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].event_name, "Increment");
        assert_eq!(subs[0].from_block, 5);
    }

    #[test]
    fn test_unknown_contract_is_an_error() {
        let registry = registry();
        let err = registry
            .subscriptions_for(1, "Nope", Address::repeat_byte(0x02), 0, ToBlock::Latest)
            .unwrap_err();
        assert!(matches!(err, IndexerError::UnknownContract(_)));
    }

    #[test]
    fn test_rehydrate_restores_cursor() {
        let registry = registry();
        let subs = registry
            .subscriptions_for(1, "Counter", Address::repeat_byte(0x02), 0, ToBlock::Latest)
            .unwrap();
        let mut row = StoredSubscription::from(&subs[0]);
        row.indexed_to_block = 42;
        row.indexed_to_log_index = 3;

        let restored = registry.rehydrate(&row).unwrap();
        assert_eq!(restored.id, subs[0].id);
        assert_eq!(restored.event_name, "Increment");
        assert_eq!(restored.indexed_to_block, 42);
        assert_eq!(restored.indexed_to_log_index, 3);
        assert_eq!(restored.fetched_to_block, 42);
    }

    #[test]
    fn test_rehydrate_skips_unconfigured_contract() {
        let registry = registry();
        let subs = registry
            .subscriptions_for(1, "Counter", Address::repeat_byte(0x02), 0, ToBlock::Latest)
            .unwrap();
        let mut row = StoredSubscription::from(&subs[0]);
        row.contract_name = "Gone".to_string();

        assert!(registry.rehydrate(&row).is_none());
    }
}
