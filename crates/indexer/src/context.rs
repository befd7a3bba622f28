//! Handler plumbing: the argument bundle passed to event handlers and the
//! operations they can use to reach back into the engine.
//!
//! The bundle is an explicit value over shared service handles; handlers
//! hold no hidden engine state. Subscription changes requested by a
//! handler are collected here and applied by the processor once the
//! handler returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alloy::primitives::{Address, Bytes};
use futures::future::BoxFuture;

use logtide_common::error::IndexerError;
use logtide_common::types::{BlockHeader, ContractCall, Event, ToBlock};
use logtide_store::LogCache;

use crate::rpc::EthRpc;

pub type HandlerResult = anyhow::Result<()>;

/// An event handler: an async closure over the handler context.
pub type EventHandler<C> =
    Arc<dyn Fn(EventContext<C>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Registration request recorded by [`EventContext::subscribe_to_contract`].
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub contract_name: String,
    pub address: Address,
    pub from_block: u64,
    pub to_block: ToBlock,
}

/// Subscription-set mutations requested during a handler invocation.
#[derive(Debug, Default)]
pub(crate) struct PendingChanges {
    pub subscribe: Vec<SubscribeRequest>,
    pub unsubscribe: Vec<Address>,
}

pub(crate) struct ContextServices {
    pub rpc: Arc<dyn EthRpc>,
    pub cache: Option<Arc<dyn LogCache>>,
    pub chain_id: u64,
    changes: Mutex<PendingChanges>,
}

impl ContextServices {
    pub fn new(rpc: Arc<dyn EthRpc>, cache: Option<Arc<dyn LogCache>>, chain_id: u64) -> Self {
        Self {
            rpc,
            cache,
            chain_id,
            changes: Mutex::new(PendingChanges::default()),
        }
    }

    fn changes(&self) -> MutexGuard<'_, PendingChanges> {
        self.changes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn take_changes(&self) -> PendingChanges {
        std::mem::take(&mut *self.changes())
    }
}

/// Argument bundle handed to each handler invocation.
#[derive(Clone)]
pub struct EventContext<C> {
    pub event: Event,
    pub chain_id: u64,
    pub context: C,
    services: Arc<ContextServices>,
}

impl<C> EventContext<C> {
    pub(crate) fn new(
        event: Event,
        context: C,
        services: Arc<ContextServices>,
    ) -> Self {
        Self {
            event,
            chain_id: services.chain_id,
            context,
            services,
        }
    }

    /// Call a read-only contract function, pinned at this event's block.
    ///
    /// With a cache attached the cached result short-circuits the RPC;
    /// misses are written back.
    pub async fn read_contract(
        &self,
        address: Address,
        data: Bytes,
        function_name: &str,
    ) -> Result<Bytes, IndexerError> {
        let call = ContractCall {
            address,
            data,
            function_name: function_name.to_string(),
            block_number: self.event.block_number,
        };

        if let Some(cache) = &self.services.cache
            && let Some(cached) = cache.get_contract_read(self.chain_id, &call).await?
        {
            return Ok(cached);
        }

        let result = self.services.rpc.read_contract(&call).await?;
        if let Some(cache) = &self.services.cache {
            cache.insert_contract_read(self.chain_id, &call, &result).await?;
        }
        Ok(result)
    }

    /// Block metadata for `number`, cache first.
    pub async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError> {
        if let Some(cache) = &self.services.cache
            && let Some(header) = cache.get_block(self.chain_id, number).await?
        {
            return Ok(Some(header));
        }

        let Some(header) = self.services.rpc.get_block_by_number(number).await? else {
            return Ok(None);
        };
        if let Some(cache) = &self.services.cache {
            cache.insert_block(self.chain_id, &header).await?;
        }
        Ok(Some(header))
    }

    /// Subscribe `address` to `contract_name`'s handled events, starting
    /// at this event's block. Applied once the handler returns.
    pub fn subscribe_to_contract(&self, contract_name: impl Into<String>, address: Address) {
        self.subscribe_to_contract_from(
            contract_name,
            address,
            self.event.block_number,
            ToBlock::Latest,
        );
    }

    /// Like [`Self::subscribe_to_contract`] with an explicit window, for
    /// contracts whose history starts before the triggering event.
    pub fn subscribe_to_contract_from(
        &self,
        contract_name: impl Into<String>,
        address: Address,
        from_block: u64,
        to_block: ToBlock,
    ) {
        self.services.changes().subscribe.push(SubscribeRequest {
            contract_name: contract_name.into(),
            address,
            from_block,
            to_block,
        });
    }

    /// Remove every subscription on `address`. Applied once the handler
    /// returns.
    pub fn unsubscribe_from_contract(&self, address: Address) {
        self.services.changes().unsubscribe.push(address);
    }
}
