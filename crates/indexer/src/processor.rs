//! Queue drain: handler dispatch, cursor advancement and application of
//! subscription-set changes requested by handlers.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::Address;
use tokio::sync::broadcast;

use logtide_common::error::IndexerError;
use logtide_common::types::{Subscription, subscription_id};
use logtide_store::{LogCache, StoredSubscription, SubscriptionStore};

use crate::context::{ContextServices, EventContext, EventHandler, SubscribeRequest};
use crate::contracts::ContractRegistry;
use crate::core::Notification;
use crate::queue::EventQueue;
use crate::rpc::EthRpc;

pub(crate) struct ProcessOutcome {
    /// A handler registered new subscriptions; the poll loop must re-plan
    /// fetching before draining further, because the new subscriptions may
    /// cover blocks already behind the cursor.
    pub has_new_subscriptions: bool,
    pub dispatched: usize,
}

pub(crate) struct Processor<'a, C> {
    pub chain_id: u64,
    pub target_block: u64,
    pub context: C,
    pub registry: &'a ContractRegistry<C>,
    pub rpc: &'a Arc<dyn EthRpc>,
    pub cache: Option<&'a Arc<dyn LogCache>>,
    pub store: Option<&'a Arc<dyn SubscriptionStore>>,
    pub on_event: Option<&'a EventHandler<C>>,
    pub notifier: &'a broadcast::Sender<Notification>,
    pub last_progress_block: &'a mut Option<u64>,
}

impl<C: Clone + Send + Sync + 'static> Processor<'_, C> {
    /// Drain the queue in chain order, one handler at a time.
    pub async fn drain(
        &mut self,
        queue: &mut EventQueue,
        subscriptions: &mut HashMap<String, Subscription>,
    ) -> Result<ProcessOutcome, IndexerError> {
        let mut outcome = ProcessOutcome {
            has_new_subscriptions: false,
            dispatched: 0,
        };

        while let Some(event) = queue.pop() {
            let id = subscription_id(self.chain_id, event.address, event.topic0);
            let (contract_name, event_name) = match subscriptions.get(&id) {
                Some(sub) if sub.should_dispatch(event.block_number, event.log_index) => {
                    (sub.contract_name.clone(), sub.event_name.clone())
                }
                Some(_) => {
                    tracing::debug!(
                        subscription_id = %id,
                        block_number = event.block_number,
                        log_index = event.log_index,
                        "Dropping already-processed event"
                    );
                    continue;
                }
                None => {
                    tracing::debug!(
                        subscription_id = %id,
                        "Dropping event for removed subscription"
                    );
                    continue;
                }
            };

            let services = Arc::new(ContextServices::new(
                self.rpc.clone(),
                self.cache.cloned(),
                self.chain_id,
            ));
            let ctx = EventContext::new(event.clone(), self.context.clone(), services.clone());

            if let Some(handler) = self.registry.handler(&contract_name, &event_name) {
                handler(ctx.clone()).await.map_err(|source| {
                    tracing::error!(
                        subscription_id = %id,
                        block_number = event.block_number,
                        log_index = event.log_index,
                        error = %source,
                        "Event handler failed"
                    );
                    IndexerError::Handler {
                        event: event_name.clone(),
                        block: event.block_number,
                        source,
                    }
                })?;
            }
            if let Some(on_event) = self.on_event {
                on_event(ctx).await.map_err(|source| {
                    tracing::error!(
                        subscription_id = %id,
                        block_number = event.block_number,
                        error = %source,
                        "Global event handler failed"
                    );
                    IndexerError::Handler {
                        event: event_name.clone(),
                        block: event.block_number,
                        source,
                    }
                })?;
            }
            outcome.dispatched += 1;

            // Advance the cursor in memory and in the store.
            if let Some(sub) = subscriptions.get_mut(&id) {
                sub.advance_cursor(event.block_number, event.log_index);
                if let Some(store) = self.store {
                    store
                        .update_cursor(&id, sub.indexed_to_block, sub.indexed_to_log_index)
                        .await?;
                }
            }

            if self.last_progress_block.is_none_or(|b| event.block_number > b) {
                *self.last_progress_block = Some(event.block_number);
                let _ = self.notifier.send(Notification::Progress {
                    current_block: event.block_number,
                    target_block: self.target_block,
                    pending_events: queue.len(),
                });
            }
            let _ = self.notifier.send(Notification::Event(event));

            // Apply the subscription changes this handler requested.
            let changes = services.take_changes();
            for address in changes.unsubscribe {
                self.remove_address(subscriptions, address).await?;
            }
            if !changes.subscribe.is_empty()
                && self.register_requests(subscriptions, changes.subscribe).await?
            {
                outcome.has_new_subscriptions = true;
                tracing::debug!("Subscription set grew during handler execution, replanning");
                break;
            }
        }

        Ok(outcome)
    }

    async fn register_requests(
        &self,
        subscriptions: &mut HashMap<String, Subscription>,
        requests: Vec<SubscribeRequest>,
    ) -> Result<bool, IndexerError> {
        let mut added = false;
        for request in requests {
            let new_subs = self.registry.subscriptions_for(
                self.chain_id,
                &request.contract_name,
                request.address,
                request.from_block,
                request.to_block,
            )?;
            for sub in new_subs {
                if subscriptions.contains_key(&sub.id) {
                    continue;
                }
                if let Some(store) = self.store {
                    store.save(&StoredSubscription::from(&sub)).await?;
                }
                tracing::info!(
                    subscription_id = %sub.id,
                    contract = %request.contract_name,
                    from_block = sub.from_block,
                    "Subscribed contract"
                );
                subscriptions.insert(sub.id.clone(), sub);
                added = true;
            }
        }
        Ok(added)
    }

    async fn remove_address(
        &self,
        subscriptions: &mut HashMap<String, Subscription>,
        address: Address,
    ) -> Result<(), IndexerError> {
        let ids: Vec<String> = subscriptions
            .values()
            .filter(|sub| sub.contract_address == address)
            .map(|sub| sub.id.clone())
            .collect();

        for id in ids {
            subscriptions.remove(&id);
            if let Some(store) = self.store {
                store.delete(&id).await?;
            }
            tracing::info!(subscription_id = %id, "Unsubscribed contract");
        }
        Ok(())
    }
}
