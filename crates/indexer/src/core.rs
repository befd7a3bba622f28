//! The top-level indexer: state machine, poll loop and subscription
//! registration.
//!
//! One engine instance covers one chain. All mutable engine state (the
//! subscription map, the event queue, the run state) is driven by a single
//! worker task per run; concurrency exists only at the RPC boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use logtide_common::config::{ChainConfig, EngineSettings};
use logtide_common::error::IndexerError;
use logtide_common::types::{Event, Subscription, ToBlock};
use logtide_store::{LogCache, StoredSubscription, SubscriptionStore};

use crate::context::EventHandler;
use crate::contracts::ContractRegistry;
use crate::fetcher;
use crate::planner;
use crate::processor::Processor;
use crate::queue::EventQueue;
use crate::rpc::EthRpc;

/// Notifications emitted by the engine.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Indexing moved forward. Emitted when a new block is first entered
    /// and once at the end of every poll.
    Progress {
        current_block: u64,
        target_block: u64,
        pending_events: usize,
    },
    /// A decoded event was dispatched.
    Event(Event),
    /// The run hit a fatal error and is stopping.
    Error { message: String },
    /// The run ended. Emitted exactly once per run.
    Stopped,
}

/// What a run is aiming at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Catch up to the bound (the head is resolved per poll for
    /// `latest`), then stop.
    IndexTo(ToBlock),
    /// Follow the chain head until `stop()`.
    Watch,
}

enum State {
    Initial,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Engine configuration beyond the stores and the transport.
pub struct IndexerOptions<C> {
    pub chain: ChainConfig,
    pub contracts: ContractRegistry<C>,
    pub context: C,
    pub settings: EngineSettings,
    /// Global handler awaited after every per-event handler.
    pub on_event: Option<EventHandler<C>>,
}

/// A resumable EVM log indexer for one chain.
pub struct Indexer<C> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    chain: ChainConfig,
    settings: EngineSettings,
    registry: ContractRegistry<C>,
    context: C,
    on_event: Option<EventHandler<C>>,
    rpc: Arc<dyn EthRpc>,
    cache: Option<Arc<dyn LogCache>>,
    store: Option<Arc<dyn SubscriptionStore>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    state: Mutex<State>,
    initialized: Mutex<bool>,
    notifier: broadcast::Sender<Notification>,
}

impl<C: Clone + Send + Sync + 'static> Indexer<C> {
    pub fn new(
        options: IndexerOptions<C>,
        rpc: Arc<dyn EthRpc>,
        cache: Option<Arc<dyn LogCache>>,
        store: Option<Arc<dyn SubscriptionStore>>,
    ) -> Self {
        let (notifier, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                chain: options.chain,
                settings: options.settings,
                registry: options.contracts,
                context: options.context,
                on_event: options.on_event,
                rpc,
                cache,
                store,
                subscriptions: Mutex::new(HashMap::new()),
                state: Mutex::new(State::Initial),
                initialized: Mutex::new(false),
                notifier,
            }),
        }
    }

    /// Subscribe to engine notifications.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifier.subscribe()
    }

    /// Load persisted subscriptions for this chain, or register the
    /// configured static ones when the store is empty or absent. Called
    /// implicitly by `index_to_block` and `watch`.
    pub async fn init(&self) -> Result<(), IndexerError> {
        self.inner.ensure_init().await
    }

    /// Index from the current cursors up to `to`, then stop. With
    /// `ToBlock::Latest` the chain head is resolved when polling and the
    /// call returns once it is reached.
    pub async fn index_to_block(&self, to: ToBlock) -> Result<(), IndexerError> {
        let done = self.start(RunMode::IndexTo(to)).await?;
        // A dropped sender means the run was stopped externally.
        done.await.unwrap_or(Ok(()))
    }

    /// Follow the chain head until `stop()`. Returns as soon as the run
    /// is started; failures surface on the notification stream.
    pub async fn watch(&self) -> Result<(), IndexerError> {
        let _ = self.start(RunMode::Watch).await?;
        Ok(())
    }

    /// Stop the current run. The pending poll delay is cancelled;
    /// in-flight work completes first.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if !matches!(&*state, State::Running { .. }) {
            return;
        }
        let previous = std::mem::replace(&mut *state, State::Stopped);
        drop(state);

        if let State::Running { cancel, handle } = previous {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    /// Register `address` under `contract_name`'s handled events, outside
    /// of any handler.
    pub async fn subscribe_to_contract(
        &self,
        contract_name: &str,
        address: Address,
        from_block: u64,
        to_block: ToBlock,
    ) -> Result<(), IndexerError> {
        self.inner.ensure_init().await?;
        let new_subs = self.inner.registry.subscriptions_for(
            self.inner.chain.id,
            contract_name,
            address,
            from_block,
            to_block,
        )?;

        let mut subscriptions = self.inner.subscriptions.lock().await;
        for sub in new_subs {
            if subscriptions.contains_key(&sub.id) {
                continue;
            }
            if let Some(store) = &self.inner.store {
                store.save(&StoredSubscription::from(&sub)).await?;
            }
            tracing::info!(subscription_id = %sub.id, contract = contract_name, "Subscribed contract");
            subscriptions.insert(sub.id.clone(), sub);
        }
        Ok(())
    }

    /// Remove every subscription on `address`.
    pub async fn unsubscribe_from_contract(&self, address: Address) -> Result<(), IndexerError> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let ids: Vec<String> = subscriptions
            .values()
            .filter(|sub| sub.contract_address == address)
            .map(|sub| sub.id.clone())
            .collect();

        for id in ids {
            subscriptions.remove(&id);
            if let Some(store) = &self.inner.store {
                store.delete(&id).await?;
            }
            tracing::info!(subscription_id = %id, "Unsubscribed contract");
        }
        Ok(())
    }

    /// Snapshot of the current subscription set.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.inner
            .subscriptions
            .lock()
            .await
            .values()
            .cloned()
            .collect()
    }

    async fn start(
        &self,
        mode: RunMode,
    ) -> Result<oneshot::Receiver<Result<(), IndexerError>>, IndexerError> {
        self.inner.ensure_init().await?;

        let mut state = self.inner.state.lock().await;
        if matches!(&*state, State::Running { .. }) {
            return Err(IndexerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let worker = Worker {
            inner: self.inner.clone(),
            mode,
            cancel: cancel.clone(),
            queue: EventQueue::new(),
            last_progress_block: None,
        };
        let handle = tokio::spawn(worker.run(done_tx));
        *state = State::Running { cancel, handle };

        tracing::info!(
            chain = %self.inner.chain.name,
            chain_id = self.inner.chain.id,
            mode = ?mode,
            "Indexer started"
        );
        Ok(done_rx)
    }
}

impl<C: Clone + Send + Sync + 'static> Inner<C> {
    async fn ensure_init(&self) -> Result<(), IndexerError> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        if let Some(cache) = &self.cache {
            cache.init().await?;
        }
        if let Some(store) = &self.store {
            store.init().await?;
        }

        let mut subscriptions = self.subscriptions.lock().await;
        let persisted = match &self.store {
            Some(store) => store.all(self.chain.id).await?,
            None => Vec::new(),
        };

        if persisted.is_empty() {
            for (name, contract) in self.registry.iter() {
                for static_sub in &contract.subscriptions {
                    let subs = self.registry.subscriptions_for(
                        self.chain.id,
                        name,
                        static_sub.address,
                        static_sub.from_block,
                        static_sub.to_block,
                    )?;
                    for sub in subs {
                        if let Some(store) = &self.store {
                            store.save(&StoredSubscription::from(&sub)).await?;
                        }
                        subscriptions.insert(sub.id.clone(), sub);
                    }
                }
            }
            tracing::info!(
                chain_id = self.chain.id,
                subscriptions = subscriptions.len(),
                "Registered static subscriptions"
            );
        } else {
            for row in &persisted {
                match self.registry.rehydrate(row) {
                    Some(sub) => {
                        subscriptions.insert(sub.id.clone(), sub);
                    }
                    None => tracing::warn!(
                        subscription_id = %row.id,
                        contract = %row.contract_name,
                        "Skipping persisted subscription with no configured contract"
                    ),
                }
            }
            tracing::info!(
                chain_id = self.chain.id,
                subscriptions = subscriptions.len(),
                "Restored persisted subscriptions"
            );
        }

        *initialized = true;
        Ok(())
    }
}

enum PollOutcome {
    /// New subscriptions appeared mid-drain; poll again immediately.
    Replan,
    TargetReached,
    Idle,
}

struct Worker<C> {
    inner: Arc<Inner<C>>,
    mode: RunMode,
    cancel: CancellationToken,
    queue: EventQueue,
    last_progress_block: Option<u64>,
}

impl<C: Clone + Send + Sync + 'static> Worker<C> {
    async fn run(mut self, done: oneshot::Sender<Result<(), IndexerError>>) {
        let result = self.run_loop().await;

        if let Err(err) = &result {
            tracing::error!(error = %err, "Indexer run failed");
            let _ = self.inner.notifier.send(Notification::Error {
                message: err.to_string(),
            });
        }
        {
            let mut state = self.inner.state.lock().await;
            *state = State::Stopped;
        }
        let _ = self.inner.notifier.send(Notification::Stopped);
        tracing::info!("Indexer stopped");
        let _ = done.send(result);
    }

    async fn run_loop(&mut self) -> Result<(), IndexerError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match self.poll().await? {
                PollOutcome::Replan => continue,
                PollOutcome::TargetReached => return Ok(()),
                PollOutcome::Idle => {
                    let delay = Duration::from_millis(self.inner.settings.event_poll_delay_ms);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn poll(&mut self) -> Result<PollOutcome, IndexerError> {
        let target_block = match self.mode {
            RunMode::IndexTo(ToBlock::Block(n)) => n,
            RunMode::IndexTo(ToBlock::Latest) | RunMode::Watch => {
                self.inner.rpc.get_last_block_number().await?
            }
        };

        let mut subscriptions = self.inner.subscriptions.lock().await;

        let plan = planner::plan(
            &subscriptions,
            target_block,
            self.inner.cache.as_ref(),
            &mut self.queue,
        )
        .await?;
        fetcher::execute(
            &plan.groups,
            self.inner.chain.id,
            &subscriptions,
            &self.inner.rpc,
            self.inner.cache.as_ref(),
            &mut self.queue,
        )
        .await?;

        // Fetch coverage is recorded before any of the events are
        // dispatched.
        for touched in &plan.touched {
            if let Some(sub) = subscriptions.get_mut(&touched.id) {
                sub.fetched_to_block = sub.fetched_to_block.max(touched.window_end as i64);
            }
        }

        let mut processor = Processor {
            chain_id: self.inner.chain.id,
            target_block,
            context: self.inner.context.clone(),
            registry: &self.inner.registry,
            rpc: &self.inner.rpc,
            cache: self.inner.cache.as_ref(),
            store: self.inner.store.as_ref(),
            on_event: self.inner.on_event.as_ref(),
            notifier: &self.inner.notifier,
            last_progress_block: &mut self.last_progress_block,
        };
        let outcome = processor.drain(&mut self.queue, &mut subscriptions).await?;
        if outcome.dispatched > 0 {
            tracing::debug!(
                target_block,
                dispatched = outcome.dispatched,
                "Drained event queue"
            );
        }

        if outcome.has_new_subscriptions {
            return Ok(PollOutcome::Replan);
        }

        // Close out the window: subscriptions that fell behind the window
        // end catch up to it, and every touched cursor is persisted.
        for touched in &plan.touched {
            let Some(sub) = subscriptions.get_mut(&touched.id) else {
                continue;
            };
            if sub.indexed_to_block < touched.window_end as i64 {
                sub.indexed_to_block = touched.window_end as i64;
                sub.indexed_to_log_index = 0;
            }
            if let Some(store) = &self.inner.store {
                store
                    .update_cursor(&sub.id, sub.indexed_to_block, sub.indexed_to_log_index)
                    .await?;
            }
        }
        drop(subscriptions);

        let _ = self.inner.notifier.send(Notification::Progress {
            current_block: target_block,
            target_block,
            pending_events: self.queue.len(),
        });
        self.last_progress_block = Some(self.last_progress_block.unwrap_or(0).max(target_block));

        match self.mode {
            RunMode::IndexTo(_) => Ok(PollOutcome::TargetReached),
            RunMode::Watch => Ok(PollOutcome::Idle),
        }
    }
}
