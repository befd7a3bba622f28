//! The logtide indexing engine.
//!
//! Given a set of contract event subscriptions, the engine fetches logs
//! over JSON-RPC, decodes them against the configured ABIs and delivers
//! them in strict `(block_number, log_index)` order to user handlers. Runs
//! resume from cursors persisted in a [`logtide_store::SubscriptionStore`]
//! and skip block ranges already covered by a [`logtide_store::LogCache`].

pub mod context;
pub mod contracts;
pub mod core;
pub mod fetcher;
pub mod planner;
mod processor;
pub mod queue;
pub mod rpc;

pub use crate::context::{EventContext, EventHandler, HandlerResult, SubscribeRequest};
pub use crate::contracts::{ContractConfig, ContractRegistry, StaticSubscription};
pub use crate::core::{Indexer, IndexerOptions, Notification};
pub use crate::queue::EventQueue;
pub use crate::rpc::{EthRpc, HttpRpc, LogFilter};
