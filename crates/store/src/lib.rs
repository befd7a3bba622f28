//! Durable storage for the logtide indexer: the log cache and the
//! subscription store, both backed by embedded SQLite through sqlx.

pub mod cache;
pub mod db;
pub mod subscriptions;

pub use cache::{CachedRange, EventBatch, EventQuery, LogCache, SqliteCache};
pub use subscriptions::{SqliteSubscriptionStore, StoredSubscription, SubscriptionStore};
