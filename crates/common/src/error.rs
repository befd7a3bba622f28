use thiserror::Error;

/// Errors raised by the JSON-RPC transport layer.
///
/// Only `Transport` is retryable. `RangeTooWide` is never retried at the
/// RPC layer; the log fetcher reacts to it by splitting the block range.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Network failure, request timeout, or a retryable HTTP status
    /// (5xx, 408, 429).
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider rejected the request because it covered too many
    /// blocks or logs.
    #[error("log range too wide: {0}")]
    RangeTooWide(String),

    /// Non-retryable JSON-RPC error (other 4xx statuses, or an error
    /// object that is not a range complaint).
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The endpoint answered with something that is not valid JSON-RPC.
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

/// Errors from the log cache and the subscription store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid log range: from {from} > to {to}")]
    InvalidRange { from: u64, to: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// ABI decode failures. These are logged and skipped by the fetcher; they
/// never abort a run.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("log is missing topic0")]
    MissingTopic,

    #[error("log topic0 does not match event {event}")]
    TopicMismatch { event: String },

    #[error("abi decode failed for {event}: {source}")]
    Abi {
        event: String,
        #[source]
        source: alloy::dyn_abi::Error,
    },

    #[error("decoded value count does not match the inputs of event {event}")]
    ParamCountMismatch { event: String },
}

/// Fatal engine errors. Any of these stops the current run and is
/// delivered to the caller and the notification stream.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("event is still pending: log has no block number, log index or transaction hash")]
    PendingBlock,

    #[error("handler failed for {event} at block {block}: {source}")]
    Handler {
        event: String,
        block: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("indexer is already running")]
    AlreadyRunning,

    #[error("unknown contract: {0}")]
    UnknownContract(String),
}
