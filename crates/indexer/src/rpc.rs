//! Bounded-concurrency, retry-wrapped JSON-RPC client.
//!
//! The engine only depends on the [`EthRpc`] trait; [`HttpRpc`] is the
//! shipped HTTP transport and tests substitute an in-process mock. All
//! outbound calls go through one semaphore so a catch-up run cannot
//! flood the endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use logtide_common::config::EngineSettings;
use logtide_common::error::RpcError;
use logtide_common::types::{BlockHeader, ContractCall, Log};

/// Filter for an `eth_getLogs` request.
#[derive(Debug, Clone)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    /// Topic0 filter; empty matches every topic.
    pub topics: Vec<B256>,
    pub from_block: u64,
    pub to_block: u64,
}

/// The JSON-RPC operations the engine needs.
#[async_trait]
pub trait EthRpc: Send + Sync {
    async fn get_last_block_number(&self) -> Result<u64, RpcError>;

    async fn get_block_by_number(&self, number: u64) -> Result<Option<BlockHeader>, RpcError>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, RpcError>;

    async fn read_contract(&self, call: &ContractCall) -> Result<Bytes, RpcError>;
}

/// Provider messages that mean "the requested log range was too wide".
/// These are deliberately loose substrings; every major provider words the
/// complaint differently.
const RANGE_TOO_WIDE_MARKERS: &[&str] = &[
    "more than",
    "response size exceeded",
    "block range is too wide",
    "exceed maximum block range",
    "timeout",
];

/// Classify a JSON-RPC error object into the engine's error taxonomy.
pub fn classify_rpc_error(code: i64, message: &str) -> RpcError {
    let lowered = message.to_lowercase();
    if RANGE_TOO_WIDE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        RpcError::RangeTooWide(message.to_string())
    } else {
        RpcError::Rpc {
            code,
            message: message.to_string(),
        }
    }
}

pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

pub fn parse_quantity(value: &Value) -> Result<u64, RpcError> {
    match value {
        Value::String(s) => parse_quantity_str(s),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| RpcError::InvalidResponse(format!("quantity out of range: {n}"))),
        other => Err(RpcError::InvalidResponse(format!(
            "unexpected quantity: {other}"
        ))),
    }
}

fn parse_quantity_str(s: &str) -> Result<u64, RpcError> {
    let trimmed = s.trim();
    match trimmed.strip_prefix("0x") {
        Some(hex) if !hex.is_empty() => u64::from_str_radix(hex, 16)
            .map_err(|_| RpcError::InvalidResponse(format!("invalid hex quantity: {trimmed}"))),
        Some(_) => Err(RpcError::InvalidResponse(format!(
            "invalid hex quantity: {trimmed}"
        ))),
        None => trimmed
            .parse()
            .map_err(|_| RpcError::InvalidResponse(format!("invalid quantity: {trimmed}"))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    topics: Vec<B256>,
    #[serde(default)]
    data: Bytes,
    block_number: Option<Value>,
    log_index: Option<Value>,
    transaction_index: Option<Value>,
    transaction_hash: Option<B256>,
    block_hash: Option<B256>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    number: Value,
    hash: B256,
    timestamp: Value,
}

fn optional_quantity(value: Option<Value>) -> Result<Option<u64>, RpcError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_quantity(&v).map(Some),
    }
}

impl RawLog {
    fn into_log(self) -> Result<Log, RpcError> {
        Ok(Log {
            address: self.address,
            topics: self.topics,
            data: self.data,
            block_number: optional_quantity(self.block_number)?,
            log_index: optional_quantity(self.log_index)?,
            transaction_index: optional_quantity(self.transaction_index)?,
            transaction_hash: self.transaction_hash,
            block_hash: self.block_hash,
        })
    }
}

/// HTTP JSON-RPC transport.
pub struct HttpRpc {
    url: String,
    http: reqwest::Client,
    limiter: Semaphore,
    next_id: AtomicU64,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpRpc {
    pub fn new(url: impl Into<String>, settings: &EngineSettings) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.rpc_timeout_ms))
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            http,
            limiter: Semaphore::new(settings.rpc_concurrency),
            next_id: AtomicU64::new(1),
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let mut attempt: u32 = 0;
        loop {
            match self.request_once(method, &params).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_delay * 2u32.saturating_pow(attempt - 1);
                    tracing::debug!(
                        method,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying rpc call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn request_once(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(format!("{method}: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
            return Err(RpcError::Transport(format!(
                "{method}: http status {status}"
            )));
        }
        if !status.is_success() {
            return Err(RpcError::Rpc {
                code: i64::from(status.as_u16()),
                message: format!("{method}: http status {status}"),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| RpcError::InvalidResponse(format!("{method}: {e}")))?;

        if let Some(error) = payload.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            // Some providers put the range complaint in the data field.
            let detail = match error.get("data") {
                Some(data) => format!("{message} {data}"),
                None => message.to_string(),
            };
            return Err(classify_rpc_error(code, &detail));
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::InvalidResponse(format!("{method}: missing result field")))
    }
}

#[async_trait]
impl EthRpc for HttpRpc {
    async fn get_last_block_number(&self) -> Result<u64, RpcError> {
        let value = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&value)
    }

    async fn get_block_by_number(&self, number: u64) -> Result<Option<BlockHeader>, RpcError> {
        let value = self
            .request(
                "eth_getBlockByNumber",
                json!([format_quantity(number), false]),
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }

        let raw: RawBlock = serde_json::from_value(value)
            .map_err(|e| RpcError::InvalidResponse(format!("eth_getBlockByNumber: {e}")))?;
        let timestamp = parse_quantity(&raw.timestamp)? as i64;
        let timestamp = Utc.timestamp_opt(timestamp, 0).single().ok_or_else(|| {
            RpcError::InvalidResponse(format!("invalid block timestamp: {timestamp}"))
        })?;

        Ok(Some(BlockHeader {
            number: parse_quantity(&raw.number)?,
            hash: raw.hash,
            timestamp,
        }))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, RpcError> {
        let topics: Value = if filter.topics.is_empty() {
            json!([])
        } else {
            json!([filter.topics])
        };
        let params = json!([{
            "address": filter.addresses,
            "topics": topics,
            "fromBlock": format_quantity(filter.from_block),
            "toBlock": format_quantity(filter.to_block),
        }]);

        let value = self.request("eth_getLogs", params).await?;
        let raw: Vec<RawLog> = serde_json::from_value(value)
            .map_err(|e| RpcError::InvalidResponse(format!("eth_getLogs: {e}")))?;

        raw.into_iter().map(RawLog::into_log).collect()
    }

    async fn read_contract(&self, call: &ContractCall) -> Result<Bytes, RpcError> {
        let params = json!([
            { "to": call.address, "data": call.data },
            format_quantity(call.block_number),
        ]);

        let value = self.request("eth_call", params).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::InvalidResponse(format!("eth_call: {e}")))
    }
}
