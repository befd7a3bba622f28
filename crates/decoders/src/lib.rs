//! ABI event decoding for the logtide indexer.
//!
//! Subscriptions carry their event fragment as a runtime
//! [`alloy::json_abi::Event`], so decoding goes through alloy's dynamic ABI
//! machinery rather than generated bindings. The output is the `params`
//! JSON object persisted by the log cache and handed to handlers.

pub mod params;

use alloy::dyn_abi::EventExt;
use alloy::json_abi;

use logtide_common::error::DecodeError;
use logtide_common::types::Log;

/// Decode a raw log against an event fragment.
///
/// Returns the `params` object keyed by ABI parameter name, in input
/// order. Unnamed parameters get positional `param<N>` keys. Indexed
/// dynamic values surface as their 32-byte topic hash, hex-encoded.
pub fn decode_event(abi: &json_abi::Event, log: &Log) -> Result<serde_json::Value, DecodeError> {
    let topic0 = log.topics.first().copied().ok_or(DecodeError::MissingTopic)?;
    if topic0 != abi.selector() {
        return Err(DecodeError::TopicMismatch {
            event: abi.name.clone(),
        });
    }

    let decoded = abi
        .decode_log_parts(log.topics.iter().copied(), &log.data)
        .map_err(|source| DecodeError::Abi {
            event: abi.name.clone(),
            source,
        })?;

    let mut indexed = decoded.indexed.iter();
    let mut body = decoded.body.iter();
    let mut map = serde_json::Map::with_capacity(abi.inputs.len());
    for (position, input) in abi.inputs.iter().enumerate() {
        let value = if input.indexed {
            indexed.next()
        } else {
            body.next()
        };
        let Some(value) = value else {
            return Err(DecodeError::ParamCountMismatch {
                event: abi.name.clone(),
            });
        };
        let name = if input.name.is_empty() {
            format!("param{position}")
        } else {
            input.name.clone()
        };
        map.insert(name, params::value_to_json(value));
    }

    Ok(serde_json::Value::Object(map))
}
