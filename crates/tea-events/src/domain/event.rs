//! Raw ledger records and the canonical event delivered to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One block's worth of chaincode activity on a ledger channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLedgerRecord {
    pub block_number: u64,
    pub events: Vec<RawChaincodeEvent>,
}

/// A chaincode event as emitted by the ledger, payload still opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChaincodeEvent {
    pub chaincode_name: String,
    pub event_name: String,
    pub transaction_id: String,
    pub payload: Vec<u8>,
}

/// Normalized, transport-agnostic event. This is the JSON body of every
/// socket frame, SSE block and webhook POST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalEvent {
    pub event_name: String,
    pub chaincode_name: String,
    pub channel_name: String,
    pub transaction_id: String,
    pub block_number: u64,
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl CanonicalEvent {
    /// Receiver-side de-duplication key
    pub fn event_id(&self) -> String {
        format!("{}:{}", self.transaction_id, self.event_name)
    }

    /// Wire encoding shared by all transports
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A raw event that cannot become a canonical event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("chaincode event in block {block} has no event name")]
    MissingEventName { block: u64 },

    #[error("chaincode event in block {block} has no chaincode name")]
    MissingChaincodeName { block: u64 },
}

/// Turn one raw record into canonical events, in ledger order.
///
/// Each entry is decoded independently so one malformed event never hides the
/// rest of its block.
pub fn canonicalize(
    channel: &str,
    record: &RawLedgerRecord,
    observed_at: DateTime<Utc>,
) -> Vec<Result<CanonicalEvent, DecodeError>> {
    record
        .events
        .iter()
        .map(|raw| {
            if raw.event_name.is_empty() {
                return Err(DecodeError::MissingEventName {
                    block: record.block_number,
                });
            }
            if raw.chaincode_name.is_empty() {
                return Err(DecodeError::MissingChaincodeName {
                    block: record.block_number,
                });
            }
            Ok(CanonicalEvent {
                event_name: raw.event_name.clone(),
                chaincode_name: raw.chaincode_name.clone(),
                channel_name: channel.to_string(),
                transaction_id: raw.transaction_id.clone(),
                block_number: record.block_number,
                payload: decode_payload(&raw.payload),
                timestamp: observed_at,
            })
        })
        .collect()
}

/// Decode opaque payload bytes.
///
/// JSON objects pass through; other JSON is wrapped as `value`; other UTF-8
/// text as `raw`; anything else is hex encoded as `rawBytes`.
pub fn decode_payload(bytes: &[u8]) -> Map<String, Value> {
    if bytes.is_empty() {
        return Map::new();
    }

    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => map,
        Ok(other) => single("value", other),
        Err(_) => match std::str::from_utf8(bytes) {
            Ok(text) => single("raw", Value::String(text.to_string())),
            Err(_) => single("rawBytes", Value::String(hex::encode(bytes))),
        },
    }
}

fn single(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    map
}
