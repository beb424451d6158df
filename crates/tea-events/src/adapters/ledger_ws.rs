//! Ledger client over the ledger gateway's event socket.
//!
//! `watch("teach1")` opens `<base>/channels/teach1/events` and reads one JSON
//! block frame per message:
//!
//! ```json
//! {"blockNumber": 42, "events": [
//!   {"chaincodeName": "teaTraceCC", "eventName": "BatchCreated",
//!    "txId": "ab12..", "payload": {"batchId": "B1"}}
//! ]}
//! ```
//!
//! `payload` may be any JSON value or a string; `payloadHex` carries binary
//! payloads.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::domain::{LedgerError, RawChaincodeEvent, RawLedgerRecord};
use crate::ports::{LedgerClient, LedgerStream};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockFrame {
    block_number: u64,
    #[serde(default)]
    events: Vec<EventFrame>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventFrame {
    #[serde(default)]
    chaincode_name: String,
    #[serde(default)]
    event_name: String,
    #[serde(default, alias = "txId")]
    transaction_id: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    payload_hex: Option<String>,
}

impl EventFrame {
    fn into_raw(self) -> Result<RawChaincodeEvent, LedgerError> {
        let payload = match (self.payload_hex, self.payload) {
            (Some(hex_payload), _) => hex::decode(hex_payload)
                .map_err(|e| LedgerError::Malformed(format!("payloadHex: {e}")))?,
            (None, Some(Value::String(text))) => text.into_bytes(),
            (None, Some(value)) => value.to_string().into_bytes(),
            (None, None) => Vec::new(),
        };
        Ok(RawChaincodeEvent {
            chaincode_name: self.chaincode_name,
            event_name: self.event_name,
            transaction_id: self.transaction_id,
            payload,
        })
    }
}

/// Decode one block frame. An event whose payload cannot be decoded is
/// dropped; the rest of the block is kept.
pub(crate) fn decode_frame(bytes: &[u8]) -> Result<RawLedgerRecord, LedgerError> {
    let frame: BlockFrame =
        serde_json::from_slice(bytes).map_err(|e| LedgerError::Malformed(e.to_string()))?;
    let block_number = frame.block_number;
    let events = frame
        .events
        .into_iter()
        .filter_map(|event| {
            let tx = event.transaction_id.clone();
            match event.into_raw() {
                Ok(raw) => Some(raw),
                Err(e) => {
                    warn!(block = block_number, tx = %tx, error = %e, "skipping undecodable ledger event");
                    None
                }
            }
        })
        .collect();
    Ok(RawLedgerRecord {
        block_number,
        events,
    })
}

/// WebSocket ledger client
#[derive(Debug, Clone)]
pub struct WsLedgerClient {
    base_url: String,
}

impl WsLedgerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn channel_url(&self, channel: &str) -> String {
        format!("{}/channels/{}/events", self.base_url, channel)
    }
}

#[async_trait]
impl LedgerClient for WsLedgerClient {
    async fn watch(&self, channel: &str) -> Result<LedgerStream, LedgerError> {
        let url = self.channel_url(channel);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| LedgerError::Connect(e.to_string()))?;
        info!(url = %url, "ledger watch connected");

        let stream = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(decode_frame(text.as_bytes())),
                Ok(Message::Binary(bytes)) => Some(decode_frame(&bytes)),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "ledger closed watch");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(LedgerError::Stream(e.to_string()))),
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_frame_payload_forms() {
        let record = decode_frame(
            br#"{"blockNumber": 9, "events": [
                {"chaincodeName": "teaTraceCC", "eventName": "BatchCreated", "txId": "t1", "payload": {"batchId": "B1"}},
                {"chaincodeName": "teaTraceCC", "eventName": "Note", "transactionId": "t2", "payload": "plain"},
                {"chaincodeName": "teaTraceCC", "eventName": "Blob", "txId": "t3", "payloadHex": "fffe"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(record.block_number, 9);
        assert_eq!(record.events[0].payload, br#"{"batchId":"B1"}"#.to_vec());
        assert_eq!(record.events[0].transaction_id, "t1");
        assert_eq!(record.events[1].payload, b"plain".to_vec());
        assert_eq!(record.events[1].transaction_id, "t2");
        assert_eq!(record.events[2].payload, vec![0xff, 0xfe]);
    }

    #[test]
    fn test_decode_frame_rejects_garbage() {
        assert!(matches!(decode_frame(b"not json"), Err(LedgerError::Malformed(_))));
        assert!(matches!(
            decode_frame(br#"{"events": []}"#),
            Err(LedgerError::Malformed(_))
        ));
    }

    #[test]
    fn test_bad_payload_hex_drops_only_that_event() {
        let record = decode_frame(
            br#"{"blockNumber": 4, "events": [
                {"chaincodeName": "teaTraceCC", "eventName": "BatchCreated", "txId": "t1", "payload": {"batchId": "B1"}},
                {"chaincodeName": "teaTraceCC", "eventName": "Blob", "txId": "t2", "payloadHex": "zz"},
                {"chaincodeName": "teaTraceCC", "eventName": "BatchShipped", "txId": "t3", "payload": {"batchId": "B1"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(record.block_number, 4);
        let ids: Vec<&str> = record.events.iter().map(|e| e.transaction_id.as_str()).collect();
        assert_eq!(ids, ["t1", "t3"]);
    }

    #[test]
    fn test_channel_url() {
        let client = WsLedgerClient::new("ws://ledger:7053/");
        assert_eq!(client.channel_url("teach1"), "ws://ledger:7053/channels/teach1/events");
    }
}
