//! Typed helpers for the node methods a wallet relies on.

use crate::engine::{JsonRpcEngine, RpcEngine};
use crate::error::Result;
use crate::options::SubscriptionOptions;
use crate::subscription::SubscriptionEvent;
use chainrpc_protocol::RequestId;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Subscription identifier plus the channel its events arrive on
pub type EventStream<T> = (RequestId, mpsc::UnboundedReceiver<SubscriptionEvent<T>>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub parent_hash: String,
    #[serde(deserialize_with = "hex_number")]
    pub number: u64,
    pub state_root: String,
    pub extrinsics_root: String,
    #[serde(default)]
    pub digest: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVersion {
    pub spec_name: String,
    pub impl_name: String,
    pub spec_version: u32,
    #[serde(default)]
    pub impl_version: u32,
    pub transaction_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub peers: u64,
    pub is_syncing: bool,
    pub should_have_peers: bool,
}

/// Storage values changed in one block; `None` means the key was removed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChangeSet {
    pub block: String,
    pub changes: Vec<(String, Option<String>)>,
}

/// Block numbers arrive as `0x`-prefixed hex, occasionally as plain numbers
fn hex_number<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(text) => {
            let digits = text
                .strip_prefix("0x")
                .ok_or_else(|| de::Error::custom(format!("expected hex number, got {}", text)))?;
            u64::from_str_radix(digits, 16).map_err(de::Error::custom)
        }
    }
}

/// Chain client over any [`JsonRpcEngine`]
#[derive(Clone)]
pub struct ChainClient<E = RpcEngine> {
    engine: E,
}

impl<E: JsonRpcEngine> ChainClient<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Header of the given block, or of the best block when `hash` is None.
    ///
    /// Returns `None` if the node does not know the block.
    pub async fn header(&self, hash: Option<&str>) -> Result<Option<Header>> {
        let params: Vec<&str> = hash.into_iter().collect();
        self.engine.call("chain_getHeader", params).await
    }

    /// Hash of the block at `number`, or of the best block when None
    pub async fn block_hash(&self, number: Option<u64>) -> Result<Option<String>> {
        let params: Vec<u64> = number.into_iter().collect();
        self.engine.call("chain_getBlockHash", params).await
    }

    pub async fn runtime_version(&self) -> Result<RuntimeVersion> {
        self.engine.call("state_getRuntimeVersion", ()).await
    }

    /// Chain name, e.g. "Polkadot"
    pub async fn system_chain(&self) -> Result<String> {
        self.engine.call("system_chain", ()).await
    }

    pub async fn system_health(&self) -> Result<Health> {
        self.engine.call("system_health", ()).await
    }

    pub fn subscribe_new_heads(&self) -> Result<EventStream<Header>> {
        self.engine.subscribe_stream(
            "chain_subscribeNewHeads",
            (),
            SubscriptionOptions::with_unsubscribe("chain_unsubscribeNewHeads"),
        )
    }

    pub fn subscribe_runtime_version(&self) -> Result<EventStream<RuntimeVersion>> {
        self.engine.subscribe_stream(
            "state_subscribeRuntimeVersion",
            (),
            SubscriptionOptions::with_unsubscribe("state_unsubscribeRuntimeVersion"),
        )
    }

    /// Watch storage keys (hex-encoded); the first event carries current values
    pub fn subscribe_storage(&self, keys: &[&str]) -> Result<EventStream<StorageChangeSet>> {
        self.engine.subscribe_stream(
            "state_subscribeStorage",
            [keys],
            SubscriptionOptions::with_unsubscribe("state_unsubscribeStorage"),
        )
    }

    /// Stop a subscription opened through this client
    pub fn unsubscribe(&self, id: RequestId) {
        self.engine.cancel_for_identifier(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_decodes_hex_number() {
        let header: Header = serde_json::from_value(json!({
            "parentHash": "0xabc",
            "number": "0x1a2b",
            "stateRoot": "0xdef",
            "extrinsicsRoot": "0x123",
            "digest": {"logs": []}
        }))
        .unwrap();

        assert_eq!(header.number, 0x1a2b);
        assert_eq!(header.parent_hash, "0xabc");
        assert_eq!(header.digest, json!({"logs": []}));
    }

    #[test]
    fn test_header_rejects_bare_hex() {
        let result: std::result::Result<Header, _> = serde_json::from_value(json!({
            "parentHash": "0xabc",
            "number": "1a2b",
            "stateRoot": "0xdef",
            "extrinsicsRoot": "0x123"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_runtime_version_and_health() {
        let version: RuntimeVersion = serde_json::from_value(json!({
            "specName": "polkadot",
            "implName": "parity-polkadot",
            "authoringVersion": 0,
            "specVersion": 1002000,
            "implVersion": 0,
            "apis": [],
            "transactionVersion": 26,
            "stateVersion": 1
        }))
        .unwrap();
        assert_eq!(version.spec_version, 1_002_000);
        assert_eq!(version.transaction_version, 26);

        let health: Health = serde_json::from_value(json!({
            "peers": 12,
            "isSyncing": false,
            "shouldHavePeers": true
        }))
        .unwrap();
        assert_eq!(health.peers, 12);
        assert!(!health.is_syncing);
    }

    #[test]
    fn test_storage_change_set_allows_removed_keys() {
        let changes: StorageChangeSet = serde_json::from_value(json!({
            "block": "0xbeef",
            "changes": [["0x01", "0xff"], ["0x02", null]]
        }))
        .unwrap();
        assert_eq!(
            changes.changes,
            vec![
                ("0x01".to_string(), Some("0xff".to_string())),
                ("0x02".to_string(), None)
            ]
        );
    }
}
