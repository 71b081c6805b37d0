//! Data channel manager
//!
//! Sub-registry of data channels keyed by `(connection handle, channel id)`.
//! The table itself lives inside the registry lock so that closing a
//! connection drops its channels in the same critical section as its
//! streams and tracks.

use super::peer_connection::PeerConnection;
use super::registry::Registry;
use super::BridgeError;
use crate::engine::{DataChannelPayload, DataChannelState, NativeDataChannel};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Channels of every live connection
#[derive(Default)]
pub struct DataChannelTable {
    channels: HashMap<(i32, i32), Arc<dyn NativeDataChannel>>,
}

impl DataChannelTable {
    /// Insert a channel; returns false when the key is taken
    pub fn insert(&mut self, connection: i32, channel: Arc<dyn NativeDataChannel>) -> bool {
        let key = (connection, channel.id());
        if self.channels.contains_key(&key) {
            return false;
        }
        self.channels.insert(key, channel);
        true
    }

    pub fn get(&self, connection: i32, id: i32) -> Option<Arc<dyn NativeDataChannel>> {
        self.channels.get(&(connection, id)).cloned()
    }

    pub fn remove(&mut self, connection: i32, id: i32) -> Option<Arc<dyn NativeDataChannel>> {
        self.channels.remove(&(connection, id))
    }

    /// Drop every channel owned by `connection`
    pub fn remove_connection(&mut self, connection: i32) -> Vec<Arc<dyn NativeDataChannel>> {
        let keys: Vec<(i32, i32)> = self
            .channels
            .keys()
            .filter(|(c, _)| *c == connection)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.channels.remove(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Decode a host payload. `kind` is `"text"` or `"binary"`; binary data
/// arrives base64 encoded.
pub fn decode_payload(data: &str, kind: &str) -> Result<DataChannelPayload, BridgeError> {
    match kind {
        "text" => Ok(DataChannelPayload::Text(data.to_string())),
        "binary" => BASE64
            .decode(data)
            .map(|bytes| DataChannelPayload::Binary(Bytes::from(bytes)))
            .map_err(|e| BridgeError::InvalidPayload(format!("bad base64: {}", e))),
        other => Err(BridgeError::InvalidPayload(format!(
            "unknown data type '{}'",
            other
        ))),
    }
}

/// Encode a received payload as `(type, data)` for the host
pub fn encode_payload(payload: &DataChannelPayload) -> (&'static str, String) {
    match payload {
        DataChannelPayload::Text(text) => ("text", text.clone()),
        DataChannelPayload::Binary(bytes) => ("binary", BASE64.encode(bytes)),
    }
}

/// Resolves `(connection, channel)` pairs and keeps the table in step with
/// channel lifecycle events.
#[derive(Clone)]
pub struct DataChannelManager {
    registry: Arc<Registry>,
}

impl DataChannelManager {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Record a channel created locally or announced by the remote peer.
    /// Refused when the connection is gone.
    pub fn register(&self, owner: &PeerConnection, channel: Arc<dyn NativeDataChannel>) -> bool {
        let id = channel.id();
        let registered = self.registry.insert_channel(owner, channel);
        if !registered {
            debug!(
                "DataChannel {} of PeerConnection {} not registered",
                id,
                owner.handle()
            );
        }
        registered
    }

    pub fn resolve(
        &self,
        connection: i32,
        id: i32,
    ) -> Result<Arc<dyn NativeDataChannel>, BridgeError> {
        if self.registry.connection(connection).is_none() {
            return Err(BridgeError::ConnectionNotFound(connection));
        }
        self.registry
            .channel(connection, id)
            .ok_or(BridgeError::DataChannelNotFound {
                connection,
                channel: id,
            })
    }

    /// Apply a channel state change. Closed channels leave the table.
    pub fn on_state_change(&self, connection: i32, id: i32, state: DataChannelState) {
        if state == DataChannelState::Closed && self.forget(connection, id) {
            debug!("DataChannel {} of PeerConnection {} closed", id, connection);
        }
    }

    pub fn forget(&self, connection: i32, id: i32) -> bool {
        self.registry.remove_channel(connection, id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_text_and_binary() {
        assert_eq!(
            decode_payload("hello", "text").unwrap(),
            DataChannelPayload::Text("hello".to_string())
        );
        assert_eq!(
            decode_payload("AAEC", "binary").unwrap(),
            DataChannelPayload::Binary(Bytes::from_static(&[0, 1, 2]))
        );
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(
            decode_payload("@@@", "binary"),
            Err(BridgeError::InvalidPayload(_))
        ));
        assert!(matches!(
            decode_payload("x", "blob"),
            Err(BridgeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_encode_binary_as_base64() {
        let (kind, data) = encode_payload(&DataChannelPayload::Binary(Bytes::from_static(b"hi")));
        assert_eq!(kind, "binary");
        assert_eq!(data, "aGk=");
    }
}
