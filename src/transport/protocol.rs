//! Host link wire format
//!
//! Commands arrive as JSON objects carrying a numeric `tag` and a `method`
//! name plus the method's arguments. Every command is answered by a reply
//! with the same tag; events are pushed unsolicited.

use crate::webrtc::{BridgeError, HostEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command frame: `{"tag": n, "method": "...", ...args}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HostFrame {
    pub tag: u64,
    #[serde(flatten)]
    pub command: HostCommand,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method")]
pub enum HostCommand {
    #[serde(rename = "peerConnectionInit")]
    Init {
        id: i32,
        #[serde(default)]
        configuration: Option<Value>,
        #[serde(default)]
        constraints: Option<Value>,
    },

    #[serde(rename = "peerConnectionSetConfiguration")]
    SetConfiguration {
        id: i32,
        #[serde(default)]
        configuration: Option<Value>,
    },

    #[serde(rename = "getUserMedia")]
    GetUserMedia {
        #[serde(default)]
        constraints: Option<Value>,
    },

    #[serde(rename = "mediaStreamTrackGetSources")]
    GetSources,

    #[serde(rename = "peerConnectionAddStream")]
    AddStream {
        id: i32,
        #[serde(rename = "streamId")]
        stream_id: String,
    },

    #[serde(rename = "peerConnectionRemoveStream")]
    RemoveStream {
        id: i32,
        #[serde(rename = "streamId")]
        stream_id: String,
    },

    #[serde(rename = "peerConnectionCreateOffer")]
    CreateOffer {
        id: i32,
        #[serde(default)]
        constraints: Option<Value>,
    },

    #[serde(rename = "peerConnectionCreateAnswer")]
    CreateAnswer {
        id: i32,
        #[serde(default)]
        constraints: Option<Value>,
    },

    #[serde(rename = "peerConnectionSetLocalDescription")]
    SetLocalDescription { id: i32, sdp: Value },

    #[serde(rename = "peerConnectionSetRemoteDescription")]
    SetRemoteDescription { id: i32, sdp: Value },

    #[serde(rename = "peerConnectionAddICECandidate")]
    AddIceCandidate { id: i32, candidate: Value },

    #[serde(rename = "peerConnectionGetStats")]
    GetStats {
        id: i32,
        #[serde(rename = "trackId", default)]
        track_id: Option<String>,
    },

    #[serde(rename = "peerConnectionClose")]
    Close { id: i32 },

    #[serde(rename = "mediaStreamTrackSetEnabled")]
    TrackSetEnabled {
        #[serde(rename = "trackId")]
        track_id: String,
        enabled: bool,
    },

    #[serde(rename = "mediaStreamTrackStop")]
    TrackStop {
        #[serde(rename = "trackId")]
        track_id: String,
    },

    #[serde(rename = "mediaStreamTrackSwitchCamera")]
    TrackSwitchCamera {
        #[serde(rename = "trackId")]
        track_id: String,
    },

    #[serde(rename = "mediaStreamTrackRelease")]
    TrackRelease {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "trackId")]
        track_id: String,
    },

    #[serde(rename = "mediaStreamRelease")]
    StreamRelease {
        #[serde(rename = "streamId")]
        stream_id: String,
    },

    #[serde(rename = "createDataChannel")]
    CreateDataChannel {
        #[serde(rename = "peerConnectionId")]
        peer_connection_id: i32,
        label: String,
        #[serde(default)]
        config: Option<Value>,
    },

    #[serde(rename = "dataChannelSend")]
    DataChannelSend {
        #[serde(rename = "peerConnectionId")]
        peer_connection_id: i32,
        id: i32,
        data: String,
        #[serde(rename = "type")]
        data_type: String,
    },

    #[serde(rename = "dataChannelClose")]
    DataChannelClose {
        #[serde(rename = "peerConnectionId")]
        peer_connection_id: i32,
        id: i32,
    },
}

impl HostCommand {
    /// Wire name of the command
    pub fn method(&self) -> &'static str {
        match self {
            HostCommand::Init { .. } => "peerConnectionInit",
            HostCommand::SetConfiguration { .. } => "peerConnectionSetConfiguration",
            HostCommand::GetUserMedia { .. } => "getUserMedia",
            HostCommand::GetSources => "mediaStreamTrackGetSources",
            HostCommand::AddStream { .. } => "peerConnectionAddStream",
            HostCommand::RemoveStream { .. } => "peerConnectionRemoveStream",
            HostCommand::CreateOffer { .. } => "peerConnectionCreateOffer",
            HostCommand::CreateAnswer { .. } => "peerConnectionCreateAnswer",
            HostCommand::SetLocalDescription { .. } => "peerConnectionSetLocalDescription",
            HostCommand::SetRemoteDescription { .. } => "peerConnectionSetRemoteDescription",
            HostCommand::AddIceCandidate { .. } => "peerConnectionAddICECandidate",
            HostCommand::GetStats { .. } => "peerConnectionGetStats",
            HostCommand::Close { .. } => "peerConnectionClose",
            HostCommand::TrackSetEnabled { .. } => "mediaStreamTrackSetEnabled",
            HostCommand::TrackStop { .. } => "mediaStreamTrackStop",
            HostCommand::TrackSwitchCamera { .. } => "mediaStreamTrackSwitchCamera",
            HostCommand::TrackRelease { .. } => "mediaStreamTrackRelease",
            HostCommand::StreamRelease { .. } => "mediaStreamRelease",
            HostCommand::CreateDataChannel { .. } => "createDataChannel",
            HostCommand::DataChannelSend { .. } => "dataChannelSend",
            HostCommand::DataChannelClose { .. } => "dataChannelClose",
        }
    }
}

/// Reply to a command frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostReply {
    pub tag: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostReply {
    pub fn ok(tag: u64, result: Option<Value>) -> Self {
        Self {
            tag,
            ok: true,
            result,
            error: None,
        }
    }

    pub fn error(tag: u64, error: impl Into<String>) -> Self {
        Self {
            tag,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Reply for a bridge result, serialising the success value
    pub fn from_result<T: Serialize>(tag: u64, result: Result<T, BridgeError>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(Value::Null) => HostReply::ok(tag, None),
                Ok(value) => HostReply::ok(tag, Some(value)),
                Err(e) => HostReply::error(tag, format!("Failed to encode result: {}", e)),
            },
            Err(e) => HostReply::error(tag, e.to_string()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Why a text frame could not be turned into a command
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing or invalid tag")]
    MissingTag,

    #[error("Invalid command: {0}")]
    Command(String),
}

/// Parse a command frame. On a malformed command with a readable tag the
/// tag is returned alongside the error so the host still gets a reply.
pub fn parse_frame(text: &str) -> Result<HostFrame, (Option<u64>, FrameError)> {
    let value: Value = serde_json::from_str(text).map_err(|e| (None, FrameError::from(e)))?;
    let tag = value.get("tag").and_then(Value::as_u64);
    if tag.is_none() {
        return Err((None, FrameError::MissingTag));
    }
    serde_json::from_value(value).map_err(|e| (tag, FrameError::Command(e.to_string())))
}

pub fn encode_event(event: &HostEvent) -> Option<String> {
    serde_json::to_string(event).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_command_frame() {
        let frame = parse_frame(
            r#"{"tag": 7, "method": "peerConnectionSetRemoteDescription", "id": 1,
                "sdp": {"type": "offer", "sdp": "v=0"}}"#,
        )
        .unwrap();
        assert_eq!(frame.tag, 7);
        assert_eq!(
            frame.command,
            HostCommand::SetRemoteDescription {
                id: 1,
                sdp: json!({"type": "offer", "sdp": "v=0"})
            }
        );
        assert_eq!(frame.command.method(), "peerConnectionSetRemoteDescription");
    }

    #[test]
    fn test_optional_arguments_default() {
        let frame = parse_frame(r#"{"tag": 1, "method": "peerConnectionInit", "id": 4}"#).unwrap();
        assert_eq!(
            frame.command,
            HostCommand::Init {
                id: 4,
                configuration: None,
                constraints: None
            }
        );
        let frame = parse_frame(r#"{"tag": 2, "method": "mediaStreamTrackGetSources"}"#).unwrap();
        assert_eq!(frame.command, HostCommand::GetSources);
    }

    #[test]
    fn test_data_channel_send_frame() {
        let frame = parse_frame(
            r#"{"tag": 3, "method": "dataChannelSend", "peerConnectionId": 2, "id": 0,
                "data": "AAE=", "type": "binary"}"#,
        )
        .unwrap();
        assert_eq!(
            frame.command,
            HostCommand::DataChannelSend {
                peer_connection_id: 2,
                id: 0,
                data: "AAE=".into(),
                data_type: "binary".into()
            }
        );
    }

    #[test]
    fn test_bad_frames_keep_tag_when_possible() {
        assert!(matches!(parse_frame("not json"), Err((None, FrameError::Json(_)))));
        assert!(matches!(
            parse_frame(r#"{"method": "peerConnectionClose", "id": 1}"#),
            Err((None, FrameError::MissingTag))
        ));
        assert!(matches!(
            parse_frame(r#"{"tag": 9, "method": "bogus"}"#),
            Err((Some(9), FrameError::Command(_)))
        ));
    }

    #[test]
    fn test_reply_encoding() {
        assert_eq!(
            serde_json::to_value(HostReply::from_result(1, Ok(()))).unwrap(),
            json!({"tag": 1, "ok": true})
        );
        assert_eq!(
            serde_json::to_value(HostReply::from_result::<()>(
                2,
                Err(BridgeError::ConnectionNotFound(5))
            ))
            .unwrap(),
            json!({"tag": 2, "ok": false, "error": "PeerConnection 5 not found"})
        );
        assert_eq!(
            serde_json::to_value(HostReply::from_result(3, Ok(true))).unwrap(),
            json!({"tag": 3, "ok": true, "result": true})
        );
    }
}
