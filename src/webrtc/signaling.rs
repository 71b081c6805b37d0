//! Signaling wire types and the offer/answer state model
//!
//! SDP and ICE candidate payloads exchanged with the host, plus the
//! signaling / ICE state enums mirrored from the native engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// SDP type as carried on the wire (`"offer"`, `"pranswer"`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        }
    }

    /// Parse the canonical form used by the host
    pub fn from_canonical(value: &str) -> Option<Self> {
        match value {
            "offer" => Some(SdpType::Offer),
            "pranswer" => Some(SdpType::Pranswer),
            "answer" => Some(SdpType::Answer),
            "rollback" => Some(SdpType::Rollback),
            _ => None,
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session description: `{ type, sdp }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, sdp)
    }
}

/// ICE candidate: `{ sdpMid, sdpMLineIndex, candidate }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    pub candidate: String,
}

/// Which side a description is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionSide {
    Local,
    Remote,
}

/// Signaling state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    #[serde(rename = "have-local-pranswer")]
    HaveLocalPrAnswer,
    #[serde(rename = "have-remote-pranswer")]
    HaveRemotePrAnswer,
    Closed,
}

impl SignalingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPrAnswer => "have-local-pranswer",
            SignalingState::HaveRemotePrAnswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        }
    }

    /// `createOffer` is accepted in `stable` and `have-local-offer`
    pub fn can_create_offer(&self) -> bool {
        matches!(self, SignalingState::Stable | SignalingState::HaveLocalOffer)
    }

    /// `createAnswer` requires a remote offer to be in place
    pub fn can_create_answer(&self) -> bool {
        matches!(
            self,
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer
        )
    }

    /// Next state after applying a description of `sdp_type` on `side`.
    ///
    /// Returns the engine-style failure string when the transition is not
    /// allowed from the current state.
    pub fn apply(
        self,
        side: DescriptionSide,
        sdp_type: SdpType,
    ) -> Result<SignalingState, String> {
        use DescriptionSide::{Local, Remote};
        use SignalingState::*;

        let next = match (side, sdp_type, self) {
            (_, _, Closed) => None,

            (Local, SdpType::Offer, Stable | HaveLocalOffer) => Some(HaveLocalOffer),
            (Local, SdpType::Answer, HaveRemoteOffer | HaveLocalPrAnswer) => Some(Stable),
            (Local, SdpType::Pranswer, HaveRemoteOffer | HaveLocalPrAnswer) => {
                Some(HaveLocalPrAnswer)
            }
            (Local, SdpType::Rollback, HaveLocalOffer) => Some(Stable),

            (Remote, SdpType::Offer, Stable | HaveRemoteOffer) => Some(HaveRemoteOffer),
            (Remote, SdpType::Answer, HaveLocalOffer | HaveRemotePrAnswer) => Some(Stable),
            (Remote, SdpType::Pranswer, HaveLocalOffer | HaveRemotePrAnswer) => {
                Some(HaveRemotePrAnswer)
            }
            (Remote, SdpType::Rollback, HaveRemoteOffer) => Some(Stable),

            _ => None,
        };

        next.ok_or_else(|| {
            let side = match side {
                Local => "local",
                Remote => "remote",
            };
            format!(
                "Failed to set {} {} sdp: Called in wrong state: {}",
                side, sdp_type, self
            )
        })
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Closed => "closed",
        }
    }
}

/// ICE gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

impl IceGatheringState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IceGatheringState::New => "new",
            IceGatheringState::Gathering => "gathering",
            IceGatheringState::Complete => "complete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_answer_round() {
        let local = SignalingState::Stable
            .apply(DescriptionSide::Local, SdpType::Offer)
            .unwrap();
        assert_eq!(local, SignalingState::HaveLocalOffer);
        let done = local.apply(DescriptionSide::Remote, SdpType::Answer).unwrap();
        assert_eq!(done, SignalingState::Stable);
    }

    #[test]
    fn test_pranswer_then_answer() {
        let state = SignalingState::HaveRemoteOffer
            .apply(DescriptionSide::Local, SdpType::Pranswer)
            .unwrap();
        assert_eq!(state, SignalingState::HaveLocalPrAnswer);
        assert!(state.can_create_answer());
        let state = state.apply(DescriptionSide::Local, SdpType::Answer).unwrap();
        assert_eq!(state, SignalingState::Stable);
    }

    #[test]
    fn test_rejects_answer_in_stable() {
        let err = SignalingState::Stable
            .apply(DescriptionSide::Remote, SdpType::Answer)
            .unwrap_err();
        assert!(err.contains("wrong state: stable"));
    }

    #[test]
    fn test_rollback_only_from_matching_offer() {
        assert_eq!(
            SignalingState::HaveRemoteOffer
                .apply(DescriptionSide::Remote, SdpType::Rollback)
                .unwrap(),
            SignalingState::Stable
        );
        assert!(SignalingState::HaveRemoteOffer
            .apply(DescriptionSide::Local, SdpType::Rollback)
            .is_err());
    }

    #[test]
    fn test_closed_rejects_everything() {
        for side in [DescriptionSide::Local, DescriptionSide::Remote] {
            for ty in [SdpType::Offer, SdpType::Answer, SdpType::Pranswer, SdpType::Rollback] {
                assert!(SignalingState::Closed.apply(side, ty).is_err());
            }
        }
    }

    #[test]
    fn test_offer_preconditions() {
        assert!(SignalingState::Stable.can_create_offer());
        assert!(SignalingState::HaveLocalOffer.can_create_offer());
        assert!(!SignalingState::HaveRemoteOffer.can_create_offer());
        assert!(!SignalingState::Stable.can_create_answer());
    }

    #[test]
    fn test_wire_representation() {
        let sdp = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_value(&sdp).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");

        let candidate: IceCandidate = serde_json::from_str(
            r#"{"sdpMid":"0","sdpMLineIndex":1,"candidate":"candidate:1 1 udp 1 1.2.3.4 5 typ host"}"#,
        )
        .unwrap();
        assert_eq!(candidate.sdp_mline_index, 1);

        let state = serde_json::to_value(SignalingState::HaveLocalPrAnswer).unwrap();
        assert_eq!(state, "have-local-pranswer");
    }
}
