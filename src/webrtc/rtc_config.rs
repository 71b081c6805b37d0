//! Host configuration parsing
//!
//! Converts the loosely-typed dictionaries sent by the host into typed
//! engine settings. Parsing is lenient per field: a missing or malformed
//! field keeps the engine default and never fails the whole configuration.

use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};

/// One ICE server entry. A host entry carrying several `urls` expands into
/// one `IceServer` per URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceServer {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    fn new(url: String, auth: Option<(String, String)>) -> Self {
        let (username, credential) = match auth {
            Some((u, c)) => (Some(u), Some(c)),
            None => (None, None),
        };
        Self {
            url,
            username,
            credential,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
    NoHost,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum BundlePolicy {
    #[default]
    Balanced,
    MaxCompat,
    MaxBundle,
}

impl BundlePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundlePolicy::Balanced => "balanced",
            BundlePolicy::MaxCompat => "max-compat",
            BundlePolicy::MaxBundle => "max-bundle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum RtcpMuxPolicy {
    #[default]
    Negotiate,
    Require,
}

impl RtcpMuxPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtcpMuxPolicy::Negotiate => "negotiate",
            RtcpMuxPolicy::Require => "require",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum TcpCandidatePolicy {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CandidateNetworkPolicy {
    #[default]
    All,
    LowCost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum KeyType {
    Rsa,
    #[default]
    Ecdsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum ContinualGatheringPolicy {
    #[default]
    GatherOnce,
    GatherContinually,
}

/// Engine-ready connection configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
    pub ice_candidate_pool_size: u32,

    // Engine-private tuning
    pub tcp_candidate_policy: TcpCandidatePolicy,
    pub candidate_network_policy: CandidateNetworkPolicy,
    pub key_type: KeyType,
    pub continual_gathering_policy: ContinualGatheringPolicy,
    pub audio_jitter_buffer_max_packets: i32,
    /// Milliseconds, -1 keeps the engine default
    pub ice_connection_receiving_timeout: i32,
    /// Milliseconds, -1 keeps the engine default
    pub ice_backup_candidate_pair_ping_interval: i32,
    pub audio_jitter_buffer_fast_accelerate: bool,
    pub prune_turn_ports: bool,
    pub presume_writable_when_fully_relayed: bool,
}

impl Default for RtcConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            ice_transport_policy: IceTransportPolicy::All,
            bundle_policy: BundlePolicy::Balanced,
            rtcp_mux_policy: RtcpMuxPolicy::Negotiate,
            ice_candidate_pool_size: 0,
            tcp_candidate_policy: TcpCandidatePolicy::Enabled,
            candidate_network_policy: CandidateNetworkPolicy::All,
            key_type: KeyType::Ecdsa,
            continual_gathering_policy: ContinualGatheringPolicy::GatherOnce,
            audio_jitter_buffer_max_packets: 50,
            ice_connection_receiving_timeout: -1,
            ice_backup_candidate_pair_ping_interval: -1,
            audio_jitter_buffer_fast_accelerate: false,
            prune_turn_ports: false,
            presume_writable_when_fully_relayed: false,
        }
    }
}

impl RtcConfiguration {
    /// Parse a host configuration dictionary. `None`, `null` and
    /// non-object values yield the defaults.
    pub fn parse(value: Option<&Value>) -> Self {
        let map = value.and_then(Value::as_object);
        let mut conf = RtcConfiguration {
            ice_servers: parse_ice_servers(map.and_then(|m| m.get("iceServers"))),
            ..Default::default()
        };
        let Some(map) = map else {
            return conf;
        };

        if let Some(v) = string_field(map, "iceTransportPolicy") {
            match v {
                "all" => conf.ice_transport_policy = IceTransportPolicy::All,
                "relay" => conf.ice_transport_policy = IceTransportPolicy::Relay,
                "nohost" => conf.ice_transport_policy = IceTransportPolicy::NoHost,
                "none" => conf.ice_transport_policy = IceTransportPolicy::None,
                _ => {}
            }
        }

        if let Some(v) = string_field(map, "bundlePolicy") {
            match v {
                "balanced" => conf.bundle_policy = BundlePolicy::Balanced,
                "max-compat" => conf.bundle_policy = BundlePolicy::MaxCompat,
                "max-bundle" => conf.bundle_policy = BundlePolicy::MaxBundle,
                _ => {}
            }
        }
        // Host value is discarded: bundle and rtcp-mux policies are pinned
        // to balanced / negotiate.
        conf.bundle_policy = BundlePolicy::Balanced;

        if let Some(v) = string_field(map, "rtcpMuxPolicy") {
            match v {
                "negotiate" => conf.rtcp_mux_policy = RtcpMuxPolicy::Negotiate,
                "require" => conf.rtcp_mux_policy = RtcpMuxPolicy::Require,
                _ => {}
            }
        }
        conf.rtcp_mux_policy = RtcpMuxPolicy::Negotiate;

        if let Some(v) = number_field(map, "iceCandidatePoolSize") {
            if v > 0 {
                conf.ice_candidate_pool_size = v as u32;
            }
        }

        if let Some(v) = string_field(map, "tcpCandidatePolicy") {
            match v {
                "enabled" => conf.tcp_candidate_policy = TcpCandidatePolicy::Enabled,
                "disabled" => conf.tcp_candidate_policy = TcpCandidatePolicy::Disabled,
                _ => {}
            }
        }

        if let Some(v) = string_field(map, "candidateNetworkPolicy") {
            match v {
                "all" => conf.candidate_network_policy = CandidateNetworkPolicy::All,
                "low_cost" => conf.candidate_network_policy = CandidateNetworkPolicy::LowCost,
                _ => {}
            }
        }

        if let Some(v) = string_field(map, "keyType") {
            match v {
                "RSA" => conf.key_type = KeyType::Rsa,
                "ECDSA" => conf.key_type = KeyType::Ecdsa,
                _ => {}
            }
        }

        if let Some(v) = string_field(map, "continualGatheringPolicy") {
            match v {
                "gather_once" => {
                    conf.continual_gathering_policy = ContinualGatheringPolicy::GatherOnce
                }
                "gather_continually" => {
                    conf.continual_gathering_policy = ContinualGatheringPolicy::GatherContinually
                }
                _ => {}
            }
        }

        if let Some(v) = number_field(map, "audioJitterBufferMaxPackets") {
            if v > 0 {
                conf.audio_jitter_buffer_max_packets = v;
            }
        }

        if let Some(v) = number_field(map, "iceConnectionReceivingTimeout") {
            conf.ice_connection_receiving_timeout = v;
        }

        if let Some(v) = number_field(map, "iceBackupCandidatePairPingInterval") {
            conf.ice_backup_candidate_pair_ping_interval = v;
        }

        if let Some(v) = bool_field(map, "audioJitterBufferFastAccelerate") {
            conf.audio_jitter_buffer_fast_accelerate = v;
        }

        if let Some(v) = bool_field(map, "pruneTurnPorts") {
            conf.prune_turn_ports = v;
        }

        if let Some(v) = bool_field(map, "presumeWritableWhenFullyRelayed") {
            conf.presume_writable_when_fully_relayed = v;
        }

        conf
    }
}

/// Parse the `iceServers` array. Entries without a usable URL are dropped.
pub fn parse_ice_servers(value: Option<&Value>) -> Vec<IceServer> {
    let Some(entries) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut servers = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(map) = entry.as_object() else {
            debug!("iceServers entry is not a map, skipping");
            continue;
        };

        let auth = match (string_field(map, "username"), string_field(map, "credential")) {
            (Some(u), Some(c)) => Some((u.to_string(), c.to_string())),
            _ => None,
        };

        if map.contains_key("url") {
            if let Some(url) = string_field(map, "url") {
                servers.push(IceServer::new(url.to_string(), auth));
            }
        } else if let Some(urls) = map.get("urls") {
            match urls {
                Value::String(url) => servers.push(IceServer::new(url.clone(), auth)),
                Value::Array(list) => {
                    for url in list.iter().filter_map(Value::as_str) {
                        servers.push(IceServer::new(url.to_string(), auth.clone()));
                    }
                }
                _ => debug!("iceServers urls is neither string nor array"),
            }
        }
    }
    servers
}

/// A single constraint key/value pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Mandatory / optional media constraints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MediaConstraints {
    pub mandatory: Vec<KeyValuePair>,
    pub optional: Vec<KeyValuePair>,
}

impl MediaConstraints {
    /// Parse `{ mandatory: {k: v}, optional: [{k: v}, ...] }`. Malformed
    /// halves degrade to empty sets.
    pub fn parse(value: Option<&Value>) -> Self {
        let mut constraints = MediaConstraints::default();
        let Some(map) = value.and_then(Value::as_object) else {
            return constraints;
        };

        match map.get("mandatory") {
            Some(Value::Object(mandatory)) => {
                parse_constraint_map(mandatory, &mut constraints.mandatory)
            }
            _ => debug!("mandatory constraints are not a map"),
        }

        match map.get("optional") {
            Some(Value::Array(optional)) => {
                for item in optional {
                    if let Value::Object(entry) = item {
                        parse_constraint_map(entry, &mut constraints.optional);
                    }
                }
            }
            _ => debug!("optional constraints are not an array"),
        }

        constraints
    }

    /// Constraints applied to offers when the host sends none
    pub fn default_offer() -> Self {
        Self {
            mandatory: vec![
                KeyValuePair::new("OfferToReceiveAudio", "true"),
                KeyValuePair::new("OfferToReceiveVideo", "true"),
            ],
            optional: vec![KeyValuePair::new("DtlsSrtpKeyAgreement", "true")],
        }
    }

    /// Value for `key`, mandatory entries first
    pub fn get(&self, key: &str) -> Option<&str> {
        self.mandatory
            .iter()
            .chain(self.optional.iter())
            .find(|pair| pair.key == key)
            .map(|pair| pair.value.as_str())
    }

    pub fn is_true(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn is_empty(&self) -> bool {
        self.mandatory.is_empty() && self.optional.is_empty()
    }
}

fn parse_constraint_map(src: &Map<String, Value>, dst: &mut Vec<KeyValuePair>) {
    for (key, value) in src {
        if let Some(value) = value_to_string(value) {
            dst.push(KeyValuePair::new(key.clone(), value));
        }
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Some(i.to_string()),
            (None, Some(f)) => Some(f.to_string()),
            _ => Some(n.to_string()),
        },
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Data channel creation options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataChannelInit {
    pub ordered: Option<bool>,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub protocol: Option<String>,
    pub negotiated: bool,
    pub id: Option<i32>,
}

impl DataChannelInit {
    pub fn parse(value: Option<&Value>) -> Self {
        let mut init = DataChannelInit::default();
        let Some(map) = value.and_then(Value::as_object) else {
            return init;
        };

        init.ordered = bool_field(map, "ordered");
        init.max_packet_life_time = number_field(map, "maxPacketLifeTime")
            .and_then(|v| u16::try_from(v).ok());
        init.max_retransmits =
            number_field(map, "maxRetransmits").and_then(|v| u16::try_from(v).ok());
        init.protocol = string_field(map, "protocol").map(str::to_string);
        init.negotiated = bool_field(map, "negotiated").unwrap_or(false);
        init.id = number_field(map, "id").filter(|v| *v >= 0);
        init
    }
}

/// Camera facing requested through `facingMode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum Facing {
    #[default]
    Front,
    Back,
}

/// `getUserMedia` constraints: which kinds are requested
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserMediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoConstraints {
    pub facing: Facing,
    pub source_id: Option<String>,
}

impl UserMediaConstraints {
    pub fn parse(value: Option<&Value>) -> Self {
        let mut constraints = UserMediaConstraints::default();
        let Some(map) = value.and_then(Value::as_object) else {
            return constraints;
        };

        constraints.audio = match map.get("audio") {
            Some(Value::Bool(b)) => *b,
            Some(Value::Object(_)) => true,
            _ => false,
        };

        constraints.video = match map.get("video") {
            Some(Value::Bool(true)) => Some(VideoConstraints::default()),
            Some(Value::Object(video)) => {
                let facing = match string_field(video, "facingMode") {
                    Some("environment") => Facing::Back,
                    _ => Facing::Front,
                };
                let source_id = video
                    .get("optional")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|entry| entry.get("sourceId"))
                    .find_map(value_to_string);
                Some(VideoConstraints { facing, source_id })
            }
            _ => None,
        };

        constraints
    }
}

fn string_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

fn bool_field(map: &Map<String, Value>, key: &str) -> Option<bool> {
    map.get(key).and_then(Value::as_bool)
}

/// Any JSON number, truncated toward zero and saturated to `i32`
fn number_field(map: &Map<String, Value>, key: &str) -> Option<i32> {
    let Value::Number(number) = map.get(key)? else {
        return None;
    };
    if let Some(i) = number.as_i64() {
        return Some(i.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
    }
    number.as_f64().map(|f| f as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_urls_array_expands_with_credentials() {
        let value = json!({
            "iceServers": [{"urls": ["stun:a", "stun:b"], "username": "u", "credential": "c"}]
        });
        let conf = RtcConfiguration::parse(Some(&value));
        assert_eq!(conf.ice_servers.len(), 2);
        assert_eq!(conf.ice_servers[0].url, "stun:a");
        assert_eq!(conf.ice_servers[1].url, "stun:b");
        for server in &conf.ice_servers {
            assert_eq!(server.username.as_deref(), Some("u"));
            assert_eq!(server.credential.as_deref(), Some("c"));
        }
    }

    #[test]
    fn test_singular_url_wins_over_urls() {
        let servers = parse_ice_servers(Some(&json!([
            {"url": "turn:x", "urls": ["stun:ignored"]},
            {"urls": "stun:single"}
        ])));
        assert_eq!(
            servers.iter().map(|s| s.url.as_str()).collect::<Vec<_>>(),
            vec!["turn:x", "stun:single"]
        );
    }

    #[test]
    fn test_partial_credentials_are_dropped() {
        let servers = parse_ice_servers(Some(&json!([{"urls": "turn:x", "username": "u"}])));
        assert_eq!(servers.len(), 1);
        assert!(servers[0].username.is_none());
        assert!(servers[0].credential.is_none());
    }

    #[test]
    fn test_malformed_ice_entries_are_omitted() {
        let servers = parse_ice_servers(Some(&json!([
            42,
            {"url": 7},
            {"urls": {"nested": true}},
            {"urls": ["stun:ok", 5]}
        ])));
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].url, "stun:ok");
    }

    #[test]
    fn test_bundle_and_rtcp_mux_are_forced() {
        let value = json!({"bundlePolicy": "max-bundle", "rtcpMuxPolicy": "require"});
        let conf = RtcConfiguration::parse(Some(&value));
        assert_eq!(conf.bundle_policy.as_str(), "balanced");
        assert_eq!(conf.rtcp_mux_policy.as_str(), "negotiate");
    }

    #[test]
    fn test_unknown_enum_strings_keep_defaults() {
        let value = json!({
            "iceTransportPolicy": "sometimes",
            "tcpCandidatePolicy": 1,
            "keyType": "DSA"
        });
        let conf = RtcConfiguration::parse(Some(&value));
        assert_eq!(conf.ice_transport_policy, IceTransportPolicy::All);
        assert_eq!(conf.tcp_candidate_policy, TcpCandidatePolicy::Enabled);
        assert_eq!(conf.key_type, KeyType::Ecdsa);
    }

    #[test]
    fn test_private_fields() {
        let value = json!({
            "iceTransportPolicy": "relay",
            "iceCandidatePoolSize": 4,
            "candidateNetworkPolicy": "low_cost",
            "continualGatheringPolicy": "gather_continually",
            "audioJitterBufferMaxPackets": 0,
            "iceConnectionReceivingTimeout": 2500.0,
            "iceBackupCandidatePairPingInterval": "fast",
            "pruneTurnPorts": true,
            "presumeWritableWhenFullyRelayed": "yes"
        });
        let conf = RtcConfiguration::parse(Some(&value));
        assert_eq!(conf.ice_transport_policy, IceTransportPolicy::Relay);
        assert_eq!(conf.ice_candidate_pool_size, 4);
        assert_eq!(conf.candidate_network_policy, CandidateNetworkPolicy::LowCost);
        assert_eq!(
            conf.continual_gathering_policy,
            ContinualGatheringPolicy::GatherContinually
        );
        assert_eq!(conf.audio_jitter_buffer_max_packets, 50);
        assert_eq!(conf.ice_connection_receiving_timeout, 2500);
        assert_eq!(conf.ice_backup_candidate_pair_ping_interval, -1);
        assert!(conf.prune_turn_ports);
        assert!(!conf.presume_writable_when_fully_relayed);
    }

    #[test]
    fn test_non_positive_pool_size_ignored() {
        let conf = RtcConfiguration::parse(Some(&json!({"iceCandidatePoolSize": -3})));
        assert_eq!(conf.ice_candidate_pool_size, 0);
    }

    #[test]
    fn test_absent_configuration() {
        assert_eq!(RtcConfiguration::parse(None), RtcConfiguration::default());
        assert_eq!(
            RtcConfiguration::parse(Some(&json!("not a map"))),
            RtcConfiguration::default()
        );
    }

    #[test]
    fn test_media_constraints() {
        let value = json!({
            "mandatory": {"OfferToReceiveAudio": true, "minWidth": 640, "ratio": 1.5},
            "optional": [{"DtlsSrtpKeyAgreement": "true"}, "bogus", {"googCpuOveruseDetection": false}]
        });
        let constraints = MediaConstraints::parse(Some(&value));
        assert_eq!(constraints.mandatory.len(), 3);
        assert_eq!(constraints.get("minWidth"), Some("640"));
        assert_eq!(constraints.get("ratio"), Some("1.5"));
        assert!(constraints.is_true("OfferToReceiveAudio"));
        assert_eq!(constraints.optional.len(), 2);
        assert_eq!(constraints.get("googCpuOveruseDetection"), Some("false"));
    }

    #[test]
    fn test_malformed_constraints_degrade_to_empty() {
        let constraints =
            MediaConstraints::parse(Some(&json!({"mandatory": [1, 2], "optional": {"a": "b"}})));
        assert!(constraints.is_empty());
    }

    #[test]
    fn test_data_channel_init() {
        let init = DataChannelInit::parse(Some(&json!({
            "ordered": false,
            "maxRetransmits": 3,
            "maxPacketLifeTime": -1,
            "protocol": "chat",
            "negotiated": true,
            "id": 5
        })));
        assert_eq!(init.ordered, Some(false));
        assert_eq!(init.max_retransmits, Some(3));
        assert_eq!(init.max_packet_life_time, None);
        assert_eq!(init.protocol.as_deref(), Some("chat"));
        assert!(init.negotiated);
        assert_eq!(init.id, Some(5));
    }

    #[test]
    fn test_user_media_constraints() {
        let constraints = UserMediaConstraints::parse(Some(&json!({
            "audio": true,
            "video": {"facingMode": "environment", "optional": [{"sourceId": "1"}]}
        })));
        assert!(constraints.audio);
        let video = constraints.video.unwrap();
        assert_eq!(video.facing, Facing::Back);
        assert_eq!(video.source_id.as_deref(), Some("1"));

        let audio_only = UserMediaConstraints::parse(Some(&json!({"audio": {}, "video": false})));
        assert!(audio_only.audio);
        assert!(audio_only.video.is_none());
    }
}
