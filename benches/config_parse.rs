use criterion::{criterion_group, criterion_main, Criterion};
use rtc_bridge::webrtc::rtc_config::{
    parse_ice_servers, DataChannelInit, MediaConstraints, RtcConfiguration,
};
use serde_json::json;
use std::hint::black_box;

fn bench_configuration_parse(c: &mut Criterion) {
    let config = json!({
        "iceServers": [
            {"urls": ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"]},
            {"url": "turn:turn.example.org:3478", "username": "user", "credential": "secret"},
            {"urls": "turns:turn.example.org:5349", "username": "user", "credential": "secret"},
            "not a map"
        ],
        "iceTransportPolicy": "relay",
        "bundlePolicy": "max-compat",
        "rtcpMuxPolicy": "negotiate",
        "tcpCandidatePolicy": "disabled",
        "candidateNetworkPolicy": "low-cost",
        "keyType": "ECDSA",
        "continualGatheringPolicy": "gather_continually",
        "audioJitterBufferMaxPackets": 50,
        "iceConnectionReceivingTimeout": 1000,
        "iceBackupCandidatePairPingInterval": 2000,
        "audioJitterBufferFastAccelerate": true,
        "pruneTurnPorts": true,
        "presumeWritableWhenFullyRelayed": true
    });

    c.bench_function("rtc_configuration_parse", |b| {
        b.iter(|| RtcConfiguration::parse(black_box(Some(&config))))
    });

    c.bench_function("ice_servers_parse", |b| {
        b.iter(|| parse_ice_servers(black_box(config.get("iceServers"))))
    });
}

fn bench_constraints_parse(c: &mut Criterion) {
    let constraints = json!({
        "mandatory": {"OfferToReceiveAudio": true, "OfferToReceiveVideo": "true"},
        "optional": [{"DtlsSrtpKeyAgreement": true}, {"googIPv6": false}, 42]
    });
    let init = json!({
        "ordered": false,
        "maxRetransmits": 3,
        "protocol": "chat",
        "negotiated": true,
        "id": 5
    });

    c.bench_function("media_constraints_parse", |b| {
        b.iter(|| MediaConstraints::parse(black_box(Some(&constraints))))
    });

    c.bench_function("data_channel_init_parse", |b| {
        b.iter(|| DataChannelInit::parse(black_box(Some(&init))))
    });
}

criterion_group!(benches, bench_configuration_parse, bench_constraints_parse);
criterion_main!(benches);
