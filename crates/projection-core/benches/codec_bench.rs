//! Criterion benchmarks for the control-channel codec.
//!
//! The control channel is low volume, but the handshake sits on the connect
//! path of every device, so encode/decode cost is tracked here.
//!
//! Run with:
//! ```bash
//! cargo bench --package projection-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use projection_core::protocol::codec::{decode_message, encode_message};
use projection_core::protocol::messages::{
    commands, ControlMessage, CreateSessionRequest, CreateSessionResponse,
};

fn make_request() -> ControlMessage {
    let mut msg = CreateSessionRequest {
        image_quality: 80,
        zoom_rate: 0.5,
    }
    .to_message();
    msg.correlation_id = 7;
    msg
}

fn make_response() -> ControlMessage {
    CreateSessionResponse {
        device_id: "R58M1234ABC".to_string(),
        phone: Some("+15550100".to_string()),
        image_host: Some("192.168.1.23".to_string()),
        screen_width: 1080,
        screen_height: 2400,
        rotation: 0,
        agent_version: Some("3.2.0".to_string()),
        agent_version_code: Some(320),
    }
    .to_message(&make_request())
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let request = make_request();
    let response = make_response();
    let heartbeat = ControlMessage::notification(commands::HEARTBEAT);

    group.bench_function("create_session_request", |b| {
        b.iter(|| encode_message(black_box(&request)).unwrap())
    });
    group.bench_function("create_session_response", |b| {
        b.iter(|| encode_message(black_box(&response)).unwrap())
    });
    group.bench_function("heartbeat", |b| {
        b.iter(|| encode_message(black_box(&heartbeat)).unwrap())
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let response_bytes = encode_message(&make_response()).unwrap();
    group.bench_function("create_session_response", |b| {
        b.iter(|| decode_message(black_box(&response_bytes)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
