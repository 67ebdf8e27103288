use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use sov_sync::broadcast::HandlerRegistry;
use sov_sync::protocol::{self, ClientMessage, FeedMessage, Inbound, Outbound, ServerMessage};
use sov_sync::topic::{CatchupPolicy, FeedSpec, TopicSynchronizer};

fn campaign(id: i64) -> Value {
    json!({
        "campaign_id": id,
        "solar_system_id": 30_000_000 + id,
        "defender_score": 0.6,
        "attackers_score": 0.4,
        "system_name": format!("SYS-{id}"),
        "out_time_raw": "2030-01-01T00:00:00Z",
    })
}

fn snapshot_frame(n: i64) -> String {
    json!({
        "type": "campaigns.snapshot",
        "topic": "public.campaigns",
        "version": 1,
        "data": (0..n).map(campaign).collect::<Vec<_>>(),
    })
    .to_string()
}

fn diff_frame(since: u64) -> String {
    json!({
        "type": "campaigns.diff",
        "topic": "public.campaigns",
        "since": since,
        "version": since + 1,
        "added": [campaign(10_000 + since as i64)],
        "updated": (0..20).map(|id| json!({
            "campaign_id": id,
            "changes": { "defender_score": 0.5 },
        })).collect::<Vec<_>>(),
        "removed": [],
    })
    .to_string()
}

fn feed(frame: &str) -> FeedMessage {
    match protocol::decode(frame) {
        Inbound::Message(ServerMessage::Feed(msg)) => msg,
        other => panic!("unexpected {other:?}"),
    }
}

fn bench_decode_snapshot(c: &mut Criterion) {
    let frame = snapshot_frame(500);
    c.bench_function("decode_snapshot_500", |b| {
        b.iter(|| black_box(protocol::decode(black_box(&frame))))
    });
}

fn bench_decode_diff(c: &mut Criterion) {
    let frame = diff_frame(1);
    c.bench_function("decode_diff_21", |b| {
        b.iter(|| black_box(protocol::decode(black_box(&frame))))
    });
}

fn bench_apply_snapshot(c: &mut Criterion) {
    let msg = feed(&snapshot_frame(500));
    c.bench_function("apply_snapshot_500", |b| {
        b.iter(|| {
            let mut sync =
                TopicSynchronizer::new(FeedSpec::public_campaigns(), CatchupPolicy::default());
            black_box(sync.apply(black_box(&msg), Instant::now()));
        })
    });
}

fn bench_apply_diff_stream(c: &mut Criterion) {
    let snapshot = feed(&snapshot_frame(500));
    let diffs: Vec<FeedMessage> = (1..=100).map(|v| feed(&diff_frame(v))).collect();
    c.bench_function("apply_100_diffs_over_500", |b| {
        b.iter(|| {
            let mut sync =
                TopicSynchronizer::new(FeedSpec::public_campaigns(), CatchupPolicy::default());
            let now = Instant::now();
            sync.apply(&snapshot, now);
            for diff in &diffs {
                black_box(sync.apply(diff, now));
            }
        })
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let registry = HandlerRegistry::new();
    for _ in 0..16 {
        registry.add(Arc::new(|msg: &ServerMessage| {
            black_box(msg);
        }));
    }
    let msg = ServerMessage::Ack {
        request_id: Some("r".into()),
    };
    c.bench_function("dispatch_16_handlers", |b| {
        b.iter(|| black_box(registry.dispatch(black_box(&msg))))
    });
}

fn bench_encode_subscribe(c: &mut Criterion) {
    let out = Outbound::new(ClientMessage::Subscribe {
        topic: "public.campaigns".into(),
        last_version: Some(42),
    })
    .with_request_id();
    c.bench_function("encode_subscribe", |b| {
        b.iter(|| black_box(out.encode().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_decode_snapshot,
    bench_decode_diff,
    bench_apply_snapshot,
    bench_apply_diff_stream,
    bench_dispatch,
    bench_encode_subscribe,
);
criterion_main!(benches);
