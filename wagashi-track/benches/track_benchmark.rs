use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use wagashi_track::{
    Broker, BroadcastHub, Coordinates, DeliveryMessage, EndpointId, MemoryBroker, MessageKind, ProtocolMessage,
    SyncSnapshot, TrackingStore, TransportEvent,
};

fn timeline(len: usize) -> Vec<DeliveryMessage> {
    (0..len)
        .map(|i| DeliveryMessage {
            id: (1_760_864_400_000 + i as i64).to_string(),
            text: format!("Passing the shopping arcade, update {i}"),
            timestamp: "2026-10-19T09:00:00.000Z".to_string(),
            kind: if i % 2 == 0 { MessageKind::Ai } else { MessageKind::System },
        })
        .collect()
}

fn bench_location_encode(c: &mut Criterion) {
    let msg = ProtocolMessage::LocationUpdate(Coordinates::new(35.6812, 139.7671));
    c.bench_function("location_update_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_sync_state_decode(c: &mut Criterion) {
    let frame = ProtocolMessage::SyncState(SyncSnapshot {
        coordinates: Some(Coordinates::new(35.6812, 139.7671)),
        messages: timeline(50),
    })
    .encode()
    .unwrap();

    c.bench_function("sync_state_decode_50_messages", |b| {
        b.iter(|| black_box(ProtocolMessage::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_apply_message_add(c: &mut Criterion) {
    let message = timeline(1).remove(0);
    c.bench_function("apply_1000_message_add", |b| {
        b.iter(|| {
            let mut store = TrackingStore::new();
            for _ in 0..1_000 {
                ProtocolMessage::MessageAdd(message.clone()).apply(&mut store);
            }
            black_box(store.messages().len())
        })
    });
}

/// A hub holding `viewers` open links on an in-process broker.
fn hub_with_viewers(rt: &Runtime, viewers: usize) -> BroadcastHub {
    rt.block_on(async {
        let broker = MemoryBroker::new();
        let (driver, mut driver_events) = broker.open(Some(EndpointId::from("wagashi-bench0")));
        let mut hub = BroadcastHub::new();
        let mut keep = Vec::new();
        assert!(matches!(driver_events.recv().await, Some(TransportEvent::Open(_))));

        for _ in 0..viewers {
            let (viewer, _events) = broker.open(None);
            let _link = viewer.connect(EndpointId::from("wagashi-bench0"));
            keep.push(viewer);
        }
        while hub.viewer_count() < viewers {
            match driver_events.recv().await {
                Some(TransportEvent::IncomingLink(link)) => hub.register(link),
                Some(_) => {}
                None => break,
            }
        }
        // Viewer endpoints and the driver endpoint must outlive the bench.
        std::mem::forget(keep);
        std::mem::forget(driver);
        hub
    })
}

fn bench_hub_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut hub = hub_with_viewers(&rt, 100);
    let msg = ProtocolMessage::LocationUpdate(Coordinates::new(35.6812, 139.7671));

    c.bench_function("hub_broadcast_100_viewers", |b| {
        b.iter(|| black_box(hub.broadcast(black_box(&msg)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_location_encode,
    bench_sync_state_decode,
    bench_apply_message_add,
    bench_hub_fan_out,
);
criterion_main!(benches);
