//! Ring buffer throughput: claim/commit against acquire/release

use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use lan_media_mesh::buffer::{RingBuffer, StallPolicy};
use lan_media_mesh::packet::{Packet, PacketKind};

const PACKETS: u64 = 10_000;

fn single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_single_thread");
    group.throughput(Throughput::Elements(PACKETS));

    group.bench_function("claim_commit_acquire_release", |b| {
        let (ring, mut writer) = RingBuffer::new(64, StallPolicy::Block, Packet::factory(256)).unwrap();
        let subscription = ring.subscribe();
        b.iter(|| {
            for _ in 0..PACKETS {
                let mut slot = writer.claim().unwrap();
                slot.prepare(160);
                slot.set_kind(PacketKind::Audio);
                slot.commit();

                let packet = subscription.acquire().unwrap();
                criterion::black_box(packet.payload_len());
                drop(packet);
                subscription.release();
            }
        });
    });

    group.finish();
}

fn fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_fan_out");
    group.throughput(Throughput::Elements(PACKETS));

    for consumers in [1usize, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(consumers), &consumers, |b, &consumers| {
            b.iter(|| {
                let (ring, mut writer) =
                    RingBuffer::new(64, StallPolicy::Block, Packet::factory(256)).unwrap();
                let readers: Vec<_> = (0..consumers)
                    .map(|_| {
                        let subscription = ring.subscribe();
                        thread::spawn(move || {
                            let mut seen = 0u64;
                            while seen < PACKETS {
                                if let Some(packet) = subscription.acquire() {
                                    criterion::black_box(packet.payload_len());
                                    drop(packet);
                                    subscription.release();
                                    seen += 1;
                                } else {
                                    std::hint::spin_loop();
                                }
                            }
                        })
                    })
                    .collect();

                for _ in 0..PACKETS {
                    let mut slot = writer.claim().unwrap();
                    slot.prepare(160);
                    slot.set_kind(PacketKind::Audio);
                    slot.commit();
                }
                for reader in readers {
                    reader.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, single_thread, fan_out);
criterion_main!(benches);
