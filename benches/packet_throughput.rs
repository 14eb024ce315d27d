use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use weftflow::packet::{Packet, Payload, Reader, Writer};

const BATCH_SIZES: &[usize] = &[64, 256, 1024];

async fn round_trip_batch(writer: &Writer, batch: usize) {
    for i in 0..batch {
        let count = writer.write(Packet::new(Payload::Int(i as i64)));
        assert_eq!(count, 1);
        writer.receive().await.expect("ack");
    }
}

fn packet_round_trip(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("packet_round_trip");

    for &batch in BATCH_SIZES {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &size| {
            b.to_async(&runtime).iter(|| async {
                let writer = Writer::new();
                let reader = Reader::new();
                writer.link(&reader);

                let echo = reader.clone();
                tokio::spawn(async move {
                    while let Some(pck) = echo.read().await {
                        echo.receive(pck);
                    }
                });

                round_trip_batch(&writer, size).await;
                writer.close();
                reader.close();
            });
        });
    }

    group.finish();
}

fn fan_out_ack_merge(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("fan_out_ack_merge");

    for &readers in &[2_usize, 4, 8] {
        group.throughput(Throughput::Elements(readers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(readers),
            &readers,
            |b, &width| {
                b.to_async(&runtime).iter(|| async move {
                    let writer = Writer::new();
                    for _ in 0..width {
                        let reader = Reader::new();
                        writer.link(&reader);
                        let echo = reader.clone();
                        tokio::spawn(async move {
                            while let Some(pck) = echo.read().await {
                                echo.receive(pck);
                            }
                        });
                    }

                    assert_eq!(writer.write(Packet::new(Payload::Null)), width);
                    writer.receive().await.expect("merged ack");
                    writer.close();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, packet_round_trip, fan_out_ack_merge);
criterion_main!(benches);
