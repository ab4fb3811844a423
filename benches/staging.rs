use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};

#[cfg(target_os = "linux")]
fn bench_staging(c: &mut Criterion) {
    use dgramport::PacketArray;

    let payload = Bytes::from(vec![0u8; 1200]);
    let dst = "127.0.0.1:4433".parse().unwrap();

    c.bench_function("stage_64_addressed", |b| {
        let mut array = PacketArray::new(64);
        b.iter(|| {
            array.reset();
            for _ in 0..64 {
                assert!(array.add_send(&payload, Some(dst), None));
            }
            array.count()
        });
    });

    c.bench_function("stage_64_segmented", |b| {
        let mut array = PacketArray::new(64);
        b.iter(|| {
            array.reset();
            for _ in 0..64 {
                assert!(array.add_send(&payload, Some(dst), Some(1200)));
            }
            array.count()
        });
    });
}

#[cfg(not(target_os = "linux"))]
fn bench_staging(_c: &mut Criterion) {}

fn bench_fan_out(c: &mut Criterion) {
    use dgramport::Datagram;

    let payload = Bytes::from(vec![0u8; 64 * 1024]);
    c.bench_function("fan_out_64k_gro", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(64);
            Datagram {
                payload: payload.clone(),
                sender: None,
                recipient: None,
                segment_size: Some(1024),
            }
            .fan_out(&mut out);
            out.len()
        });
    });
}

criterion_group!(benches, bench_staging, bench_fan_out);
criterion_main!(benches);
