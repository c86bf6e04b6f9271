//! Criterion benchmarks for gmf-core data buses and the payload cache
//!
//! Run with: cargo bench -p gmf-core
#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use gmf_core::{DataBus, Payload, PayloadCache, Wait, new_block, new_fifo, new_ringbuf};

const CHUNK_SIZES: &[usize] = &[64, 256, 1024, 4096];

fn bench_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("BusWriteRead");

    for &chunk in CHUNK_SIZES {
        let data = vec![0x55u8; chunk];
        let mut out = vec![0u8; chunk];
        let buses: [(&str, std::sync::Arc<dyn DataBus>); 3] = [
            ("ringbuf", new_ringbuf(1, 16 * 1024).unwrap()),
            ("block", new_block(1024, 16).unwrap()),
            ("fifo", new_fifo(4, chunk).unwrap()),
        ];
        for (name, bus) in buses {
            group.bench_with_input(BenchmarkId::new(name, chunk), &chunk, |b, _| {
                b.iter(|| {
                    bus.write(black_box(&data), false, Wait::Immediate).unwrap();
                    black_box(bus.read(&mut out, Wait::Immediate).unwrap());
                });
            });
        }
    }

    group.finish();
}

fn bench_block_zero_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("BlockZeroCopy");
    let bus = new_block(1024, 16).unwrap();

    for &chunk in CHUNK_SIZES {
        group.bench_with_input(BenchmarkId::new("acquire_release", chunk), &chunk, |b, &chunk| {
            let mut wr = Payload::new();
            let mut rd = Payload::new();
            b.iter(|| {
                bus.acquire_write(&mut wr, chunk, Wait::Immediate).unwrap();
                wr.set_valid_size(chunk).unwrap();
                bus.release_write(&mut wr, Wait::Immediate).unwrap();
                bus.acquire_read(&mut rd, chunk, Wait::Immediate).unwrap();
                black_box(rd.valid_size());
                bus.release_read(&mut rd, Wait::Immediate).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("PayloadCache");
    let load = Payload::from_vec(vec![1u8; 4096]);

    for &frame in &[160usize, 480, 1000] {
        group.bench_with_input(BenchmarkId::new("rechunk_4096", frame), &frame, |b, &frame| {
            let mut cache = PayloadCache::new(frame).unwrap();
            b.iter(|| {
                cache.clear();
                cache.load(&load).unwrap();
                loop {
                    let n = cache.acquire(&load, frame).unwrap().len();
                    cache.release();
                    if n < frame || cache.ready_for_load() {
                        break;
                    }
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write_read, bench_block_zero_copy, bench_cache);

criterion_main!(benches);
