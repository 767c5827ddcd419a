use criterion::{criterion_group, criterion_main, Criterion};
use voz::rollbuf::RollBuffer;
use voz::{CHUNK_SIZE, FRAME_SIZE, OVERLAP_SIZE};

fn benchmark_append_shift(c: &mut Criterion) {
    // the capture-side hot path: one 80ms chunk in, one frame out
    let mut rb = RollBuffer::<i16>::new(FRAME_SIZE + OVERLAP_SIZE + CHUNK_SIZE);
    let chunk = vec![0i16; CHUNK_SIZE];

    c.bench_function("append_80ms_chunk", |b| {
        b.iter(|| {
            rb.append(&chunk);
            if rb.len() >= FRAME_SIZE + OVERLAP_SIZE {
                rb.shift(FRAME_SIZE);
            }
        })
    });
}

fn benchmark_rolling_append(c: &mut Criterion) {
    // steady-state overrun: every append shifts the prefix out
    let mut rb = RollBuffer::<i16>::new(CHUNK_SIZE * 2);
    let chunk = vec![0i16; CHUNK_SIZE];
    rb.append(&chunk);
    rb.append(&chunk);

    c.bench_function("append_full_buffer", |b| {
        b.iter(|| {
            rb.append(&chunk);
        })
    });
}

criterion_group!(benches, benchmark_append_shift, benchmark_rolling_append);
criterion_main!(benches);
