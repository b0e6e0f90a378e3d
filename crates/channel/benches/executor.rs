#![allow(missing_docs)]
//! Contains benchmarks for the channel executor.

use criterion::{criterion_group, criterion_main, Criterion};
use sluice_channel::{Chunk, Source};

fn executor(c: &mut Criterion) {
    let mut g = c.benchmark_group("executor");
    g.sample_size(10);

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

    g.bench_function("map_out - 10,000 layers", |b| {
        let channel = (0..10_000)
            .fold(Source::<(), u64, ()>::write(1), |channel, _| channel.map_out(|n| n + 1));
        b.iter(|| runtime.block_on(channel.clone().run_drain()).unwrap());
    });

    g.bench_function("flat_map - 10,000 layers", |b| {
        let channel = (0..10_000u64).fold(Source::<(), u64, u64>::succeed(0), |channel, _| {
            channel.flat_map(|n| Source::succeed(n + 1))
        });
        b.iter(|| runtime.block_on(channel.clone().run_drain()).unwrap());
    });

    g.bench_function("concat_map - 1,000 x 100 elements", |b| {
        let channel = Source::<(), u64, ()>::write_all(0..1_000)
            .concat_map(|n| Source::write_all(n..n + 100));
        b.iter(|| runtime.block_on(channel.clone().run_drain()).unwrap());
    });

    g.bench_function("pipe_to - 100 chunks through split_on_chunk", |b| {
        let input = (0..100)
            .map(|_| Chunk::from(b"alpha,beta,gamma,delta".to_vec()))
            .collect::<Vec<_>>();
        let channel = Source::<(), Chunk<u8>, ()>::write_all(input)
            .pipe_to(sluice_channel::transducers::split_on_chunk(Chunk::single(b',')));
        b.iter(|| runtime.block_on(channel.clone().run_drain()).unwrap());
    });
}

criterion_group!(benches, executor);
criterion_main!(benches);
