//! Benchmarks for lease pool construction and block selection.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use weftnet::cidr_pool::CidrPool;

/// The first `count` /24 blocks of 10.255.0.0/16, skipping the network block.
fn taken_blocks(count: usize) -> Vec<String> {
    (1..=count)
        .map(|i| format!("10.255.{}.0/24", i))
        .collect()
}

fn bench_new_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("new_pool");

    for mask in [20u8, 24, 28] {
        group.bench_with_input(BenchmarkId::new("single_network", mask), &mask, |b, &mask| {
            b.iter(|| CidrPool::new(black_box(&["10.255.0.0/16"]), mask))
        });
    }

    group.bench_function("two_networks_24", |b| {
        b.iter(|| CidrPool::new(black_box(&["10.255.0.0/16", "10.250.0.0/16"]), 24))
    });

    group.finish();
}

fn bench_available_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_available_block");
    let pool = match CidrPool::new(&["10.255.0.0/16"], 24) {
        Ok(pool) => pool,
        Err(e) => panic!("bench pool: {}", e),
    };

    for taken in [0usize, 64, 200, 254] {
        let blocks = taken_blocks(taken);
        group.bench_with_input(BenchmarkId::new("taken", taken), &blocks, |b, blocks| {
            b.iter(|| pool.get_available_block(black_box(blocks)))
        });
    }

    group.finish();
}

fn bench_available_single_ip(c: &mut Criterion) {
    let pool = match CidrPool::new(&["10.255.0.0/16"], 24) {
        Ok(pool) => pool,
        Err(e) => panic!("bench pool: {}", e),
    };
    let taken: Vec<String> = (1..200).map(|i| format!("10.255.0.{}/32", i)).collect();

    c.bench_function("get_available_single_ip", |b| {
        b.iter(|| pool.get_available_single_ip(black_box(&taken)))
    });
}

criterion_group!(
    benches,
    bench_new_pool,
    bench_available_block,
    bench_available_single_ip
);
criterion_main!(benches);
