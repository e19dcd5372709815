// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Benchmarks for the Path ORAM engine over the in-process memory backend.

extern crate criterion;
use core::fmt;
use std::fmt::Display;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use oram_store::test_utils::{mem_setup_options, setup_mem_oram};
use oram_store::AesMode;
use rand::{rngs::StdRng, Rng, SeedableRng};

const CAPACITIES_TO_BENCHMARK: [u64; 2] = [64, 256];
const BLOCK_SIZES_TO_BENCHMARK: [usize; 2] = [64, 4096];
const NUM_RANDOM_OPERATIONS_TO_RUN: u32 = 64;

#[derive(Clone, Copy)]
struct ReadWriteParameters {
    capacity: u64,
    block_size: usize,
}

impl Display for ReadWriteParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(Capacity: {}, Blocksize: {})",
            self.capacity, self.block_size
        )
    }
}

criterion_group!(
    benches,
    benchmark_initialization,
    benchmark_read,
    benchmark_write,
    benchmark_random_operations,
    print_transfer_header,
    report_transfer_per_access,
);
criterion_main!(benches);

fn benchmark_initialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("PathOram::initialization");
    for block_size in BLOCK_SIZES_TO_BENCHMARK {
        for capacity in CAPACITIES_TO_BENCHMARK {
            let parameters = ReadWriteParameters {
                capacity,
                block_size,
            };
            // `ignore_existing` makes every iteration overwrite the same
            // named buffer instead of accumulating new ones.
            group.bench_function(BenchmarkId::from_parameter(parameters), |b| {
                b.iter(|| {
                    setup_mem_oram(
                        "bench-initialization",
                        block_size,
                        capacity,
                        mem_setup_options(4, 2, AesMode::Gcm),
                    )
                })
            });
        }
    }
    group.finish();
}

fn benchmark_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("PathOram::read");
    for block_size in BLOCK_SIZES_TO_BENCHMARK {
        for capacity in CAPACITIES_TO_BENCHMARK {
            let parameters = ReadWriteParameters {
                capacity,
                block_size,
            };
            let mut oram = setup_mem_oram(
                "bench-read",
                block_size,
                capacity,
                mem_setup_options(4, 2, AesMode::Gcm),
            );
            group.bench_function(BenchmarkId::from_parameter(parameters), |b| {
                b.iter(|| oram.read_block(black_box(0)).unwrap())
            });
        }
    }
    group.finish();
}

fn benchmark_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("PathOram::write");
    for block_size in BLOCK_SIZES_TO_BENCHMARK {
        for capacity in CAPACITIES_TO_BENCHMARK {
            let parameters = ReadWriteParameters {
                capacity,
                block_size,
            };
            let mut oram = setup_mem_oram(
                "bench-write",
                block_size,
                capacity,
                mem_setup_options(4, 2, AesMode::Gcm),
            );
            let payload = vec![0xA5u8; block_size];
            group.bench_function(BenchmarkId::from_parameter(parameters), |b| {
                b.iter(|| oram.write_block(black_box(0), black_box(&payload)).unwrap())
            });
        }
    }
    group.finish();
}

fn benchmark_random_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("PathOram::random_operations");
    for block_size in BLOCK_SIZES_TO_BENCHMARK {
        for capacity in CAPACITIES_TO_BENCHMARK {
            let parameters = ReadWriteParameters {
                capacity,
                block_size,
            };
            let mut oram = setup_mem_oram(
                "bench-random",
                block_size,
                capacity,
                mem_setup_options(4, 2, AesMode::Gcm),
            );
            let mut rng = StdRng::seed_from_u64(0);
            let payload = vec![0x5Au8; block_size];
            group.bench_function(BenchmarkId::from_parameter(parameters), |b| {
                b.iter(|| {
                    for _ in 0..NUM_RANDOM_OPERATIONS_TO_RUN {
                        let id = rng.gen_range(0..capacity);
                        if rng.gen() {
                            oram.read_block(black_box(id)).unwrap();
                        } else {
                            oram.write_block(black_box(id), black_box(&payload)).unwrap();
                        }
                    }
                })
            });
        }
    }
    group.finish();
}

fn print_transfer_header(_: &mut Criterion) {
    println!("\nCiphertext bytes transferred per access:");
    println!(
        "{0: <15} | {1: <15} | {2: <15} | {3: <15}",
        "Capacity", "Blocksize", "Sent", "Received"
    );
}

fn report_transfer_per_access(_: &mut Criterion) {
    for block_size in BLOCK_SIZES_TO_BENCHMARK {
        for capacity in CAPACITIES_TO_BENCHMARK {
            let mut oram = setup_mem_oram(
                "bench-transfer",
                block_size,
                capacity,
                mem_setup_options(4, 2, AesMode::Gcm),
            );
            let sent_before = oram.bytes_sent();
            let received_before = oram.bytes_received();
            oram.read_block(black_box(0)).unwrap();
            println!(
                "{0: <15} | {1: <15} | {2: <15} | {3: <15}",
                capacity,
                block_size,
                oram.bytes_sent() - sent_before,
                oram.bytes_received() - received_before
            );
        }
    }
}
