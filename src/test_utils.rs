// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common test utilities shared by the unit tests and benchmarks: in-memory
//! device setup and mirror-array workloads.

#![allow(clippy::needless_range_loop)]

use crate::encrypted::AesMode;
use crate::path_oram::{PathOram, PathOramSetupOptions};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

/// Setup options targeting the in-process `mem` backend.
pub fn mem_setup_options(
    bucket_capacity: usize,
    heap_arity: u64,
    aes_mode: AesMode,
) -> PathOramSetupOptions {
    PathOramSetupOptions {
        storage_type: "mem".to_string(),
        bucket_capacity,
        heap_arity,
        aes_mode,
        ignore_existing: true,
        ..Default::default()
    }
}

/// A deterministic engine over the `mem` backend with the default geometry.
pub fn setup_mem_oram(
    name: &str,
    block_size: usize,
    block_count: u64,
    options: PathOramSetupOptions,
) -> PathOram<StdRng> {
    let rng = StdRng::seed_from_u64(0);
    PathOram::setup(name, block_size, block_count, options, None, rng)
        .expect("in-memory setup should succeed")
}

fn random_payload(rng: &mut StdRng, block_size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; block_size];
    rng.fill_bytes(&mut payload);
    payload
}

/// Runs random reads and writes against the engine and a mirror array,
/// asserting that every read (and every write's returned previous value)
/// matches the mirror.
pub fn test_correctness_random_workload(oram: &mut PathOram<StdRng>, num_operations: u32) {
    let mut rng = StdRng::seed_from_u64(1);
    let capacity = oram.block_count();
    let block_size = oram.block_size();
    let mut mirror_array = vec![vec![0u8; block_size]; capacity as usize];

    for _ in 0..num_operations {
        let random_id = rng.gen_range(0..capacity);
        let read_versus_write: bool = rng.gen();

        if read_versus_write {
            assert_eq!(
                oram.read_block(random_id).unwrap(),
                mirror_array[random_id as usize]
            );
        } else {
            let random_block = random_payload(&mut rng, block_size);
            let previous = oram.write_block(random_id, &random_block).unwrap();
            assert_eq!(previous, mirror_array[random_id as usize]);
            mirror_array[random_id as usize] = random_block;
        }
    }

    for id in 0..capacity {
        assert_eq!(oram.read_block(id).unwrap(), mirror_array[id as usize], "{id}");
    }
}

/// Runs repeated sequential passes of reads and writes over every block,
/// asserting against a mirror array.
pub fn test_correctness_linear_workload(oram: &mut PathOram<StdRng>, num_passes: u32) {
    let mut rng = StdRng::seed_from_u64(2);
    let capacity = oram.block_count();
    let block_size = oram.block_size();
    let mut mirror_array = vec![vec![0u8; block_size]; capacity as usize];

    for _ in 0..num_passes {
        for id in 0..capacity {
            let read_versus_write: bool = rng.gen();

            if read_versus_write {
                assert_eq!(oram.read_block(id).unwrap(), mirror_array[id as usize]);
            } else {
                let random_block = random_payload(&mut rng, block_size);
                oram.write_block(id, &random_block).unwrap();
                mirror_array[id as usize] = random_block;
            }
        }
    }

    for id in 0..capacity {
        assert_eq!(oram.read_block(id).unwrap(), mirror_array[id as usize], "{id}");
    }
}
