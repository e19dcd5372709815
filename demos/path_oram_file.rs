// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Measures Path ORAM performance when storage is accessed through a local
//! file.

use oram_store::{AesMode, PathOram, PathOramOpenOptions, PathOramSetupOptions};
use rand::rngs::OsRng;
use rand::Rng;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use std::time::Instant;

const STORAGE_NAME: &str = "heap.bin";
// 4KB block size
const BLOCK_SIZE: usize = 4000;
const BLOCK_COUNT: u64 = 256;
const TEST_COUNT: u64 = 100;

fn main() -> oram_store::Result<()> {
    let _ = TermLogger::init(
        LevelFilter::Debug,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );

    let options = PathOramSetupOptions {
        storage_type: "file".to_string(),
        aes_mode: AesMode::Gcm,
        ignore_existing: true,
        progress: Some(Box::new(|done, total| {
            if done % 32 == 0 || done == total {
                println!("Setting up bucket {done}/{total}");
            }
        })),
        ..Default::default()
    };

    println!("Storage Name: {STORAGE_NAME}");
    println!("Block Count: {BLOCK_COUNT}");
    println!("Block Size: {BLOCK_SIZE} bytes");
    println!(
        "Actual Storage Required: {} bytes",
        PathOram::<OsRng>::compute_storage_size(BLOCK_SIZE, BLOCK_COUNT, &options)?
    );
    println!();

    println!("Setting Up Path ORAM Storage");
    let setup_start = Instant::now();
    let mut oram = PathOram::setup(STORAGE_NAME, BLOCK_SIZE, BLOCK_COUNT, options, None, OsRng)?;
    println!(
        "Total Setup Time: {:.2} s",
        setup_start.elapsed().as_secs_f64()
    );
    println!("Current Stash Size: {}", oram.stash_len());
    println!(
        "Total Data Transmission: {} bytes",
        oram.bytes_sent() + oram.bytes_received()
    );
    println!();

    // Close and reopen after setup to reset the transfer counters.
    let key = oram.key().clone();
    let state = oram.client_state();
    oram.close()?;
    let mut oram = PathOram::open(
        STORAGE_NAME,
        key,
        state,
        PathOramOpenOptions::default(),
        OsRng,
    )?;

    println!("Running I/O Performance Test");
    let start = Instant::now();
    for _ in 0..TEST_COUNT {
        let id = OsRng.gen_range(0..BLOCK_COUNT);
        oram.read_block(id)?;
    }
    let elapsed = start.elapsed();

    println!("Current Stash Size: {}", oram.stash_len());
    let per_access = (oram.bytes_sent() + oram.bytes_received()) as f64 / TEST_COUNT as f64;
    println!(
        "Access Block Avg. Data Transmitted: {per_access:.0} bytes ({:.3}x)",
        per_access / BLOCK_SIZE as f64
    );
    println!(
        "Access Block Avg. Latency: {:.2} ms",
        elapsed.as_secs_f64() * 1000.0 / TEST_COUNT as f64
    );

    oram.close()?;
    std::fs::remove_file(STORAGE_NAME)?;
    Ok(())
}
