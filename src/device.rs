// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The block device contract: an opaque fixed-size block array plus a small
//! header blob, selected by a string tag through a process-wide factory.
//!
//! On-disk layout:
//!
//! ```text
//! [ HEADER_LEN: 4 bytes, big-endian ]
//! [ block_size: u64 BE | block_count: u64 BE | lock: u8 | user header ]
//! [ BLOCK 0 ] [ BLOCK 1 ] ... [ BLOCK N-1 ]
//! ```
//!
//! The lock byte enforces a single writer per named device; `open` with the
//! byte set fails with [`OramError::Locked`] unless the caller passes
//! `ignore_lock` for crash recovery.

pub(crate) mod file;
pub(crate) mod mem;

use crate::{OramError, Result};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

/// Size of the big-endian header length prefix.
pub(crate) const HEADER_LEN_PREFIX: usize = 4;
/// Fixed device metadata inside the header payload: block size, block count,
/// and the lock byte.
pub(crate) const DEVICE_META_LEN: usize = 8 + 8 + 1;
/// Offset of the lock byte from the start of storage.
pub(crate) const LOCK_OFFSET: u64 = (HEADER_LEN_PREFIX + 16) as u64;

/// An opaque array of `block_count` blocks of `block_size` bytes each, plus a
/// small user header blob. Every operation is strictly bounds-checked; the
/// device never interprets block contents.
pub trait BlockDevice {
    /// The name this device was set up or opened under.
    fn storage_name(&self) -> &str;

    /// The fixed size in bytes of every block.
    fn block_size(&self) -> usize;

    /// The number of blocks in the device.
    fn block_count(&self) -> u64;

    /// The user header blob stored at setup or by `update_header_data`.
    fn header_data(&self) -> &[u8];

    /// Atomically replaces the user header. The replacement must have the
    /// same length as the current header.
    fn update_header_data(&mut self, new: &[u8]) -> Result<()>;

    /// Reads block `index`.
    fn read_block(&mut self, index: u64) -> Result<Vec<u8>>;

    /// Writes block `index`. `block` must be exactly `block_size` bytes.
    fn write_block(&mut self, index: u64, block: &[u8]) -> Result<()>;

    /// Reads a batch of blocks, returning them in the requested order. The
    /// device may visit the underlying storage in any order it likes.
    fn read_blocks(&mut self, indices: &[u64]) -> Result<Vec<Vec<u8>>> {
        let mut blocks = Vec::with_capacity(indices.len());
        for &index in indices {
            blocks.push(self.read_block(index)?);
        }
        Ok(blocks)
    }

    /// Writes a batch of blocks. `indices` and `blocks` must have equal
    /// length.
    fn write_blocks(&mut self, indices: &[u64], blocks: &[Vec<u8>]) -> Result<()> {
        if indices.len() != blocks.len() {
            return Err(OramError::InvalidArgument(format!(
                "write_blocks got {} indices but {} blocks",
                indices.len(),
                blocks.len()
            )));
        }
        for (&index, block) in indices.iter().zip(blocks) {
            self.write_block(index, block)?;
        }
        Ok(())
    }

    /// Releases the writer lock and flushes. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Options accepted by every device's `setup`.
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// User header blob stored alongside the block array.
    pub header_data: Vec<u8>,
    /// Overwrite existing storage instead of failing with `AlreadyExists`.
    pub ignore_existing: bool,
}

/// Options accepted by every device's `open`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Bypass the writer lock, for crash recovery.
    pub ignore_lock: bool,
}

/// Block initializer used during setup: maps a block index to its initial
/// contents. The default initializer produces all-zero blocks.
pub type InitializeFn<'a> = dyn FnMut(u64) -> Vec<u8> + 'a;

/// The entry points a backend contributes to the factory registry.
#[derive(Clone, Copy)]
pub struct DeviceDriver {
    /// Allocates storage and writes the initial blocks and header.
    pub setup: fn(
        name: &str,
        block_size: usize,
        block_count: u64,
        initialize: Option<&mut dyn FnMut(u64) -> Vec<u8>>,
        options: &SetupOptions,
    ) -> Result<Box<dyn BlockDevice>>,
    /// Opens existing storage, acquiring the writer lock.
    pub open: fn(name: &str, options: &OpenOptions) -> Result<Box<dyn BlockDevice>>,
}

impl std::fmt::Debug for DeviceDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDriver").finish_non_exhaustive()
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<String, DeviceDriver>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, DeviceDriver>> {
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert("file".to_string(), file::FileDevice::DRIVER);
        map.insert("mem".to_string(), mem::MemDevice::DRIVER);
        Mutex::new(map)
    })
}

/// Registers a backend under `tag`. Fails with `InvalidArgument` if the tag
/// is already taken (the built-in tags are `file` and `mem`).
pub fn register_device(tag: &str, driver: DeviceDriver) -> Result<()> {
    let mut map = registry().lock().unwrap_or_else(PoisonError::into_inner);
    if map.contains_key(tag) {
        return Err(OramError::InvalidArgument(format!(
            "device tag {tag:?} is already registered"
        )));
    }
    map.insert(tag.to_string(), driver);
    Ok(())
}

/// Looks up the backend registered under `tag`.
pub fn device_driver(tag: &str) -> Result<DeviceDriver> {
    let map = registry().lock().unwrap_or_else(PoisonError::into_inner);
    map.get(tag).copied().ok_or_else(|| {
        OramError::InvalidArgument(format!("unknown device tag {tag:?}"))
    })
}

/// The total storage footprint of a device, in bytes: length prefix, header
/// payload, and the block array. With `ignore_header`, only the block array.
pub fn compute_storage_size(
    block_size: usize,
    block_count: u64,
    header_len: usize,
    ignore_header: bool,
) -> u64 {
    let blocks = block_size as u64 * block_count;
    if ignore_header {
        blocks
    } else {
        (HEADER_LEN_PREFIX + DEVICE_META_LEN + header_len) as u64 + blocks
    }
}

/// The parsed fixed-layout header payload shared by the built-in backends.
#[derive(Debug, Clone)]
pub(crate) struct DeviceHeader {
    pub block_size: usize,
    pub block_count: u64,
    pub locked: bool,
    pub user: Vec<u8>,
}

impl DeviceHeader {
    /// The full on-storage prefix: length word plus payload.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = DEVICE_META_LEN + self.user.len();
        let mut out = Vec::with_capacity(HEADER_LEN_PREFIX + payload_len);
        out.extend_from_slice(&(payload_len as u32).to_be_bytes());
        out.extend_from_slice(&(self.block_size as u64).to_be_bytes());
        out.extend_from_slice(&self.block_count.to_be_bytes());
        out.push(u8::from(self.locked));
        out.extend_from_slice(&self.user);
        out
    }

    /// Parses a header payload (the bytes following the length word).
    pub fn decode(name: &str, payload: &[u8]) -> Result<Self> {
        if payload.len() < DEVICE_META_LEN {
            return Err(OramError::Corrupt(format!(
                "{name}: header payload of {} bytes is shorter than the fixed metadata",
                payload.len()
            )));
        }
        let block_size = u64::from_be_bytes(payload[0..8].try_into().map_err(|_| {
            OramError::Corrupt(format!("{name}: unreadable block size"))
        })?);
        let block_count = u64::from_be_bytes(payload[8..16].try_into().map_err(|_| {
            OramError::Corrupt(format!("{name}: unreadable block count"))
        })?);
        if block_size == 0 || block_count == 0 {
            return Err(OramError::Corrupt(format!(
                "{name}: header records an empty device"
            )));
        }
        Ok(DeviceHeader {
            block_size: block_size as usize,
            block_count,
            locked: payload[16] != 0,
            user: payload[DEVICE_META_LEN..].to_vec(),
        })
    }

    /// Byte offset of the first block.
    pub fn blocks_offset(&self) -> u64 {
        (HEADER_LEN_PREFIX + DEVICE_META_LEN + self.user.len()) as u64
    }
}

/// Validates the common setup arguments.
pub(crate) fn check_setup_args(block_size: usize, block_count: u64) -> Result<()> {
    if block_size == 0 {
        return Err(OramError::InvalidArgument(
            "block size must be a positive number of bytes".to_string(),
        ));
    }
    if block_count == 0 {
        return Err(OramError::InvalidArgument(
            "block count must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Bounds-checks a block index against the device geometry.
pub(crate) fn check_block_index(name: &str, index: u64, block_count: u64) -> Result<()> {
    if index >= block_count {
        return Err(OramError::InvalidArgument(format!(
            "{name}: block index {index} out of range (device holds {block_count} blocks)"
        )));
    }
    Ok(())
}

/// Checks that a block to be written has the device's block size.
pub(crate) fn check_block_len(name: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(OramError::InvalidArgument(format!(
            "{name}: block of {got} bytes does not match block size {expected}"
        )));
    }
    Ok(())
}
