// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! In-process block device backed by a named RAM buffer.
//!
//! Buffers live in a process-global table keyed by storage name, so setup,
//! reopen, and locking behave like the file backend without touching disk.
//! Intended for tests and ephemeral storage.

use super::{
    check_block_index, check_block_len, check_setup_args, BlockDevice, DeviceDriver,
    DeviceHeader, InitializeFn, OpenOptions, SetupOptions, HEADER_LEN_PREFIX, LOCK_OFFSET,
};
use crate::{OramError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

static STORE: OnceLock<Mutex<HashMap<String, SharedBuffer>>> = OnceLock::new();

fn store() -> &'static Mutex<HashMap<String, SharedBuffer>> {
    STORE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A block device over a named in-process buffer.
pub(crate) struct MemDevice {
    name: String,
    buffer: SharedBuffer,
    header: DeviceHeader,
    closed: bool,
}

impl MemDevice {
    pub(crate) const DRIVER: DeviceDriver = DeviceDriver {
        setup: Self::setup_boxed,
        open: Self::open_boxed,
    };

    fn setup_boxed(
        name: &str,
        block_size: usize,
        block_count: u64,
        initialize: Option<&mut dyn FnMut(u64) -> Vec<u8>>,
        options: &SetupOptions,
    ) -> Result<Box<dyn BlockDevice>> {
        Ok(Box::new(Self::setup(
            name, block_size, block_count, initialize, options,
        )?))
    }

    fn open_boxed(name: &str, options: &OpenOptions) -> Result<Box<dyn BlockDevice>> {
        Ok(Box::new(Self::open(name, options)?))
    }

    /// Allocates a named buffer and fills in the header and blocks.
    pub(crate) fn setup(
        name: &str,
        block_size: usize,
        block_count: u64,
        mut initialize: Option<&mut InitializeFn<'_>>,
        options: &SetupOptions,
    ) -> Result<Self> {
        check_setup_args(block_size, block_count)?;
        {
            let table = store().lock().unwrap_or_else(PoisonError::into_inner);
            if table.contains_key(name) && !options.ignore_existing {
                return Err(OramError::AlreadyExists(name.to_string()));
            }
        }

        let header = DeviceHeader {
            block_size,
            block_count,
            locked: true,
            user: options.header_data.clone(),
        };

        let mut bytes = header.encode();
        bytes.reserve(block_size * block_count as usize);
        let zeros = vec![0u8; block_size];
        for index in 0..block_count {
            match initialize.as_mut() {
                Some(init) => {
                    let block = init(index);
                    check_block_len(name, block.len(), block_size)?;
                    bytes.extend_from_slice(&block);
                }
                None => bytes.extend_from_slice(&zeros),
            }
        }

        let mut table = store().lock().unwrap_or_else(PoisonError::into_inner);
        if table.contains_key(name) && !options.ignore_existing {
            return Err(OramError::AlreadyExists(name.to_string()));
        }
        let buffer = Arc::new(Mutex::new(bytes));
        table.insert(name.to_string(), Arc::clone(&buffer));

        Ok(MemDevice {
            name: name.to_string(),
            buffer,
            header,
            closed: false,
        })
    }

    /// Opens a named buffer and acquires the writer lock.
    pub(crate) fn open(name: &str, options: &OpenOptions) -> Result<Self> {
        let buffer = {
            let table = store().lock().unwrap_or_else(PoisonError::into_inner);
            table
                .get(name)
                .cloned()
                .ok_or_else(|| OramError::NotFound(name.to_string()))?
        };

        let mut header = {
            let bytes = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            if bytes.len() < HEADER_LEN_PREFIX {
                return Err(OramError::Corrupt(format!(
                    "{name}: too short to hold a device header"
                )));
            }
            let payload_len = u32::from_be_bytes(
                bytes[0..HEADER_LEN_PREFIX].try_into().map_err(|_| {
                    OramError::Corrupt(format!("{name}: unreadable header length"))
                })?,
            ) as usize;
            if bytes.len() < HEADER_LEN_PREFIX + payload_len {
                return Err(OramError::Corrupt(format!(
                    "{name}: truncated device header"
                )));
            }
            DeviceHeader::decode(name, &bytes[HEADER_LEN_PREFIX..HEADER_LEN_PREFIX + payload_len])?
        };

        {
            let mut bytes = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let expected =
                header.blocks_offset() + header.block_size as u64 * header.block_count;
            if bytes.len() as u64 != expected {
                return Err(OramError::Corrupt(format!(
                    "{name}: buffer is {} bytes, geometry requires {expected}",
                    bytes.len()
                )));
            }
            if header.locked && !options.ignore_lock {
                return Err(OramError::Locked(name.to_string()));
            }
            bytes[LOCK_OFFSET as usize] = 1;
            header.locked = true;
        }

        Ok(MemDevice {
            name: name.to_string(),
            buffer,
            header,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(OramError::InvalidArgument(format!(
                "{}: device is closed",
                self.name
            )));
        }
        Ok(())
    }

    fn block_range(&self, index: u64) -> std::ops::Range<usize> {
        let start = self.header.blocks_offset() as usize
            + index as usize * self.header.block_size;
        start..start + self.header.block_size
    }
}

impl BlockDevice for MemDevice {
    fn storage_name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> usize {
        self.header.block_size
    }

    fn block_count(&self) -> u64 {
        self.header.block_count
    }

    fn header_data(&self) -> &[u8] {
        &self.header.user
    }

    fn update_header_data(&mut self, new: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if new.len() != self.header.user.len() {
            return Err(OramError::InvalidArgument(format!(
                "{}: replacement header is {} bytes, current is {}",
                self.name,
                new.len(),
                self.header.user.len()
            )));
        }
        let mut bytes = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let start = HEADER_LEN_PREFIX + super::DEVICE_META_LEN;
        bytes[start..start + new.len()].copy_from_slice(new);
        drop(bytes);
        self.header.user = new.to_vec();
        Ok(())
    }

    fn read_block(&mut self, index: u64) -> Result<Vec<u8>> {
        self.ensure_open()?;
        check_block_index(&self.name, index, self.header.block_count)?;
        let bytes = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(bytes[self.block_range(index)].to_vec())
    }

    fn write_block(&mut self, index: u64, block: &[u8]) -> Result<()> {
        self.ensure_open()?;
        check_block_index(&self.name, index, self.header.block_count)?;
        check_block_len(&self.name, block.len(), self.header.block_size)?;
        let range = self.block_range(index);
        let mut bytes = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        bytes[range].copy_from_slice(block);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut bytes = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        bytes[LOCK_OFFSET as usize] = 0;
        drop(bytes);
        self.header.locked = false;
        self.closed = true;
        Ok(())
    }
}

impl Drop for MemDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_reopen_round_trip() {
        let name = "mem-device-round-trip";
        let mut init = |i: u64| vec![i as u8; 16];
        let options = SetupOptions {
            header_data: vec![7, 7],
            ..Default::default()
        };
        let mut device = MemDevice::setup(name, 16, 4, Some(&mut init), &options).unwrap();
        device.write_block(2, &[0xCC; 16]).unwrap();
        device.close().unwrap();

        let mut device = MemDevice::open(name, &OpenOptions::default()).unwrap();
        assert_eq!(device.header_data(), &[7, 7]);
        assert_eq!(device.read_block(0).unwrap(), vec![0u8; 16]);
        assert_eq!(device.read_block(2).unwrap(), vec![0xCC; 16]);
    }

    #[test]
    fn second_setup_needs_ignore_existing() {
        let name = "mem-device-exists";
        MemDevice::setup(name, 8, 1, None, &SetupOptions::default())
            .unwrap()
            .close()
            .unwrap();
        assert!(matches!(
            MemDevice::setup(name, 8, 1, None, &SetupOptions::default()),
            Err(OramError::AlreadyExists(_))
        ));
        let options = SetupOptions {
            ignore_existing: true,
            ..Default::default()
        };
        MemDevice::setup(name, 8, 1, None, &options).unwrap();
    }

    #[test]
    fn missing_name_fails_not_found() {
        assert!(matches!(
            MemDevice::open("mem-device-nowhere", &OpenOptions::default()),
            Err(OramError::NotFound(_))
        ));
    }

    #[test]
    fn lock_excludes_second_opener() {
        let name = "mem-device-lock";
        MemDevice::setup(name, 8, 1, None, &SetupOptions::default())
            .unwrap()
            .close()
            .unwrap();
        let first = MemDevice::open(name, &OpenOptions::default()).unwrap();
        assert!(matches!(
            MemDevice::open(name, &OpenOptions::default()),
            Err(OramError::Locked(_))
        ));
        MemDevice::open(name, &OpenOptions { ignore_lock: true }).unwrap();
        drop(first);
    }

    #[test]
    fn batch_defaults_preserve_request_order() {
        let name = "mem-device-batch";
        let mut init = |i: u64| vec![i as u8; 4];
        let mut device =
            MemDevice::setup(name, 4, 5, Some(&mut init), &SetupOptions::default()).unwrap();
        let blocks = device.read_blocks(&[3, 0, 4]).unwrap();
        assert_eq!(blocks[0], vec![3u8; 4]);
        assert_eq!(blocks[1], vec![0u8; 4]);
        assert_eq!(blocks[2], vec![4u8; 4]);
    }
}
