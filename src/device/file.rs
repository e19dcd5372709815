// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Local-file block device.

use super::{
    check_block_index, check_block_len, check_setup_args, BlockDevice, DeviceDriver,
    DeviceHeader, InitializeFn, OpenOptions, SetupOptions, HEADER_LEN_PREFIX, LOCK_OFFSET,
};
use crate::{OramError, Result};
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A block device over a regular file.
///
/// Blocks are addressed by absolute offset past the header; batch reads visit
/// offsets in ascending order and restore the requested order on return.
pub(crate) struct FileDevice {
    name: String,
    file: File,
    header: DeviceHeader,
    closed: bool,
}

impl FileDevice {
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

    /// Creates the file and writes the header and all `block_count` blocks.
    pub(crate) fn setup(
        name: &str,
        block_size: usize,
        block_count: u64,
        mut initialize: Option<&mut InitializeFn<'_>>,
        options: &SetupOptions,
    ) -> Result<Self> {
        check_setup_args(block_size, block_count)?;
        if Path::new(name).exists() && !options.ignore_existing {
            return Err(OramError::AlreadyExists(name.to_string()));
        }

        let file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(name)?;

        // The device returned by setup holds the writer lock until closed.
        let header = DeviceHeader {
            block_size,
            block_count,
            locked: true,
            user: options.header_data.clone(),
        };

        let mut write_contents = || -> Result<()> {
            let zeros = vec![0u8; block_size];
            let mut writer = BufWriter::new(&file);
            writer.write_all(&header.encode())?;
            for index in 0..block_count {
                match initialize.as_mut() {
                    Some(init) => {
                        let block = init(index);
                        check_block_len(name, block.len(), block_size)?;
                        writer.write_all(&block)?;
                    }
                    None => writer.write_all(&zeros)?,
                }
            }
            writer.flush()?;
            Ok(())
        };
        if let Err(err) = write_contents() {
            // A failed setup must not leave a half-written device behind.
            drop(file);
            let _ = std::fs::remove_file(name);
            return Err(err);
        }
        file.sync_all()?;

        Ok(FileDevice {
            name: name.to_string(),
            file,
            header,
            closed: false,
        })
    }

    /// Opens an existing file device and acquires the writer lock.
    pub(crate) fn open(name: &str, options: &OpenOptions) -> Result<Self> {
        let mut file = match FsOpenOptions::new().read(true).write(true).open(name) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OramError::NotFound(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let mut len_bytes = [0u8; HEADER_LEN_PREFIX];
        file.read_exact(&mut len_bytes).map_err(|_| {
            OramError::Corrupt(format!("{name}: too short to hold a device header"))
        })?;
        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; payload_len];
        file.read_exact(&mut payload).map_err(|_| {
            OramError::Corrupt(format!("{name}: truncated device header"))
        })?;
        let mut header = DeviceHeader::decode(name, &payload)?;

        let expected = header.blocks_offset()
            + header.block_size as u64 * header.block_count;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(OramError::Corrupt(format!(
                "{name}: file is {actual} bytes, geometry requires {expected}"
            )));
        }

        if header.locked && !options.ignore_lock {
            return Err(OramError::Locked(name.to_string()));
        }
        header.locked = true;
        file.seek(SeekFrom::Start(LOCK_OFFSET))?;
        file.write_all(&[1])?;
        file.flush()?;

        log::debug!(
            "FileDevice::open -- {name}: {} blocks of {} bytes",
            header.block_count,
            header.block_size
        );

        Ok(FileDevice {
            name: name.to_string(),
            file,
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

    fn block_offset(&self, index: u64) -> u64 {
        self.header.blocks_offset() + index * self.header.block_size as u64
    }

    fn read_block_at(&mut self, index: u64) -> Result<Vec<u8>> {
        let mut block = vec![0u8; self.header.block_size];
        self.file.seek(SeekFrom::Start(self.block_offset(index)))?;
        self.file.read_exact(&mut block)?;
        Ok(block)
    }
}

impl BlockDevice for FileDevice {
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
        self.file.seek(SeekFrom::Start(
            (HEADER_LEN_PREFIX + super::DEVICE_META_LEN) as u64,
        ))?;
        self.file.write_all(new)?;
        self.file.flush()?;
        self.header.user = new.to_vec();
        Ok(())
    }

    fn read_block(&mut self, index: u64) -> Result<Vec<u8>> {
        self.ensure_open()?;
        check_block_index(&self.name, index, self.header.block_count)?;
        self.read_block_at(index)
    }

    fn write_block(&mut self, index: u64, block: &[u8]) -> Result<()> {
        self.ensure_open()?;
        check_block_index(&self.name, index, self.header.block_count)?;
        check_block_len(&self.name, block.len(), self.header.block_size)?;
        self.file.seek(SeekFrom::Start(self.block_offset(index)))?;
        self.file.write_all(block)?;
        Ok(())
    }

    fn read_blocks(&mut self, indices: &[u64]) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        for &index in indices {
            check_block_index(&self.name, index, self.header.block_count)?;
        }
        // Visit offsets in ascending order, hand back in request order.
        let mut order: Vec<usize> = (0..indices.len()).collect();
        order.sort_by_key(|&slot| indices[slot]);
        let mut blocks = vec![Vec::new(); indices.len()];
        for slot in order {
            blocks[slot] = self.read_block_at(indices[slot])?;
        }
        Ok(blocks)
    }

    fn write_blocks(&mut self, indices: &[u64], blocks: &[Vec<u8>]) -> Result<()> {
        self.ensure_open()?;
        if indices.len() != blocks.len() {
            return Err(OramError::InvalidArgument(format!(
                "{}: write_blocks got {} indices but {} blocks",
                self.name,
                indices.len(),
                blocks.len()
            )));
        }
        for (&index, block) in indices.iter().zip(blocks) {
            check_block_index(&self.name, index, self.header.block_count)?;
            check_block_len(&self.name, block.len(), self.header.block_size)?;
        }
        for (&index, block) in indices.iter().zip(blocks) {
            self.file.seek(SeekFrom::Start(self.block_offset(index)))?;
            self.file.write_all(block)?;
        }
        self.file.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(LOCK_OFFSET))?;
        self.file.write_all(&[0])?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.header.locked = false;
        self.closed = true;
        Ok(())
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
