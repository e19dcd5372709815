// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM engine.
//!
//! Holds the position map and stash client-side and services every logical
//! access by reading one whole path into the stash, answering from the
//! stash, and greedily writing a re-encrypted path back. The backing store
//! observes only which path was touched, and paths are drawn uniformly at
//! random, independently of the access sequence.

use crate::device::{InitializeFn, OpenOptions};
use crate::encrypted::{open_bytes, seal_bytes, AesMode, SecretKey};
use crate::heap::VirtualHeap;
use crate::heap_storage::{BlockRecord, HeapSetupOptions, HeapStorage};
use crate::stash::{Stash, StashRecord};
use crate::{
    BlockId, BucketId, OramError, Result, DEFAULT_BUCKET_CAPACITY, DEFAULT_HEAP_ARITY,
};
use rand::{CryptoRng, RngCore};
use std::collections::HashMap;

/// Engine metadata at the front of the storage header: the logical block
/// count, big-endian `u64`.
const ORAM_META_LEN: usize = 8;

/// Options accepted by [`PathOram::setup`].
pub struct PathOramSetupOptions {
    /// Backend tag the factory resolves, e.g. `file` or `mem`.
    pub storage_type: String,
    /// Slots per bucket `Z`.
    pub bucket_capacity: usize,
    /// Heap arity `k`.
    pub heap_arity: u64,
    /// Block cipher mode. GCM unless the caller opts into CTR.
    pub aes_mode: AesMode,
    /// Caller-supplied key. Mutually exclusive with `key_size`.
    pub key: Option<SecretKey>,
    /// Size for a freshly generated key. Mutually exclusive with `key`.
    pub key_size: Option<usize>,
    /// User header blob.
    pub header_data: Vec<u8>,
    /// Overwrite existing storage instead of failing with `AlreadyExists`.
    pub ignore_existing: bool,
    /// Hard cap on the stash; exceeding it is an integrity violation.
    pub stash_limit: Option<usize>,
    /// Called as `(buckets_written, bucket_count)` while setup streams the
    /// initial heap out.
    pub progress: Option<Box<dyn FnMut(u64, u64)>>,
}

impl Default for PathOramSetupOptions {
    fn default() -> Self {
        PathOramSetupOptions {
            storage_type: "file".to_string(),
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            heap_arity: DEFAULT_HEAP_ARITY,
            aes_mode: AesMode::Gcm,
            key: None,
            key_size: None,
            header_data: Vec::new(),
            ignore_existing: false,
            stash_limit: None,
            progress: None,
        }
    }
}

impl std::fmt::Debug for PathOramSetupOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathOramSetupOptions")
            .field("storage_type", &self.storage_type)
            .field("bucket_capacity", &self.bucket_capacity)
            .field("heap_arity", &self.heap_arity)
            .field("aes_mode", &self.aes_mode)
            .field("stash_limit", &self.stash_limit)
            .finish_non_exhaustive()
    }
}

/// Options accepted by [`PathOram::open`].
#[derive(Debug, Clone)]
pub struct PathOramOpenOptions {
    /// Backend tag the factory resolves.
    pub storage_type: String,
    /// Bypass the device writer lock, for crash recovery.
    pub ignore_lock: bool,
    /// Hard cap on the stash; exceeding it is an integrity violation.
    pub stash_limit: Option<usize>,
}

impl Default for PathOramOpenOptions {
    fn default() -> Self {
        PathOramOpenOptions {
            storage_type: "file".to_string(),
            ignore_lock: false,
            stash_limit: None,
        }
    }
}

/// The client-side secrets of a device: the position map and the stash.
///
/// Never written to the backing store; between sessions the client either
/// keeps it in memory or persists it sealed with [`ClientState::seal`].
#[derive(Debug, Clone)]
pub struct ClientState {
    /// One current leaf per logical block id.
    pub positions: Vec<BucketId>,
    /// Blocks not yet evicted into the heap.
    pub stash: Stash,
}

impl ClientState {
    /// Seals the state into an AEAD blob under the device key. The payload
    /// size is embedded so [`ClientState::unseal`] can parse the stash.
    pub fn seal<R: RngCore + CryptoRng>(
        &self,
        key: &SecretKey,
        payload_size: usize,
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        let stash_bytes = self.stash.to_bytes(payload_size)?;
        let mut plaintext =
            Vec::with_capacity(16 + self.positions.len() * 8 + stash_bytes.len());
        plaintext.extend_from_slice(&(payload_size as u64).to_be_bytes());
        plaintext.extend_from_slice(&(self.positions.len() as u64).to_be_bytes());
        for &leaf in &self.positions {
            plaintext.extend_from_slice(&leaf.to_be_bytes());
        }
        plaintext.extend_from_slice(&stash_bytes);
        seal_bytes(key, &plaintext, rng)
    }

    /// Opens a blob produced by [`ClientState::seal`]. Fails with
    /// `AuthenticationFailure` on a wrong key or tampering.
    pub fn unseal(key: &SecretKey, sealed: &[u8]) -> Result<Self> {
        let plaintext = open_bytes(key, sealed)?;
        let truncated = || OramError::Corrupt("truncated client state".to_string());
        if plaintext.len() < 16 {
            return Err(truncated());
        }
        let payload_size =
            u64::from_be_bytes(plaintext[0..8].try_into().map_err(|_| truncated())?) as usize;
        let count =
            u64::from_be_bytes(plaintext[8..16].try_into().map_err(|_| truncated())?) as usize;
        let positions_end = count
            .checked_mul(8)
            .and_then(|len| len.checked_add(16))
            .ok_or_else(truncated)?;
        if plaintext.len() < positions_end {
            return Err(truncated());
        }
        let mut positions = Vec::with_capacity(count);
        for chunk in plaintext[16..positions_end].chunks_exact(8) {
            positions.push(u64::from_be_bytes(
                chunk.try_into().map_err(|_| truncated())?,
            ));
        }
        let stash = Stash::from_bytes(&plaintext[positions_end..], payload_size)?;
        Ok(ClientState { positions, stash })
    }
}

/// A Path ORAM device session.
///
/// Exactly one session may hold a named device open; `access` is
/// non-reentrant by construction (`&mut self`). An authentication or
/// integrity failure moves the session into a terminal poisoned state.
pub struct PathOram<R: RngCore + CryptoRng> {
    storage: HeapStorage,
    positions: Vec<BucketId>,
    stash: Stash,
    stash_limit: Option<usize>,
    rng: R,
    poisoned: bool,
    closed: bool,
}

/// The heap geometry implied by a logical block count and setup options:
/// enough leaves for `ceil(M / Z)` buckets.
fn heap_for(block_count: u64, bucket_capacity: usize, heap_arity: u64) -> Result<VirtualHeap> {
    if block_count == 0 {
        return Err(OramError::InvalidArgument(
            "block count must be positive".to_string(),
        ));
    }
    if bucket_capacity == 0 {
        return Err(OramError::InvalidArgument(
            "bucket capacity must be at least 1".to_string(),
        ));
    }
    let leaves = int_div_ceil(block_count, bucket_capacity as u64);
    let height = VirtualHeap::min_height_for_leaves(heap_arity, leaves)?;
    VirtualHeap::new(heap_arity, height)
}

fn int_div_ceil(x: u64, y: u64) -> u64 {
    x / y + u64::from(x % y != 0)
}

/// The initial contents of block `id`: the caller's initializer, or zeros.
fn initial_payload(
    id: BlockId,
    initialize: &mut Option<&mut InitializeFn<'_>>,
    block_size: usize,
) -> Result<Vec<u8>> {
    let payload = match initialize.as_mut() {
        Some(init) => init(id),
        None => vec![0u8; block_size],
    };
    if payload.len() != block_size {
        return Err(OramError::InvalidArgument(format!(
            "initializer produced {} bytes for block {id}, expected {block_size}",
            payload.len()
        )));
    }
    Ok(payload)
}

impl<R: RngCore + CryptoRng> PathOram<R> {
    /// Creates a device holding `block_count` logical blocks of `block_size`
    /// bytes. Every block is tagged with a uniformly random leaf and placed
    /// into the deepest non-full bucket on its path; blocks that do not fit
    /// start out in the stash. `initialize` supplies initial contents
    /// (all-zero blocks otherwise); it is called in heap placement order,
    /// not id order.
    pub fn setup(
        name: &str,
        block_size: usize,
        block_count: u64,
        mut options: PathOramSetupOptions,
        mut initialize: Option<&mut InitializeFn<'_>>,
        mut rng: R,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(OramError::InvalidArgument(
                "block size must be a positive number of bytes".to_string(),
            ));
        }
        let heap = heap_for(block_count, options.bucket_capacity, options.heap_arity)?;
        let bucket_capacity = options.bucket_capacity;

        log::debug!(
            "PathOram::setup -- {name}: M = {block_count}, S = {block_size}, Z = {bucket_capacity}, k = {}, H = {}",
            heap.arity(),
            heap.height()
        );

        // Draw every block's leaf, then place each block into the deepest
        // bucket on its path with a free slot. Overflow starts in the stash.
        let mut positions = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            positions.push(heap.random_leaf_bucket(&mut rng));
        }

        let mut placement: HashMap<BucketId, Vec<BlockId>> = HashMap::new();
        let mut overflow: Vec<BlockId> = Vec::new();
        for id in 0..block_count {
            let mut placed = false;
            for bucket in heap.path_to_root(positions[id as usize]) {
                let occupants = placement.entry(bucket).or_default();
                if occupants.len() < bucket_capacity {
                    occupants.push(id);
                    placed = true;
                    break;
                }
            }
            if !placed {
                overflow.push(id);
            }
        }

        let mut stash = Stash::new();
        for &id in &overflow {
            let payload = initial_payload(id, &mut initialize, block_size)?;
            stash.insert(StashRecord {
                id,
                leaf: positions[id as usize],
                payload,
            });
        }
        if let Some(limit) = options.stash_limit {
            if stash.len() > limit {
                return Err(OramError::IntegrityViolation(format!(
                    "initial stash of {} blocks exceeds the hard cap {limit}",
                    stash.len()
                )));
            }
        }

        let mut header = Vec::with_capacity(ORAM_META_LEN + options.header_data.len());
        header.extend_from_slice(&block_count.to_be_bytes());
        header.extend_from_slice(&options.header_data);

        let heap_options = HeapSetupOptions {
            storage_type: options.storage_type.clone(),
            heap_arity: heap.arity(),
            heap_height: heap.height(),
            bucket_capacity,
            aes_mode: options.aes_mode,
            key: options.key.take(),
            key_size: options.key_size,
            header_data: header,
            ignore_existing: options.ignore_existing,
        };

        let bucket_total = heap.bucket_count();
        let mut buckets_done: u64 = 0;
        let mut init_error: Option<OramError> = None;
        let mut produce_bucket = |bucket: BucketId| -> Vec<BlockRecord> {
            buckets_done += 1;
            if let Some(progress) = options.progress.as_mut() {
                progress(buckets_done, bucket_total);
            }
            let Some(ids) = placement.get(&bucket) else {
                return Vec::new();
            };
            let mut records = Vec::with_capacity(ids.len());
            for &id in ids {
                match initial_payload(id, &mut initialize, block_size) {
                    Ok(payload) => records.push(BlockRecord::new(id, payload)),
                    Err(err) => {
                        init_error = Some(err);
                        return Vec::new();
                    }
                }
            }
            records
        };

        let setup_result = HeapStorage::setup(
            name,
            block_size,
            heap_options,
            Some(&mut produce_bucket),
            &mut rng,
        );
        if let Some(err) = init_error {
            return Err(err);
        }
        let storage = setup_result?;

        Ok(PathOram {
            storage,
            positions,
            stash,
            stash_limit: options.stash_limit,
            rng,
            poisoned: false,
            closed: false,
        })
    }

    /// Opens an existing device with the client state held from the previous
    /// session (or restored with [`ClientState::unseal`]).
    pub fn open(
        name: &str,
        key: SecretKey,
        state: ClientState,
        options: PathOramOpenOptions,
        rng: R,
    ) -> Result<Self> {
        let storage = HeapStorage::open(
            &options.storage_type,
            name,
            key,
            OpenOptions {
                ignore_lock: options.ignore_lock,
            },
        )?;

        let header = storage.header_data();
        if header.len() < ORAM_META_LEN {
            return Err(OramError::Corrupt(format!(
                "{name}: header too short to hold the block count"
            )));
        }
        let block_count = u64::from_be_bytes(header[..ORAM_META_LEN].try_into().map_err(
            |_| OramError::Corrupt(format!("{name}: unreadable block count")),
        )?);

        let heap = storage.heap();
        if block_count > storage.bucket_capacity() as u64 * heap.leaf_bucket_count() {
            return Err(OramError::Corrupt(format!(
                "{name}: {block_count} blocks exceed the heap's leaf capacity"
            )));
        }
        if state.positions.len() as u64 != block_count {
            return Err(OramError::InvalidArgument(format!(
                "client state maps {} blocks, device holds {block_count}",
                state.positions.len()
            )));
        }
        let (first_leaf, last_leaf) = (heap.first_leaf_bucket(), heap.last_leaf_bucket());
        for (id, &leaf) in state.positions.iter().enumerate() {
            if leaf < first_leaf || leaf > last_leaf {
                return Err(OramError::InvalidArgument(format!(
                    "client state maps block {id} to {leaf}, which is not a leaf"
                )));
            }
        }
        for record in state.stash.records() {
            if record.id >= block_count {
                return Err(OramError::InvalidArgument(format!(
                    "client state stashes out-of-range block {}",
                    record.id
                )));
            }
            if record.payload.len() != storage.payload_size() {
                return Err(OramError::InvalidArgument(format!(
                    "client state stashes a payload of {} bytes, device blocks are {}",
                    record.payload.len(),
                    storage.payload_size()
                )));
            }
        }

        Ok(PathOram {
            storage,
            positions: state.positions,
            stash: state.stash,
            stash_limit: options.stash_limit,
            rng,
            poisoned: false,
            closed: false,
        })
    }

    /// The number of logical blocks.
    pub fn block_count(&self) -> u64 {
        self.positions.len() as u64
    }

    /// The logical block size in bytes.
    pub fn block_size(&self) -> usize {
        self.storage.payload_size()
    }

    /// The number of blocks currently in the stash.
    pub fn stash_len(&self) -> usize {
        self.stash.len()
    }

    /// The heap the device is shaped by.
    pub fn heap(&self) -> &VirtualHeap {
        self.storage.heap()
    }

    /// Slots per bucket, `Z`.
    pub fn bucket_capacity(&self) -> usize {
        self.storage.bucket_capacity()
    }

    /// The name of the backing storage.
    pub fn storage_name(&self) -> &str {
        self.storage.storage_name()
    }

    /// The device key.
    pub fn key(&self) -> &SecretKey {
        self.storage.key()
    }

    /// The cipher mode in effect.
    pub fn mode(&self) -> AesMode {
        self.storage.mode()
    }

    /// The user header blob.
    pub fn header_data(&self) -> &[u8] {
        &self.storage.header_data()[ORAM_META_LEN..]
    }

    /// Replaces the user header blob; the length must match.
    pub fn update_header_data(&mut self, new: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let mut full = self.storage.header_data()[..ORAM_META_LEN].to_vec();
        full.extend_from_slice(new);
        let PathOram { storage, rng, .. } = self;
        storage.update_header_data(&full, rng)
    }

    /// Ciphertext bytes written to the backing store.
    pub fn bytes_sent(&self) -> u64 {
        self.storage.bytes_sent()
    }

    /// Ciphertext bytes read from the backing store.
    pub fn bytes_received(&self) -> u64 {
        self.storage.bytes_received()
    }

    /// A snapshot of the client-side secrets, for persistence between
    /// sessions.
    pub fn client_state(&self) -> ClientState {
        ClientState {
            positions: self.positions.clone(),
            stash: self.stash.clone(),
        }
    }

    /// [`Self::client_state`] sealed under the device key.
    pub fn sealed_client_state(&mut self) -> Result<Vec<u8>> {
        let state = self.client_state();
        let payload_size = self.storage.payload_size();
        let PathOram { storage, rng, .. } = self;
        state.seal(storage.key(), payload_size, rng)
    }

    /// Obliviously reads logical block `id`.
    pub fn read_block(&mut self, id: BlockId) -> Result<Vec<u8>> {
        self.access(id, None)
    }

    /// Obliviously writes logical block `id`, returning the payload it held
    /// at the start of the call.
    pub fn write_block(&mut self, id: BlockId, block: &[u8]) -> Result<Vec<u8>> {
        self.access(id, Some(block))
    }

    /// One oblivious access: remaps `id` to a fresh leaf, reads the old
    /// path into the stash, answers from the stash (applying `new_payload`
    /// if given), and greedily evicts the stash back along the path.
    /// Returns the payload observed at the start of the call.
    pub fn access(&mut self, id: BlockId, new_payload: Option<&[u8]>) -> Result<Vec<u8>> {
        self.ensure_usable()?;
        if id >= self.block_count() {
            return Err(OramError::InvalidArgument(format!(
                "block id {id} out of range (device holds {} blocks)",
                self.block_count()
            )));
        }
        if let Some(new) = new_payload {
            if new.len() != self.block_size() {
                return Err(OramError::InvalidArgument(format!(
                    "payload of {} bytes does not match block size {}",
                    new.len(),
                    self.block_size()
                )));
            }
        }

        let result = self.access_inner(id, new_payload);
        if let Err(err) = &result {
            if err.poisons_session() {
                log::warn!(
                    "PathOram::access -- {}: session poisoned: {err}",
                    self.storage.storage_name()
                );
                self.poisoned = true;
            }
        }
        result
    }

    fn access_inner(&mut self, id: BlockId, new_payload: Option<&[u8]>) -> Result<Vec<u8>> {
        let heap = *self.storage.heap();
        let block_count = self.block_count();

        // Remap before any I/O; the position map is authoritative from here.
        let old_leaf = self.positions[id as usize];
        let new_leaf = heap.random_leaf_bucket(&mut self.rng);
        self.positions[id as usize] = new_leaf;

        // Pull the whole path into the stash.
        let path = self.storage.read_path(old_leaf)?;
        for (bucket, records) in path {
            for record in records {
                if record.is_vacant() {
                    continue;
                }
                let record_id = record.id as BlockId;
                if record_id >= block_count {
                    return Err(OramError::IntegrityViolation(format!(
                        "bucket {bucket} holds out-of-range block id {record_id}"
                    )));
                }
                if self.stash.contains(record_id) {
                    return Err(OramError::IntegrityViolation(format!(
                        "block {record_id} is duplicated between bucket {bucket} and the stash"
                    )));
                }
                self.stash.insert(StashRecord {
                    id: record_id,
                    leaf: self.positions[record_id as usize],
                    payload: record.payload,
                });
            }
        }

        // Answer from the stash; the subject block may have been stashed
        // before this access.
        let index = self
            .stash
            .position_of(id)
            .ok_or(OramError::StashBlockMissing(id))?;
        let record = self.stash.record_mut(index);
        record.leaf = new_leaf;
        let previous = record.payload.clone();
        if let Some(new) = new_payload {
            record.payload = new.to_vec();
        }

        // Evict greedily, deepest bucket first.
        let mut selected = Vec::with_capacity(heap.levels() as usize);
        for level in (0..=heap.height()).rev() {
            selected.push(self.stash.take_eligible(
                &heap,
                old_leaf,
                level,
                self.storage.bucket_capacity(),
            ));
        }
        selected.reverse();

        let buckets = selected
            .iter()
            .map(|records| {
                records
                    .iter()
                    .map(|record| BlockRecord::new(record.id, record.payload.clone()))
                    .collect()
            })
            .collect();

        let PathOram { storage, rng, .. } = self;
        if let Err(err) = storage.write_path(old_leaf, buckets, rng) {
            // The write never happened; putting the selected records back
            // leaves the stash holding everything the device no longer
            // durably does.
            for records in selected {
                for record in records {
                    self.stash.insert(record);
                }
            }
            return Err(err);
        }

        if let Some(limit) = self.stash_limit {
            if self.stash.len() > limit {
                return Err(OramError::IntegrityViolation(format!(
                    "stash of {} blocks exceeds the hard cap {limit}",
                    self.stash.len()
                )));
            }
        }

        Ok(previous)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed {
            return Err(OramError::InvalidArgument(
                "session is closed".to_string(),
            ));
        }
        if self.poisoned {
            return Err(OramError::SessionPoisoned);
        }
        Ok(())
    }

    /// Releases the device lock. The client state remains available through
    /// [`Self::client_state`]. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.storage.close()?;
        self.closed = true;
        Ok(())
    }

    /// The total storage footprint a device with this geometry occupies.
    pub fn compute_storage_size(
        block_size: usize,
        block_count: u64,
        options: &PathOramSetupOptions,
    ) -> Result<u64> {
        if block_size == 0 {
            return Err(OramError::InvalidArgument(
                "block size must be a positive number of bytes".to_string(),
            ));
        }
        let heap = heap_for(block_count, options.bucket_capacity, options.heap_arity)?;
        Ok(HeapStorage::compute_storage_size(
            block_size,
            &heap,
            options.bucket_capacity,
            options.aes_mode,
            ORAM_META_LEN + options.header_data.len(),
            false,
        ))
    }
}
