// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Path ORAM over encrypted, block-addressable tree-heap storage.
//!
//! A [`PathOram`] session lets a client read and write fixed-size logical
//! blocks against an untrusted backing store while the store's view of the
//! access pattern stays statistically independent of the logical access
//! sequence. The stack, bottom up:
//!
//! - [`device`]: an opaque block-array contract plus a factory keyed by
//!   string tags (`file`, `mem`, and anything registered at runtime).
//! - [`heap`]: pure arithmetic over a virtual k-ary heap of buckets.
//! - [`encrypted`]: AES-CTR/AES-GCM per-block encryption with fresh IVs, so
//!   the store sees only ciphertexts.
//! - [`heap_storage`]: buckets of `Z` slots mapped onto the block array.
//! - [`path_oram`]: the position map, the stash, and the path-eviction state
//!   machine.
//!
//! The position map and stash are client-side secrets; between sessions they
//! travel as a [`ClientState`], in memory or sealed with the device key.

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

pub mod device;
pub mod encrypted;
pub mod error;
pub mod heap;
pub mod heap_storage;
pub mod path_oram;
pub mod stash;
pub mod test_utils;

pub use device::{
    compute_storage_size, register_device, BlockDevice, DeviceDriver, InitializeFn,
    OpenOptions, SetupOptions,
};
pub use encrypted::{AesMode, EncryptedDevice, EncryptedSetupOptions, SecretKey};
pub use error::{OramError, Result};
pub use heap::VirtualHeap;
pub use heap_storage::{BlockRecord, HeapSetupOptions, HeapStorage};
pub use path_oram::{ClientState, PathOram, PathOramOpenOptions, PathOramSetupOptions};
pub use stash::{Stash, StashRecord};

/// The numeric type of logical block ids.
pub type BlockId = u64;
/// The numeric type of heap bucket ids; the root is bucket 0.
pub type BucketId = u64;
/// The numeric type of heap levels; the root is at level 0.
pub type HeapLevel = u32;

/// The parameter `Z` from the Path ORAM literature: slots per bucket.
/// Typical values are 3 or 4; we adopt the more conservative 4.
pub const DEFAULT_BUCKET_CAPACITY: usize = 4;
/// The default heap arity; Path ORAM is usually run over a binary heap.
pub const DEFAULT_HEAP_ARITY: u64 = 2;
/// The tallest supported heap; bucket ids must fit in a `u64`.
pub const MAXIMUM_HEAP_HEIGHT: HeapLevel = 63;
