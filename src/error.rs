// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Error taxonomy shared by every layer of the crate.

use crate::BlockId;

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, OramError>;

/// The errors surfaced by devices, the encrypted layer, and the ORAM engine.
///
/// Recoverable errors (`InvalidArgument`, `AlreadyExists`, `NotFound`,
/// `Locked`) are raised at the call site without mutating persistent state.
/// `AuthenticationFailure` and `IntegrityViolation` poison the session that
/// observed them; every later operation on that session fails with
/// [`OramError::SessionPoisoned`].
#[derive(Debug, thiserror::Error)]
pub enum OramError {
    /// A caller-supplied parameter is out of range or inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Setup was asked to create a device over existing storage.
    #[error("storage already exists: {0}")]
    AlreadyExists(String),

    /// Open was asked for a device that does not exist.
    #[error("storage not found: {0}")]
    NotFound(String),

    /// Another session holds the device's writer lock.
    #[error("storage locked by another session: {0}")]
    Locked(String),

    /// The stored bytes do not describe a valid device.
    #[error("storage corrupt: {0}")]
    Corrupt(String),

    /// A GCM tag failed to verify on a header or block.
    #[error("authentication failure: ciphertext rejected")]
    AuthenticationFailure,

    /// The device contents or the client state violate an engine invariant.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// After a path read, the subject block was not in the stash.
    #[error("block {0} missing from stash after path read")]
    StashBlockMissing(BlockId),

    /// An earlier integrity failure made this session unusable.
    #[error("session poisoned by an earlier integrity failure")]
    SessionPoisoned,

    /// An I/O failure in the backing store, surfaced unchanged.
    #[error("backend I/O error")]
    BackendIo(#[from] std::io::Error),
}

impl OramError {
    /// Whether this error permanently poisons the session that observed it.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            OramError::AuthenticationFailure
                | OramError::IntegrityViolation(_)
                | OramError::StashBlockMissing(_)
        )
    }
}
