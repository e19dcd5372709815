// Copyright (c) The oram-store Authors.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Encrypted block layer.
//!
//! Wraps a [`BlockDevice`] so that every physical block read or write is
//! indistinguishable: each logical block of `S` bytes is stored as
//! `IV || ciphertext` (CTR) or `IV || ciphertext || tag` (GCM) with a fresh
//! random IV per encryption. The device header is always GCM-sealed with the
//! same key; its plaintext starts with a one-byte mode flag, so opening with
//! the wrong key fails authentication before any block is touched.

use crate::device::{
    self, BlockDevice, InitializeFn, OpenOptions, SetupOptions,
};
use crate::{OramError, Result};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::AesGcm;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::{CryptoRng, RngCore};
use static_assertions::const_assert_eq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The AES block size in bytes; IVs and GCM tags are one block each.
pub const AES_BLOCK_SIZE: usize = 16;
/// IV length prepended to every ciphertext.
pub const IV_SIZE: usize = AES_BLOCK_SIZE;
/// GCM authentication tag length.
pub const TAG_SIZE: usize = AES_BLOCK_SIZE;
/// The AES key sizes accepted by [`SecretKey`], in bytes.
pub const KEY_SIZES: [usize; 3] = [16, 24, 32];
/// Key size used when the caller asks for a fresh key without choosing one.
pub const DEFAULT_KEY_SIZE: usize = 32;

/// Mode flag plus the seal overhead on the header ciphertext.
pub(crate) const HEADER_META_LEN: usize = 1 + IV_SIZE + TAG_SIZE;

const_assert_eq!(IV_SIZE, 16);
const_assert_eq!(TAG_SIZE, 16);

// 16-byte IVs in both modes keep the GCM overhead at exactly two AES blocks.
type Aes128Gcm = AesGcm<Aes128, U16>;
type Aes192Gcm = AesGcm<Aes192, U16>;
type Aes256Gcm = AesGcm<Aes256, U16>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// The block cipher mode applied to block payloads.
///
/// CTR carries no authentication tag; it matches the Path ORAM threat model
/// of a non-adaptive snapshot adversary and is explicit opt-in. GCM rejects
/// tampered blocks with [`OramError::AuthenticationFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesMode {
    /// AES-CTR: overhead of one AES block (the IV), no authentication.
    Ctr,
    /// AES-GCM: overhead of two AES blocks (IV and tag), authenticated.
    Gcm,
}

impl AesMode {
    /// Bytes added to every block by this mode.
    pub const fn block_overhead(self) -> usize {
        match self {
            AesMode::Ctr => IV_SIZE,
            AesMode::Gcm => IV_SIZE + TAG_SIZE,
        }
    }

    fn flag(self) -> u8 {
        match self {
            AesMode::Ctr => 0,
            AesMode::Gcm => 1,
        }
    }

    fn from_flag(flag: u8) -> Result<Self> {
        match flag {
            0 => Ok(AesMode::Ctr),
            1 => Ok(AesMode::Gcm),
            other => Err(OramError::Corrupt(format!(
                "unknown block cipher mode flag {other}"
            ))),
        }
    }
}

/// A 128-, 192-, or 256-bit AES key. Zeroized on drop; `Debug` never prints
/// the key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: Vec<u8>,
}

impl SecretKey {
    /// Wraps caller-supplied key material, validating its length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if !KEY_SIZES.contains(&bytes.len()) {
            return Err(OramError::InvalidArgument(format!(
                "invalid AES key size {} (expected one of {KEY_SIZES:?})",
                bytes.len()
            )));
        }
        Ok(SecretKey {
            bytes: bytes.to_vec(),
        })
    }

    /// Draws a fresh key of `key_size` bytes from `rng`.
    pub fn generate<R: RngCore + CryptoRng>(key_size: usize, rng: &mut R) -> Result<Self> {
        if !KEY_SIZES.contains(&key_size) {
            return Err(OramError::InvalidArgument(format!(
                "invalid AES key size {key_size} (expected one of {KEY_SIZES:?})"
            )));
        }
        let mut bytes = vec![0u8; key_size];
        rng.fill_bytes(&mut bytes);
        Ok(SecretKey { bytes })
    }

    /// The key length in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// The raw key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .field("size", &self.size())
            .finish()
    }
}

fn random_iv<R: RngCore + CryptoRng>(rng: &mut R) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rng.fill_bytes(&mut iv);
    iv
}

fn gcm_seal<R: RngCore + CryptoRng>(
    key: &SecretKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>> {
    let iv = random_iv(rng);
    let nonce = GenericArray::from_slice(&iv);
    let sealed = match key.size() {
        16 => Aes128Gcm::new_from_slice(key.as_bytes())
            .map_err(bad_key)?
            .encrypt(nonce, plaintext),
        24 => Aes192Gcm::new_from_slice(key.as_bytes())
            .map_err(bad_key)?
            .encrypt(nonce, plaintext),
        _ => Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(bad_key)?
            .encrypt(nonce, plaintext),
    }
    .map_err(|_| {
        OramError::InvalidArgument("plaintext not encryptable under AES-GCM".to_string())
    })?;
    let mut out = Vec::with_capacity(IV_SIZE + sealed.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn gcm_open(key: &SecretKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < IV_SIZE + TAG_SIZE {
        return Err(OramError::Corrupt(format!(
            "GCM ciphertext of {} bytes is too short",
            data.len()
        )));
    }
    let nonce = GenericArray::from_slice(&data[..IV_SIZE]);
    let sealed = &data[IV_SIZE..];
    let opened = match key.size() {
        16 => Aes128Gcm::new_from_slice(key.as_bytes())
            .map_err(bad_key)?
            .decrypt(nonce, sealed),
        24 => Aes192Gcm::new_from_slice(key.as_bytes())
            .map_err(bad_key)?
            .decrypt(nonce, sealed),
        _ => Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(bad_key)?
            .decrypt(nonce, sealed),
    };
    opened.map_err(|_| OramError::AuthenticationFailure)
}

fn ctr_apply(key: &SecretKey, iv: &[u8; IV_SIZE], buf: &mut [u8]) -> Result<()> {
    match key.size() {
        16 => Aes128Ctr::new_from_slices(key.as_bytes(), iv)
            .map_err(bad_key)?
            .apply_keystream(buf),
        24 => Aes192Ctr::new_from_slices(key.as_bytes(), iv)
            .map_err(bad_key)?
            .apply_keystream(buf),
        _ => Aes256Ctr::new_from_slices(key.as_bytes(), iv)
            .map_err(bad_key)?
            .apply_keystream(buf),
    }
    Ok(())
}

fn bad_key<E>(_: E) -> OramError {
    OramError::InvalidArgument("AES key rejected by cipher".to_string())
}

/// Seals an arbitrary blob under `key` with AES-GCM and a fresh IV. Used for
/// the device header and for sealed client state.
pub(crate) fn seal_bytes<R: RngCore + CryptoRng>(
    key: &SecretKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>> {
    gcm_seal(key, plaintext, rng)
}

/// Inverse of [`seal_bytes`]; fails with `AuthenticationFailure` on a wrong
/// key or tampered blob.
pub(crate) fn open_bytes(key: &SecretKey, data: &[u8]) -> Result<Vec<u8>> {
    gcm_open(key, data)
}

fn encrypt_block<R: RngCore + CryptoRng>(
    mode: AesMode,
    key: &SecretKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>> {
    match mode {
        AesMode::Gcm => gcm_seal(key, plaintext, rng),
        AesMode::Ctr => {
            let iv = random_iv(rng);
            let mut out = Vec::with_capacity(IV_SIZE + plaintext.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(plaintext);
            ctr_apply(key, &iv, &mut out[IV_SIZE..])?;
            Ok(out)
        }
    }
}

fn decrypt_block(mode: AesMode, key: &SecretKey, data: &[u8]) -> Result<Vec<u8>> {
    match mode {
        AesMode::Gcm => gcm_open(key, data),
        AesMode::Ctr => {
            if data.len() < IV_SIZE {
                return Err(OramError::Corrupt(format!(
                    "CTR ciphertext of {} bytes is too short",
                    data.len()
                )));
            }
            let mut iv = [0u8; IV_SIZE];
            iv.copy_from_slice(&data[..IV_SIZE]);
            let mut out = data[IV_SIZE..].to_vec();
            ctr_apply(key, &iv, &mut out)?;
            Ok(out)
        }
    }
}

/// Options accepted by [`EncryptedDevice::setup`].
#[derive(Debug, Clone)]
pub struct EncryptedSetupOptions {
    /// Block cipher mode; GCM unless the caller opts into CTR.
    pub aes_mode: AesMode,
    /// Caller-supplied key. Mutually exclusive with `key_size`.
    pub key: Option<SecretKey>,
    /// Size for a freshly generated key. Mutually exclusive with `key`.
    pub key_size: Option<usize>,
    /// User header blob, stored GCM-sealed.
    pub header_data: Vec<u8>,
    /// Overwrite existing storage instead of failing with `AlreadyExists`.
    pub ignore_existing: bool,
}

impl Default for EncryptedSetupOptions {
    fn default() -> Self {
        EncryptedSetupOptions {
            aes_mode: AesMode::Gcm,
            key: None,
            key_size: None,
            header_data: Vec::new(),
            ignore_existing: false,
        }
    }
}

impl EncryptedSetupOptions {
    fn resolve_key<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Result<SecretKey> {
        match (&self.key, self.key_size) {
            (Some(_), Some(_)) => Err(OramError::InvalidArgument(
                "only one of key and key_size may be given".to_string(),
            )),
            (Some(key), None) => Ok(key.clone()),
            (None, Some(size)) => SecretKey::generate(size, rng),
            (None, None) => SecretKey::generate(DEFAULT_KEY_SIZE, rng),
        }
    }
}

/// A block device whose contents are opaque to its backing store.
///
/// Exposes the plaintext block size; the wrapped device sees only
/// ciphertexts that are `block_overhead()` bytes larger. Tracks every
/// ciphertext byte crossing this boundary in `bytes_sent` / `bytes_received`
/// for benchmarking.
pub struct EncryptedDevice {
    inner: Box<dyn BlockDevice>,
    key: SecretKey,
    mode: AesMode,
    /// Mode flag followed by the user header, kept decrypted.
    plaintext_header: Vec<u8>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl EncryptedDevice {
    /// Creates encrypted storage behind the backend registered under
    /// `storage_type`. `block_size` is the plaintext block size; the caller's
    /// `initialize` produces plaintext blocks and never reaches the backend
    /// unencrypted.
    pub fn setup<R: RngCore + CryptoRng>(
        storage_type: &str,
        name: &str,
        block_size: usize,
        block_count: u64,
        options: EncryptedSetupOptions,
        mut initialize: Option<&mut InitializeFn<'_>>,
        rng: &mut R,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(OramError::InvalidArgument(
                "block size must be a positive number of bytes".to_string(),
            ));
        }
        let key = options.resolve_key(rng)?;
        let mode = options.aes_mode;
        let driver = device::device_driver(storage_type)?;

        let mut plaintext_header = Vec::with_capacity(1 + options.header_data.len());
        plaintext_header.push(mode.flag());
        plaintext_header.extend_from_slice(&options.header_data);
        let sealed_header = gcm_seal(&key, &plaintext_header, rng)?;

        let device_options = SetupOptions {
            header_data: sealed_header,
            ignore_existing: options.ignore_existing,
        };

        let zeros = vec![0u8; block_size];
        let mut init_error: Option<OramError> = None;
        let mut encrypting_initialize = |index: u64| -> Vec<u8> {
            let plaintext = match initialize.as_mut() {
                Some(init) => init(index),
                None => zeros.clone(),
            };
            if plaintext.len() != block_size {
                init_error = Some(OramError::InvalidArgument(format!(
                    "initializer produced {} bytes for block {index}, expected {block_size}",
                    plaintext.len()
                )));
                return Vec::new();
            }
            match encrypt_block(mode, &key, &plaintext, rng) {
                Ok(ciphertext) => ciphertext,
                Err(err) => {
                    init_error = Some(err);
                    Vec::new()
                }
            }
        };

        let setup_result = (driver.setup)(
            name,
            block_size + mode.block_overhead(),
            block_count,
            Some(&mut encrypting_initialize),
            &device_options,
        );
        if let Some(err) = init_error {
            return Err(err);
        }
        let inner = setup_result?;

        let bytes_sent =
            inner.block_count() * inner.block_size() as u64 + inner.header_data().len() as u64;
        Ok(EncryptedDevice {
            inner,
            key,
            mode,
            plaintext_header,
            bytes_sent,
            bytes_received: 0,
        })
    }

    /// Opens existing encrypted storage. A wrong key fails with
    /// [`OramError::AuthenticationFailure`] at header decrypt.
    pub fn open(
        storage_type: &str,
        name: &str,
        key: SecretKey,
        options: OpenOptions,
    ) -> Result<Self> {
        let driver = device::device_driver(storage_type)?;
        let inner = (driver.open)(name, &options)?;

        let sealed_header = inner.header_data();
        let bytes_received = sealed_header.len() as u64;
        let plaintext_header = gcm_open(&key, sealed_header)?;
        if plaintext_header.is_empty() {
            return Err(OramError::Corrupt(format!(
                "{name}: header is missing the cipher mode flag"
            )));
        }
        let mode = AesMode::from_flag(plaintext_header[0])?;
        if inner.block_size() <= mode.block_overhead() {
            return Err(OramError::Corrupt(format!(
                "{name}: physical block size {} leaves no payload after {} bytes of overhead",
                inner.block_size(),
                mode.block_overhead()
            )));
        }

        Ok(EncryptedDevice {
            inner,
            key,
            mode,
            plaintext_header,
            bytes_sent: 0,
            bytes_received,
        })
    }

    /// The name of the wrapped storage.
    pub fn storage_name(&self) -> &str {
        self.inner.storage_name()
    }

    /// The plaintext block size exposed to callers.
    pub fn block_size(&self) -> usize {
        self.inner.block_size() - self.mode.block_overhead()
    }

    /// The number of blocks.
    pub fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    /// The cipher mode in effect.
    pub fn mode(&self) -> AesMode {
        self.mode
    }

    /// The device key.
    pub fn key(&self) -> &SecretKey {
        &self.key
    }

    /// The decrypted user header.
    pub fn header_data(&self) -> &[u8] {
        &self.plaintext_header[1..]
    }

    /// Re-seals and stores a replacement user header of the same length.
    pub fn update_header_data<R: RngCore + CryptoRng>(
        &mut self,
        new: &[u8],
        rng: &mut R,
    ) -> Result<()> {
        if new.len() != self.header_data().len() {
            return Err(OramError::InvalidArgument(format!(
                "replacement header is {} bytes, current is {}",
                new.len(),
                self.header_data().len()
            )));
        }
        let mut plaintext = Vec::with_capacity(1 + new.len());
        plaintext.push(self.mode.flag());
        plaintext.extend_from_slice(new);
        let sealed = gcm_seal(&self.key, &plaintext, rng)?;
        self.bytes_sent += sealed.len() as u64;
        self.inner.update_header_data(&sealed)?;
        self.plaintext_header = plaintext;
        Ok(())
    }

    /// Reads and decrypts one block.
    pub fn read_block(&mut self, index: u64) -> Result<Vec<u8>> {
        let ciphertext = self.inner.read_block(index)?;
        self.bytes_received += ciphertext.len() as u64;
        decrypt_block(self.mode, &self.key, &ciphertext)
    }

    /// Encrypts under a fresh IV and writes one block.
    pub fn write_block<R: RngCore + CryptoRng>(
        &mut self,
        index: u64,
        block: &[u8],
        rng: &mut R,
    ) -> Result<()> {
        if block.len() != self.block_size() {
            return Err(OramError::InvalidArgument(format!(
                "block of {} bytes does not match block size {}",
                block.len(),
                self.block_size()
            )));
        }
        let ciphertext = encrypt_block(self.mode, &self.key, block, rng)?;
        self.bytes_sent += ciphertext.len() as u64;
        self.inner.write_block(index, &ciphertext)
    }

    /// Batched [`Self::read_block`]; results come back in request order.
    pub fn read_blocks(&mut self, indices: &[u64]) -> Result<Vec<Vec<u8>>> {
        let ciphertexts = self.inner.read_blocks(indices)?;
        let mut blocks = Vec::with_capacity(ciphertexts.len());
        for ciphertext in ciphertexts {
            self.bytes_received += ciphertext.len() as u64;
            blocks.push(decrypt_block(self.mode, &self.key, &ciphertext)?);
        }
        Ok(blocks)
    }

    /// Batched [`Self::write_block`]; every block gets its own fresh IV.
    pub fn write_blocks<R: RngCore + CryptoRng>(
        &mut self,
        indices: &[u64],
        blocks: &[Vec<u8>],
        rng: &mut R,
    ) -> Result<()> {
        let mut ciphertexts = Vec::with_capacity(blocks.len());
        for block in blocks {
            if block.len() != self.block_size() {
                return Err(OramError::InvalidArgument(format!(
                    "block of {} bytes does not match block size {}",
                    block.len(),
                    self.block_size()
                )));
            }
            let ciphertext = encrypt_block(self.mode, &self.key, block, rng)?;
            self.bytes_sent += ciphertext.len() as u64;
            ciphertexts.push(ciphertext);
        }
        self.inner.write_blocks(indices, &ciphertexts)
    }

    /// Ciphertext bytes written through this layer.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Ciphertext bytes read through this layer.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Closes the wrapped device. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    /// The total storage footprint of an encrypted device with the given
    /// plaintext geometry.
    pub fn compute_storage_size(
        block_size: usize,
        block_count: u64,
        mode: AesMode,
        header_len: usize,
        ignore_header: bool,
    ) -> u64 {
        device::compute_storage_size(
            block_size + mode.block_overhead(),
            block_count,
            HEADER_META_LEN + header_len,
            ignore_header,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mem::MemDevice;
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(17)
    }

    #[test]
    fn key_sizes_are_validated() {
        let mut rng = rng();
        for size in KEY_SIZES {
            assert_eq!(SecretKey::generate(size, &mut rng).unwrap().size(), size);
        }
        assert!(SecretKey::generate(20, &mut rng).is_err());
        assert!(SecretKey::from_bytes(&[0u8; 15]).is_err());
    }

    #[test]
    fn secret_key_debug_is_redacted() {
        let mut rng = rng();
        let key = SecretKey::generate(32, &mut rng).unwrap();
        let shown = format!("{key:?}");
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains("bytes: ["));
    }

    #[test]
    fn block_seal_open_round_trip_every_mode_and_key_size() {
        let mut rng = rng();
        for mode in [AesMode::Ctr, AesMode::Gcm] {
            for size in KEY_SIZES {
                let key = SecretKey::generate(size, &mut rng).unwrap();
                let plaintext = vec![0x5A; 96];
                let ciphertext = encrypt_block(mode, &key, &plaintext, &mut rng).unwrap();
                assert_eq!(ciphertext.len(), plaintext.len() + mode.block_overhead());
                assert_eq!(decrypt_block(mode, &key, &ciphertext).unwrap(), plaintext);
            }
        }
    }

    #[test]
    fn repeated_encryption_is_fresh() {
        let mut rng = rng();
        let key = SecretKey::generate(32, &mut rng).unwrap();
        let plaintext = vec![0u8; 128];
        for mode in [AesMode::Ctr, AesMode::Gcm] {
            let first = encrypt_block(mode, &key, &plaintext, &mut rng).unwrap();
            let second = encrypt_block(mode, &key, &plaintext, &mut rng).unwrap();
            assert_ne!(first, second);
        }
    }

    #[test]
    fn gcm_rejects_tampering() {
        let mut rng = rng();
        let key = SecretKey::generate(32, &mut rng).unwrap();
        let mut ciphertext = encrypt_block(AesMode::Gcm, &key, &[7u8; 64], &mut rng).unwrap();
        ciphertext[IV_SIZE + 3] ^= 0x80;
        assert!(matches!(
            decrypt_block(AesMode::Gcm, &key, &ciphertext),
            Err(OramError::AuthenticationFailure)
        ));
    }

    fn setup_device(name: &str, mode: AesMode, rng: &mut StdRng) -> EncryptedDevice {
        let options = EncryptedSetupOptions {
            aes_mode: mode,
            header_data: vec![1, 2, 3],
            ..Default::default()
        };
        EncryptedDevice::setup("mem", name, 64, 8, options, None, rng).unwrap()
    }

    #[test]
    fn device_round_trip_and_geometry() {
        let mut rng = rng();
        for (name, mode) in [
            ("enc-device-ctr", AesMode::Ctr),
            ("enc-device-gcm", AesMode::Gcm),
        ] {
            let mut device = setup_device(name, mode, &mut rng);
            assert_eq!(device.block_size(), 64);
            assert_eq!(device.block_count(), 8);
            assert_eq!(device.header_data(), &[1, 2, 3]);

            // Fresh storage decrypts to the default all-zero blocks.
            assert_eq!(device.read_block(0).unwrap(), vec![0u8; 64]);

            device.write_block(5, &[0xAB; 64], &mut rng).unwrap();
            assert_eq!(device.read_block(5).unwrap(), vec![0xAB; 64]);

            let blocks = device.read_blocks(&[5, 0]).unwrap();
            assert_eq!(blocks[0], vec![0xAB; 64]);
            assert_eq!(blocks[1], vec![0u8; 64]);
        }
    }

    #[test]
    fn reopen_requires_the_right_key() {
        let mut rng = rng();
        let device = setup_device("enc-device-reopen", AesMode::Gcm, &mut rng);
        let key = device.key().clone();
        let mut device = device;
        device.write_block(2, &[9u8; 64], &mut rng).unwrap();
        device.close().unwrap();

        let wrong = SecretKey::generate(32, &mut rng).unwrap();
        assert!(matches!(
            EncryptedDevice::open("mem", "enc-device-reopen", wrong, OpenOptions::default()),
            Err(OramError::AuthenticationFailure)
        ));

        let mut device =
            EncryptedDevice::open("mem", "enc-device-reopen", key, OpenOptions::default())
                .unwrap();
        assert_eq!(device.mode(), AesMode::Gcm);
        assert_eq!(device.read_block(2).unwrap(), vec![9u8; 64]);
    }

    #[test]
    fn header_update_round_trips_through_reopen() {
        let mut rng = rng();
        let mut device = setup_device("enc-device-header", AesMode::Ctr, &mut rng);
        let key = device.key().clone();
        assert!(matches!(
            device.update_header_data(&[0; 2], &mut rng),
            Err(OramError::InvalidArgument(_))
        ));
        device.update_header_data(&[4, 5, 6], &mut rng).unwrap();
        device.close().unwrap();

        let device =
            EncryptedDevice::open("mem", "enc-device-header", key, OpenOptions::default())
                .unwrap();
        assert_eq!(device.header_data(), &[4, 5, 6]);
        assert_eq!(device.mode(), AesMode::Ctr);
    }

    #[test]
    fn corrupted_block_fails_authentication_under_gcm() {
        let mut rng = rng();
        let mut device = setup_device("enc-device-corrupt", AesMode::Gcm, &mut rng);
        let key = device.key().clone();
        device.close().unwrap();

        // Flip one ciphertext byte of block 3 through the raw backend.
        let mut raw = MemDevice::open("enc-device-corrupt", &OpenOptions::default()).unwrap();
        let mut block = crate::device::BlockDevice::read_block(&mut raw, 3).unwrap();
        block[IV_SIZE] ^= 0xFF;
        crate::device::BlockDevice::write_block(&mut raw, 3, &block).unwrap();
        crate::device::BlockDevice::close(&mut raw).unwrap();

        let mut device =
            EncryptedDevice::open("mem", "enc-device-corrupt", key, OpenOptions::default())
                .unwrap();
        assert!(matches!(
            device.read_block(3),
            Err(OramError::AuthenticationFailure)
        ));
        assert!(device.read_block(2).is_ok());
    }

    #[test]
    fn counters_track_ciphertext_traffic() {
        let mut rng = rng();
        let mut device = setup_device("enc-device-counters", AesMode::Gcm, &mut rng);
        let sent_after_setup = device.bytes_sent();
        assert!(sent_after_setup >= 8 * (64 + 32) as u64);

        device.write_block(0, &[1u8; 64], &mut rng).unwrap();
        assert_eq!(device.bytes_sent(), sent_after_setup + 96);
        device.read_block(0).unwrap();
        assert_eq!(device.bytes_received(), 96);
    }

    #[test]
    fn key_and_key_size_are_mutually_exclusive() {
        let mut rng = rng();
        let key = SecretKey::generate(16, &mut rng).unwrap();
        let options = EncryptedSetupOptions {
            key: Some(key),
            key_size: Some(16),
            ..Default::default()
        };
        assert!(matches!(
            EncryptedDevice::setup("mem", "enc-device-excl", 32, 2, options, None, &mut rng),
            Err(OramError::InvalidArgument(_))
        ));
    }

    #[test]
    fn storage_size_accounts_for_mode_overhead() {
        let ctr = EncryptedDevice::compute_storage_size(128, 4, AesMode::Ctr, 0, false);
        let gcm = EncryptedDevice::compute_storage_size(128, 4, AesMode::Gcm, 0, false);
        assert_eq!(gcm - ctr, 4 * TAG_SIZE as u64);
        assert_eq!(
            EncryptedDevice::compute_storage_size(128, 4, AesMode::Ctr, 0, true),
            4 * (128 + IV_SIZE) as u64
        );
    }
}
