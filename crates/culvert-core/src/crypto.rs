//! Cryptographic primitives for the secure datagram protocol.
//!
//! Provides three things:
//!   1. CBC block decryption/encryption behind a mode enum
//!   2. Frame digest computation (BLAKE3 or SHA-256)
//!   3. A constant-time comparison for digest verification
//!
//! Key material is held in `Zeroizing` buffers and wiped on drop.
//! There is no unsafe code in this module.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Largest digest any supported mode produces, in bytes.
pub const MAX_HASH_LEN: usize = 32;

// ── Cipher ───────────────────────────────────────────────────────────────────

/// Block cipher modes the frame layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMode {
    Aes128Cbc,
    Aes256Cbc,
}

impl EncryptionMode {
    /// Cipher block size in bytes. Also the IV length.
    pub fn block_size(&self) -> usize {
        16
    }

    /// Required key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            EncryptionMode::Aes128Cbc => 16,
            EncryptionMode::Aes256Cbc => 32,
        }
    }
}

/// A CBC cipher with an installed key.
///
/// Cloning is cheap enough to hand a copy to a worker per packet; the clone
/// carries its own `Zeroizing` key buffer, so replacing the original never
/// mutates material a worker is still reading.
#[derive(Clone)]
pub struct CbcCipher {
    mode: EncryptionMode,
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for CbcCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CbcCipher")
            .field("mode", &self.mode)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl CbcCipher {
    pub fn new(mode: EncryptionMode, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != mode.key_len() {
            return Err(CryptoError::KeyLength {
                expected: mode.key_len(),
                got: key.len(),
            });
        }
        Ok(CbcCipher {
            mode,
            key: Zeroizing::new(key.to_vec()),
        })
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn block_size(&self) -> usize {
        self.mode.block_size()
    }

    /// CBC-decrypt `ciphertext` into the front of `plaintext`.
    ///
    /// `ciphertext` must be a whole number of blocks and `plaintext` at
    /// least as long; the IV is consumed by value, so callers keep their
    /// copy of it.
    pub fn decrypt(
        &self,
        iv: &[u8],
        ciphertext: &[u8],
        plaintext: &mut [u8],
    ) -> Result<(), CryptoError> {
        if iv.len() != self.block_size() {
            return Err(CryptoError::IvLength {
                expected: self.block_size(),
                got: iv.len(),
            });
        }
        if ciphertext.len() % self.block_size() != 0 || plaintext.len() < ciphertext.len() {
            return Err(CryptoError::BlockAlignment);
        }

        match self.mode {
            EncryptionMode::Aes128Cbc => {
                let dec = cbc::Decryptor::<aes::Aes128>::new_from_slices(&self.key, iv)
                    .map_err(|_| CryptoError::BlockAlignment)?;
                dec.decrypt_padded_b2b_mut::<NoPadding>(ciphertext, plaintext)
                    .map_err(|_| CryptoError::BlockAlignment)?;
            }
            EncryptionMode::Aes256Cbc => {
                let dec = cbc::Decryptor::<aes::Aes256>::new_from_slices(&self.key, iv)
                    .map_err(|_| CryptoError::BlockAlignment)?;
                dec.decrypt_padded_b2b_mut::<NoPadding>(ciphertext, plaintext)
                    .map_err(|_| CryptoError::BlockAlignment)?;
            }
        }
        Ok(())
    }

    /// CBC-encrypt `plaintext` into the front of `ciphertext`.
    ///
    /// `plaintext` must already be padded to a whole number of blocks.
    pub fn encrypt(
        &self,
        iv: &[u8],
        plaintext: &[u8],
        ciphertext: &mut [u8],
    ) -> Result<(), CryptoError> {
        if iv.len() != self.block_size() {
            return Err(CryptoError::IvLength {
                expected: self.block_size(),
                got: iv.len(),
            });
        }
        if plaintext.len() % self.block_size() != 0 || ciphertext.len() < plaintext.len() {
            return Err(CryptoError::BlockAlignment);
        }

        match self.mode {
            EncryptionMode::Aes128Cbc => {
                let enc = cbc::Encryptor::<aes::Aes128>::new_from_slices(&self.key, iv)
                    .map_err(|_| CryptoError::BlockAlignment)?;
                enc.encrypt_padded_b2b_mut::<NoPadding>(plaintext, ciphertext)
                    .map_err(|_| CryptoError::BlockAlignment)?;
            }
            EncryptionMode::Aes256Cbc => {
                let enc = cbc::Encryptor::<aes::Aes256>::new_from_slices(&self.key, iv)
                    .map_err(|_| CryptoError::BlockAlignment)?;
                enc.encrypt_padded_b2b_mut::<NoPadding>(plaintext, ciphertext)
                    .map_err(|_| CryptoError::BlockAlignment)?;
            }
        }
        Ok(())
    }
}

// ── Digest ───────────────────────────────────────────────────────────────────

/// Digest modes usable for the frame integrity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashMode {
    Blake3,
    Sha256,
}

impl HashMode {
    /// Digest length in bytes; this is also the size of the frame's hash
    /// field when the mode is enabled.
    pub fn hash_size(&self) -> usize {
        32
    }

    pub fn digest(&self, data: &[u8]) -> [u8; MAX_HASH_LEN] {
        match self {
            HashMode::Blake3 => *blake3::hash(data).as_bytes(),
            HashMode::Sha256 => Sha256::digest(data).into(),
        }
    }
}

/// Compare two byte slices without leaking the position of the first
/// difference through timing.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("key must be {expected} bytes, got {got}")]
    KeyLength { expected: usize, got: usize },

    #[error("IV must be {expected} bytes, got {got}")]
    IvLength { expected: usize, got: usize },

    #[error("data length is not a whole number of cipher blocks")]
    BlockAlignment,
}

// ── Tests ────────────────────────────────────────────────────────────────────
