//! Secure datagram frame layout.
//!
//! These constants and offsets ARE the protocol. A frame on the carrier
//! looks like this, with every multi-byte integer little-endian:
//!
//! ```text
//! [ IV (block_size bytes, iff encryption)     ]   <- not covered by the digest
//! [ header                                    ]
//!     [ OTP field (iff OTP enabled)           ]
//!         seed_id : u16
//!         otp     : u16
//!     [ hash field (iff digest enabled)       ]
//! [ payload (0 .. payload MTU bytes)          ]
//! [ 0x01 terminator       (iff encryption)    ]
//! [ zero padding to block boundary (iff enc)  ]
//! ```
//!
//! The digest covers header plus payload with the hash field zeroed. The
//! padding terminator sits inside the encrypted region, so a flipped
//! padding byte is caught before the header is even looked at.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{CbcCipher, CryptoError, EncryptionMode, HashMode};

/// Byte value terminating the payload inside the encrypted region.
pub const PADDING_TERMINATOR: u8 = 0x01;

/// Wire size of the OTP header field.
pub const OTP_FIELD_LEN: usize = 4;

// ── Header fields ────────────────────────────────────────────────────────────

/// The replay-guard field at the front of the header.
///
/// Present iff the parameters enable OTP. `seed_id` names the seed the
/// password was drawn from; `otp` is the password itself.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct OtpField {
    pub seed_id: U16<LittleEndian>,
    pub otp: U16<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(OtpField, [u8; OTP_FIELD_LEN]);

// ── Parameters ───────────────────────────────────────────────────────────────

/// OTP replay-guard parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpParams {
    /// Passwords derived per seed. Once all are spent the seed is useless.
    pub num_otps: u32,
}

/// Negotiated security features of a frame stream.
///
/// Every feature is independent; the header layout follows from which ones
/// are enabled. Both peers must agree on the full record or nothing parses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityParams {
    pub encryption: Option<EncryptionMode>,
    pub hash: Option<HashMode>,
    pub otp: Option<OtpParams>,
}

impl SecurityParams {
    /// Header length implied by the enabled features.
    pub fn header_len(&self) -> usize {
        let otp = if self.otp.is_some() { OTP_FIELD_LEN } else { 0 };
        let hash = self.hash.map_or(0, |h| h.hash_size());
        otp + hash
    }

    /// Offset of the OTP field within the header. The OTP field always
    /// precedes the hash field.
    pub fn otp_field_offset(&self) -> usize {
        0
    }

    /// Offset of the hash field within the header.
    pub fn hash_field_offset(&self) -> usize {
        if self.otp.is_some() {
            OTP_FIELD_LEN
        } else {
            0
        }
    }

    /// Carrier MTU needed to move payloads up to `payload_mtu` bytes.
    ///
    /// With encryption the carrier holds the IV plus the padded plaintext;
    /// the `+ 1` accounts for the padding terminator, which must fit even
    /// for a maximum-size payload.
    pub fn carrier_mtu_for_payload_mtu(&self, payload_mtu: usize) -> usize {
        let base = self.header_len() + payload_mtu;
        match self.encryption {
            Some(mode) => {
                let block = mode.block_size();
                block + align_up(base + 1, block)
            }
            None => base,
        }
    }

    /// Size of the plaintext scratch buffer a decoder needs for payloads up
    /// to `payload_mtu` bytes: the padded plaintext without the IV.
    pub fn plaintext_buffer_len(&self, payload_mtu: usize) -> usize {
        let base = self.header_len() + payload_mtu;
        match self.encryption {
            Some(mode) => align_up(base + 1, mode.block_size()),
            None => base,
        }
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

// ── Padding ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PaddingError {
    /// A byte other than 0x00 appeared before the terminator.
    #[error("padding holds a nonzero byte before the terminator")]
    StrayByte,

    /// The whole final block is zero; the terminator is missing.
    #[error("padding block has no terminator")]
    NoTerminator,
}

/// Locate the payload end in decrypted plaintext.
///
/// Scans the final block from the tail: zero bytes are padding, the first
/// nonzero byte must be the terminator. Returns the plaintext length
/// excluding the terminator. `plaintext` must span at least one block.
pub fn scan_padding(plaintext: &[u8], block_size: usize) -> Result<usize, PaddingError> {
    debug_assert!(plaintext.len() >= block_size);

    let window = plaintext.len() - block_size;
    for i in (window..plaintext.len()).rev() {
        match plaintext[i] {
            PADDING_TERMINATOR => return Ok(i),
            0x00 => {}
            _ => return Err(PaddingError::StrayByte),
        }
    }
    Err(PaddingError::NoTerminator)
}

// ── Encoding ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("parameters enable encryption but no cipher was provided")]
    MissingCipher,

    #[error("cipher mode does not match the frame parameters")]
    CipherMismatch,

    #[error("parameters require a one-time password for every frame")]
    MissingOtp,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Build a complete frame around `payload`.
///
/// `otp` supplies the `(seed_id, otp)` pair when the parameters enable the
/// replay guard; `cipher` must be present iff encryption is enabled. The IV
/// is drawn from `rng`. The caller is responsible for keeping `payload`
/// within the peer's payload MTU.
pub fn encode_frame(
    params: &SecurityParams,
    cipher: Option<&CbcCipher>,
    otp: Option<(u16, u16)>,
    payload: &[u8],
    rng: &mut impl RngCore,
) -> Result<Vec<u8>, FrameError> {
    let header_len = params.header_len();
    let mut plain = vec![0u8; header_len];

    if params.otp.is_some() {
        let (seed_id, otp) = otp.ok_or(FrameError::MissingOtp)?;
        let field = OtpField {
            seed_id: U16::new(seed_id),
            otp: U16::new(otp),
        };
        let off = params.otp_field_offset();
        plain[off..off + OTP_FIELD_LEN].copy_from_slice(field.as_bytes());
    } else {
        debug_assert!(otp.is_none(), "OTP supplied but not enabled by the parameters");
    }

    plain.extend_from_slice(payload);

    // The hash field is still zero here, which is exactly the state the
    // digest is computed over on both sides.
    if let Some(mode) = params.hash {
        let digest = mode.digest(&plain);
        let off = params.hash_field_offset();
        plain[off..off + mode.hash_size()].copy_from_slice(&digest[..mode.hash_size()]);
    }

    let Some(mode) = params.encryption else {
        return Ok(plain);
    };
    let cipher = cipher.ok_or(FrameError::MissingCipher)?;
    if cipher.mode() != mode {
        return Err(FrameError::CipherMismatch);
    }

    let block = mode.block_size();
    plain.push(PADDING_TERMINATOR);
    let padded_len = align_up(plain.len(), block);
    plain.resize(padded_len, 0x00);

    let mut frame = vec![0u8; block + padded_len];
    rng.fill_bytes(&mut frame[..block]);
    let (iv, ciphertext) = frame.split_at_mut(block);
    cipher.encrypt(iv, &plain, ciphertext)?;
    Ok(frame)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn full_params() -> SecurityParams {
        SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            hash: Some(HashMode::Blake3),
            otp: Some(OtpParams { num_otps: 16 }),
        }
    }

    #[test]
    fn header_layout_follows_enabled_features() {
        let none = SecurityParams::default();
        assert_eq!(none.header_len(), 0);

        let hash_only = SecurityParams {
            hash: Some(HashMode::Sha256),
            ..Default::default()
        };
        assert_eq!(hash_only.header_len(), 32);
        assert_eq!(hash_only.hash_field_offset(), 0);

        let full = full_params();
        assert_eq!(full.header_len(), 36);
        assert_eq!(full.otp_field_offset(), 0);
        assert_eq!(full.hash_field_offset(), 4);
    }

    #[test]
    fn carrier_mtu_without_encryption_is_header_plus_payload() {
        let params = SecurityParams {
            hash: Some(HashMode::Blake3),
            ..Default::default()
        };
        assert_eq!(params.carrier_mtu_for_payload_mtu(1000), 1032);
    }

    #[test]
    fn carrier_mtu_with_encryption_rounds_to_blocks() {
        // header 36 + payload 1000 + terminator = 1037, padded to 1040,
        // plus a 16-byte IV.
        let params = full_params();
        assert_eq!(params.carrier_mtu_for_payload_mtu(1000), 1056);
        assert_eq!(params.plaintext_buffer_len(1000), 1040);
    }

    #[test]
    fn zero_payload_still_needs_a_padding_block() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            ..Default::default()
        };
        // terminator alone forces one block, plus the IV
        assert_eq!(params.carrier_mtu_for_payload_mtu(0), 32);
    }

    #[test]
    fn padding_scan_finds_the_terminator() {
        let mut block = vec![0xEEu8; 16];
        block[9] = PADDING_TERMINATOR;
        block[10..].fill(0x00);
        assert_eq!(scan_padding(&block, 16), Ok(9));
    }

    #[test]
    fn padding_scan_accepts_terminator_as_last_byte() {
        let mut block = vec![0xEEu8; 16];
        block[15] = PADDING_TERMINATOR;
        assert_eq!(scan_padding(&block, 16), Ok(15));
    }

    #[test]
    fn padding_scan_rejects_stray_bytes() {
        // tail reads ... 0x02 0x00 0x00: the first nonzero byte from the
        // back is not the terminator
        let mut block = vec![0u8; 16];
        block[13] = 0x02;
        assert_eq!(scan_padding(&block, 16), Err(PaddingError::StrayByte));
    }

    #[test]
    fn padding_scan_rejects_all_zero_block() {
        let block = vec![0u8; 32];
        assert_eq!(scan_padding(&block, 16), Err(PaddingError::NoTerminator));
    }

    #[test]
    fn plain_frame_is_header_then_payload() {
        let params = SecurityParams {
            otp: Some(OtpParams { num_otps: 4 }),
            ..Default::default()
        };
        let frame = encode_frame(
            &params,
            None,
            Some((0x0102, 0x0304)),
            &[0xAA, 0xBB],
            &mut rand::thread_rng(),
        )
        .unwrap();

        // seed_id and otp little-endian, then the payload
        assert_eq!(frame, vec![0x02, 0x01, 0x04, 0x03, 0xAA, 0xBB]);
    }

    #[test]
    fn encrypted_frame_decrypts_back_to_padded_plaintext() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            ..Default::default()
        };
        let cipher = CbcCipher::new(EncryptionMode::Aes128Cbc, &[0x11; 16]).unwrap();

        let payload = [0x55u8; 5];
        let frame = encode_frame(
            &params,
            Some(&cipher),
            None,
            &payload,
            &mut rand::thread_rng(),
        )
        .unwrap();
        assert_eq!(frame.len(), 32); // IV + one block

        let mut plain = vec![0u8; 16];
        cipher.decrypt(&frame[..16], &frame[16..], &mut plain).unwrap();
        assert_eq!(&plain[..5], &payload);
        assert_eq!(plain[5], PADDING_TERMINATOR);
        assert!(plain[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn encryption_without_cipher_is_an_error() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            ..Default::default()
        };
        let err = encode_frame(&params, None, None, b"x", &mut rand::thread_rng()).unwrap_err();
        assert!(matches!(err, FrameError::MissingCipher));
    }

    #[test]
    fn digest_field_verifies_over_zeroed_header() {
        let params = SecurityParams {
            hash: Some(HashMode::Sha256),
            ..Default::default()
        };
        let mut frame =
            encode_frame(&params, None, None, b"payload", &mut rand::thread_rng()).unwrap();

        let mut stored = [0u8; 32];
        stored.copy_from_slice(&frame[..32]);
        frame[..32].fill(0);
        let computed = HashMode::Sha256.digest(&frame);
        assert_eq!(computed, stored);
    }
}
