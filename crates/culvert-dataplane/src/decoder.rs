//! Inbound secure datagram pipeline.
//!
//! One carrier datagram comes in from the upstream channel, the cipher and
//! digest work runs on the blocking pool, and the recovered payload goes
//! out the downstream channel. The upstream is acknowledged only when its
//! datagram has fully left the decoder, so backpressure is one packet deep
//! end to end.
//!
//! The decoder is an actor with three phases:
//!
//!   idle            -> awaiting an upstream datagram
//!   decoding        -> crypto work outstanding on the blocking pool
//!   awaiting-output -> payload pushed downstream, waiting for its ack
//!
//! A malformed, tampered, or replayed datagram is dropped silently: one
//! warning line, an upstream ack, and nothing downstream. The link must
//! not amplify an attacker's traffic into error chatter.
//!
//! Rekeying while a datagram is being decoded discards the outstanding
//! work and drops that datagram. The worker only ever sees the cipher
//! clone captured when its job was submitted, so a rekey can never expose
//! it to a torn key; handing the job its own copy is what makes the
//! ordering explicit rather than incidental.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use zerocopy::FromBytes;

use culvert_core::channel::{channel, InFlight, PacketReceiver, PacketSender, SendTicket};
use culvert_core::crypto::{constant_time_eq, CbcCipher, CryptoError, MAX_HASH_LEN};
use culvert_core::frame::{scan_padding, OtpField, PaddingError, SecurityParams};

use crate::otp::{Otp, OtpChecker, OtpEvent, OtpGenerator, SeedId};
use crate::worker::{self, WorkHandle};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("replay protection needs at least 2 seed slots, got {got}")]
    TooFewOtpSeeds { got: usize },

    #[error("replay protection enabled without a password generator")]
    MissingOtpGenerator,

    #[error("encryption is not enabled by the security parameters")]
    EncryptionDisabled,

    #[error("replay protection is not enabled by the security parameters")]
    OtpDisabled,

    #[error("decoder is no longer running")]
    Stopped,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Why a datagram was dropped. Rendered into the single warning line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
enum DecodeReject {
    #[error("carrier length is not a whole number of cipher blocks")]
    NotBlockAligned,

    #[error("carrier too short to hold an IV")]
    MissingIv,

    #[error("no decryption key installed")]
    NoKey,

    #[error("cipher rejected the carrier")]
    Cipher,

    #[error("carrier has no padding block")]
    MissingPaddingBlock,

    #[error("padding holds a nonzero byte before the terminator")]
    PaddingByte,

    #[error("padding block is all zeroes")]
    PaddingAllZeroes,

    #[error("plaintext too short for the header")]
    TruncatedHeader,

    #[error("payload longer than the downstream MTU")]
    PayloadTooLong,

    #[error("digest mismatch")]
    DigestMismatch,
}

impl From<PaddingError> for DecodeReject {
    fn from(err: PaddingError) -> Self {
        match err {
            PaddingError::StrayByte => DecodeReject::PaddingByte,
            PaddingError::NoTerminator => DecodeReject::PaddingAllZeroes,
        }
    }
}

// ── Control surface ──────────────────────────────────────────────────────────

enum Ctrl {
    SetKey(CbcCipher),
    RemoveKey,
    AddSeed {
        seed_id: SeedId,
        key: Vec<u8>,
        iv: Vec<u8>,
    },
    RemoveSeeds,
    SetEventSink(mpsc::UnboundedSender<OtpEvent>),
}

impl Ctrl {
    /// Key changes abandon an outstanding decode; everything else leaves
    /// it running.
    fn interrupts_decode(&self) -> bool {
        matches!(self, Ctrl::SetKey(_) | Ctrl::RemoveKey)
    }
}

/// Cloneable handle for rekeying and replay-guard maintenance.
#[derive(Clone)]
#[derive(Debug)]
pub struct DecoderHandle {
    ctrl: mpsc::UnboundedSender<Ctrl>,
    params: SecurityParams,
}

impl DecoderHandle {
    /// Install (or replace) the decryption key. A datagram being decoded
    /// under the old key is dropped and its upstream acknowledged.
    pub fn set_encryption_key(&self, key: &[u8]) -> Result<(), DecoderError> {
        let mode = self.params.encryption.ok_or(DecoderError::EncryptionDisabled)?;
        let cipher = CbcCipher::new(mode, key)?;
        self.ctrl
            .send(Ctrl::SetKey(cipher))
            .map_err(|_| DecoderError::Stopped)
    }

    /// Forget the decryption key. Encrypted datagrams are dropped until a
    /// new key arrives; an outstanding decode is abandoned like on rekey.
    pub fn remove_encryption_key(&self) -> Result<(), DecoderError> {
        self.params.encryption.ok_or(DecoderError::EncryptionDisabled)?;
        self.ctrl
            .send(Ctrl::RemoveKey)
            .map_err(|_| DecoderError::Stopped)
    }

    /// Install a replay-guard seed.
    pub fn add_otp_seed(&self, seed_id: SeedId, key: &[u8], iv: &[u8]) -> Result<(), DecoderError> {
        self.params.otp.ok_or(DecoderError::OtpDisabled)?;
        self.ctrl
            .send(Ctrl::AddSeed {
                seed_id,
                key: key.to_vec(),
                iv: iv.to_vec(),
            })
            .map_err(|_| DecoderError::Stopped)
    }

    /// Drop every replay-guard seed.
    pub fn remove_otp_seeds(&self) -> Result<(), DecoderError> {
        self.params.otp.ok_or(DecoderError::OtpDisabled)?;
        self.ctrl
            .send(Ctrl::RemoveSeeds)
            .map_err(|_| DecoderError::Stopped)
    }

    /// Route replay-guard lifecycle events (seed ready, ...) to `sink`.
    pub fn set_otp_event_sink(
        &self,
        sink: mpsc::UnboundedSender<OtpEvent>,
    ) -> Result<(), DecoderError> {
        self.params.otp.ok_or(DecoderError::OtpDisabled)?;
        self.ctrl
            .send(Ctrl::SetEventSink(sink))
            .map_err(|_| DecoderError::Stopped)
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Phase {
    Idle,
    Decoding {
        input: InFlight,
        work: WorkHandle<DecodeOutcome>,
    },
    AwaitingOutput {
        input: InFlight,
        ticket: SendTicket,
    },
}

/// The decode actor. Create with [`Decoder::new`], then drive it by
/// spawning [`Decoder::run`].
#[derive(Debug)]
pub struct Decoder {
    output: PacketSender,
    input: PacketReceiver,
    ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
    ctrl_open: bool,
    params: SecurityParams,
    cipher: Option<CbcCipher>,
    otp: Option<OtpChecker>,
    scratch: Option<Vec<u8>>,
    scratch_len: usize,
    output_mtu: usize,
    input_mtu: usize,
    phase: Phase,
}

impl Decoder {
    /// Build a decoder in front of `output`.
    ///
    /// The upstream-facing sender of the input channel is returned; its MTU
    /// is derived from the output MTU and the frame overhead. When replay
    /// protection is enabled, `num_otp_seeds >= 2` seed slots are required
    /// (the peer's current and next seed must coexist) along with a
    /// password generator.
    pub fn new(
        output: PacketSender,
        params: SecurityParams,
        num_otp_seeds: usize,
        otp_generator: Option<Arc<dyn OtpGenerator>>,
    ) -> Result<(Decoder, DecoderHandle, PacketSender), DecoderError> {
        let otp = match params.otp {
            Some(otp_params) => {
                if num_otp_seeds < 2 {
                    return Err(DecoderError::TooFewOtpSeeds { got: num_otp_seeds });
                }
                let generator = otp_generator.ok_or(DecoderError::MissingOtpGenerator)?;
                Some(OtpChecker::new(num_otp_seeds, otp_params.num_otps, generator))
            }
            None => None,
        };

        let output_mtu = output.mtu();
        let input_mtu = params.carrier_mtu_for_payload_mtu(output_mtu);
        let scratch_len = if params.encryption.is_some() || params.hash.is_some() {
            params.plaintext_buffer_len(output_mtu)
        } else {
            0
        };

        let (input_tx, input_rx) = channel(input_mtu);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let decoder = Decoder {
            output,
            input: input_rx,
            ctrl_rx,
            ctrl_open: true,
            params,
            cipher: None,
            otp,
            scratch: Some(vec![0u8; scratch_len]),
            scratch_len,
            output_mtu,
            input_mtu,
            phase: Phase::Idle,
        };
        let handle = DecoderHandle {
            ctrl: ctrl_tx,
            params,
        };
        Ok((decoder, handle, input_tx))
    }

    /// Carrier MTU the upstream must respect.
    pub fn input_mtu(&self) -> usize {
        self.input_mtu
    }

    /// Drive the decoder until the upstream goes away.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Idle) {
                Phase::Idle => {
                    tokio::select! {
                        biased;
                        datagram = self.input.recv() => match datagram {
                            Some(datagram) => self.begin_decode(datagram),
                            None => break,
                        },
                        ctrl = self.ctrl_rx.recv(), if self.ctrl_open => self.note_ctrl(ctrl),
                    }
                }
                Phase::Decoding { input, mut work } => {
                    tokio::select! {
                        biased;
                        ctrl = self.ctrl_rx.recv(), if self.ctrl_open => match ctrl {
                            Some(ctrl) if ctrl.interrupts_decode() => {
                                work.discard();
                                input.complete();
                                self.apply(ctrl);
                                tracing::debug!("in-flight datagram dropped by rekey");
                            }
                            Some(ctrl) => {
                                self.apply(ctrl);
                                self.phase = Phase::Decoding { input, work };
                            }
                            None => {
                                self.ctrl_open = false;
                                self.phase = Phase::Decoding { input, work };
                            }
                        },
                        outcome = work.finish() => {
                            let outcome = outcome?;
                            self.finish_decode(input, outcome)?;
                        }
                    }
                }
                Phase::AwaitingOutput { input, mut ticket } => {
                    tokio::select! {
                        biased;
                        ctrl = self.ctrl_rx.recv(), if self.ctrl_open => {
                            self.note_ctrl(ctrl);
                            self.phase = Phase::AwaitingOutput { input, ticket };
                        }
                        delivered = ticket.delivered() => {
                            input.complete();
                            if delivered.is_err() {
                                anyhow::bail!("output channel closed before acknowledging a payload");
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn note_ctrl(&mut self, ctrl: Option<Ctrl>) {
        match ctrl {
            Some(ctrl) => self.apply(ctrl),
            None => self.ctrl_open = false,
        }
    }

    fn apply(&mut self, ctrl: Ctrl) {
        match ctrl {
            Ctrl::SetKey(cipher) => {
                self.cipher = Some(cipher);
                tracing::debug!("decryption key installed");
            }
            Ctrl::RemoveKey => {
                self.cipher = None;
                tracing::debug!("decryption key removed");
            }
            Ctrl::AddSeed { seed_id, key, iv } => {
                if let Some(checker) = &mut self.otp {
                    checker.add_seed(seed_id, &key, &iv);
                }
            }
            Ctrl::RemoveSeeds => {
                if let Some(checker) = &mut self.otp {
                    checker.remove_seeds();
                }
            }
            Ctrl::SetEventSink(sink) => {
                if let Some(checker) = &mut self.otp {
                    checker.set_event_sink(sink);
                }
            }
        }
    }

    fn begin_decode(&mut self, input: InFlight) {
        debug_assert!(input.payload().len() <= self.input_mtu);

        let job = DecodeJob {
            input: input.payload().clone(),
            scratch: self
                .scratch
                .take()
                .unwrap_or_else(|| vec![0u8; self.scratch_len]),
            params: self.params,
            cipher: self.cipher.clone(),
            output_mtu: self.output_mtu,
        };
        let work = worker::offload(move || decode_work(job));
        self.phase = Phase::Decoding { input, work };
    }

    fn finish_decode(&mut self, input: InFlight, outcome: DecodeOutcome) -> anyhow::Result<()> {
        self.scratch = Some(outcome.scratch);

        let frame = match outcome.verdict {
            Ok(frame) => frame,
            Err(reject) => {
                tracing::warn!(reason = %reject, len = input.payload().len(), "dropping datagram");
                tracing::debug!(
                    head = %hex::encode(&input.payload()[..input.payload().len().min(16)]),
                    "rejected datagram head"
                );
                input.complete();
                return Ok(());
            }
        };

        // The replay check runs here, not on the worker: the seed tables
        // belong to this actor alone.
        if let Some((seed_id, otp)) = frame.otp {
            let valid = self
                .otp
                .as_mut()
                .is_some_and(|checker| checker.check(seed_id, otp));
            if !valid {
                tracing::warn!(seed_id, "dropping datagram with invalid one-time password");
                input.complete();
                return Ok(());
            }
        }

        match self.output.begin_send(frame.payload) {
            Ok(ticket) => {
                self.phase = Phase::AwaitingOutput { input, ticket };
                Ok(())
            }
            Err(err) => {
                input.complete();
                anyhow::bail!("output channel rejected a payload: {err}")
            }
        }
    }
}

// ── Decode work ──────────────────────────────────────────────────────────────

struct DecodeJob {
    input: Bytes,
    scratch: Vec<u8>,
    params: SecurityParams,
    cipher: Option<CbcCipher>,
    output_mtu: usize,
}

#[derive(Debug)]
struct DecodeOutcome {
    scratch: Vec<u8>,
    verdict: Result<DecodedFrame, DecodeReject>,
}

#[derive(Debug)]
struct DecodedFrame {
    payload: Bytes,
    otp: Option<(SeedId, Otp)>,
}

fn decode_work(mut job: DecodeJob) -> DecodeOutcome {
    let verdict = decode_frame(
        &job.input,
        &mut job.scratch,
        &job.params,
        job.cipher.as_ref(),
        job.output_mtu,
    );
    DecodeOutcome {
        scratch: job.scratch,
        verdict,
    }
}

/// The pure decode: decrypt, strip padding, verify, locate the payload.
///
/// Runs off the owner task; touches nothing but its arguments. The OTP
/// field is captured, not checked, because the seed tables are not shared
/// with the worker.
fn decode_frame(
    input: &Bytes,
    scratch: &mut Vec<u8>,
    params: &SecurityParams,
    cipher: Option<&CbcCipher>,
    output_mtu: usize,
) -> Result<DecodedFrame, DecodeReject> {
    let header_len = params.header_len();

    // Recover the plaintext: decrypted into the scratch buffer, copied
    // there when the digest needs to scribble on the header, or used in
    // place when nothing does.
    let (in_scratch, plain_len) = match params.encryption {
        Some(mode) => {
            let block = mode.block_size();
            if input.len() % block != 0 {
                return Err(DecodeReject::NotBlockAligned);
            }
            if input.len() < block {
                return Err(DecodeReject::MissingIv);
            }
            let cipher = cipher.ok_or(DecodeReject::NoKey)?;

            let (iv, ciphertext) = input.split_at(block);
            if scratch.len() < ciphertext.len() {
                scratch.resize(ciphertext.len(), 0);
            }
            cipher
                .decrypt(iv, ciphertext, &mut scratch[..ciphertext.len()])
                .map_err(|_| DecodeReject::Cipher)?;

            if ciphertext.len() < block {
                return Err(DecodeReject::MissingPaddingBlock);
            }
            let plain_len = scan_padding(&scratch[..ciphertext.len()], block)?;
            (true, plain_len)
        }
        None => {
            if params.hash.is_some() {
                if scratch.len() < input.len() {
                    scratch.resize(input.len(), 0);
                }
                scratch[..input.len()].copy_from_slice(input);
                (true, input.len())
            } else {
                (false, input.len())
            }
        }
    };

    if plain_len < header_len {
        return Err(DecodeReject::TruncatedHeader);
    }
    if plain_len - header_len > output_mtu {
        return Err(DecodeReject::PayloadTooLong);
    }

    let otp = match params.otp {
        Some(_) => {
            let off = params.otp_field_offset();
            let header: &[u8] = if in_scratch { &scratch[off..] } else { &input[off..] };
            let field = OtpField::read_from_prefix(header).ok_or(DecodeReject::TruncatedHeader)?;
            Some((field.seed_id.get(), field.otp.get()))
        }
        None => None,
    };

    if let Some(mode) = params.hash {
        let plain = &mut scratch[..plain_len];
        let off = params.hash_field_offset();
        let size = mode.hash_size();

        // The digest was computed with this field zeroed; recompute under
        // the same view, then put the wire bytes back.
        let mut stored = [0u8; MAX_HASH_LEN];
        stored[..size].copy_from_slice(&plain[off..off + size]);
        plain[off..off + size].fill(0);
        let computed = mode.digest(plain);
        plain[off..off + size].copy_from_slice(&stored[..size]);

        if !constant_time_eq(&computed[..size], &stored[..size]) {
            return Err(DecodeReject::DigestMismatch);
        }
    }

    let payload = if in_scratch {
        Bytes::copy_from_slice(&scratch[header_len..plain_len])
    } else {
        input.slice(header_len..plain_len)
    };
    Ok(DecodedFrame { payload, otp })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use culvert_core::crypto::{EncryptionMode, HashMode};
    use culvert_core::frame::{encode_frame, OtpParams, PADDING_TERMINATOR};

    fn decode(
        input: Vec<u8>,
        params: &SecurityParams,
        cipher: Option<&CbcCipher>,
        output_mtu: usize,
    ) -> Result<(Bytes, Option<(SeedId, Otp)>), DecodeReject> {
        let mut scratch = vec![0u8; params.plaintext_buffer_len(output_mtu)];
        decode_frame(&Bytes::from(input), &mut scratch, params, cipher, output_mtu)
            .map(|frame| (frame.payload, frame.otp))
    }

    fn test_cipher() -> CbcCipher {
        CbcCipher::new(EncryptionMode::Aes128Cbc, &[0x33; 16]).unwrap()
    }

    #[test]
    fn bare_frame_passes_through_untouched() {
        let params = SecurityParams::default();
        let (payload, otp) = decode(vec![0xAA, 0xBB], &params, None, 16).unwrap();
        assert_eq!(payload.as_ref(), &[0xAA, 0xBB]);
        assert_eq!(otp, None);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let params = SecurityParams::default();
        let err = decode(vec![0u8; 17], &params, None, 16).unwrap_err();
        assert_eq!(err, DecodeReject::PayloadTooLong);
    }

    #[test]
    fn short_header_is_rejected() {
        let params = SecurityParams {
            hash: Some(HashMode::Blake3),
            ..Default::default()
        };
        let err = decode(vec![0u8; 31], &params, None, 16).unwrap_err();
        assert_eq!(err, DecodeReject::TruncatedHeader);
    }

    #[test]
    fn misaligned_carrier_is_rejected() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            ..Default::default()
        };
        let cipher = test_cipher();
        let err = decode(vec![0u8; 17], &params, Some(&cipher), 64).unwrap_err();
        assert_eq!(err, DecodeReject::NotBlockAligned);
    }

    #[test]
    fn empty_carrier_has_no_iv() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            ..Default::default()
        };
        let cipher = test_cipher();
        let err = decode(vec![], &params, Some(&cipher), 64).unwrap_err();
        assert_eq!(err, DecodeReject::MissingIv);
    }

    #[test]
    fn iv_only_carrier_has_no_padding_block() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            ..Default::default()
        };
        let cipher = test_cipher();
        let err = decode(vec![0u8; 16], &params, Some(&cipher), 64).unwrap_err();
        assert_eq!(err, DecodeReject::MissingPaddingBlock);
    }

    #[test]
    fn missing_key_is_rejected() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            ..Default::default()
        };
        let err = decode(vec![0u8; 32], &params, None, 64).unwrap_err();
        assert_eq!(err, DecodeReject::NoKey);
    }

    #[test]
    fn encrypted_round_trip_recovers_the_payload() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            hash: Some(HashMode::Blake3),
            ..Default::default()
        };
        let cipher = test_cipher();
        let frame = encode_frame(
            &params,
            Some(&cipher),
            None,
            b"through the culvert",
            &mut rand::thread_rng(),
        )
        .unwrap();

        let (payload, otp) = decode(frame, &params, Some(&cipher), 64).unwrap();
        assert_eq!(payload.as_ref(), b"through the culvert");
        assert_eq!(otp, None);
    }

    #[test]
    fn bad_padding_terminator_is_rejected() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            ..Default::default()
        };
        let cipher = test_cipher();

        // last block ends 0x02 0x00 0x00: first nonzero from the tail is
        // not the terminator
        let mut plain = vec![0xEEu8; 16];
        plain[13] = 0x02;
        plain[14] = 0x00;
        plain[15] = 0x00;
        let mut frame = vec![0x55u8; 16]; // IV
        frame.resize(32, 0);
        cipher.encrypt(&[0x55u8; 16], &plain, &mut frame[16..]).unwrap();

        let err = decode(frame, &params, Some(&cipher), 64).unwrap_err();
        assert_eq!(err, DecodeReject::PaddingByte);
    }

    #[test]
    fn all_zero_padding_block_is_rejected() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            ..Default::default()
        };
        let cipher = test_cipher();

        let plain = vec![0u8; 16];
        let mut frame = vec![0x55u8; 16];
        frame.resize(32, 0);
        cipher.encrypt(&[0x55u8; 16], &plain, &mut frame[16..]).unwrap();

        let err = decode(frame, &params, Some(&cipher), 64).unwrap_err();
        assert_eq!(err, DecodeReject::PaddingAllZeroes);
    }

    #[test]
    fn flipped_digest_byte_is_rejected() {
        let params = SecurityParams {
            hash: Some(HashMode::Sha256),
            ..Default::default()
        };
        let mut frame =
            encode_frame(&params, None, None, b"payload", &mut rand::thread_rng()).unwrap();
        frame[0] ^= 0x01;

        let err = decode(frame, &params, None, 64).unwrap_err();
        assert_eq!(err, DecodeReject::DigestMismatch);
    }

    #[test]
    fn digest_verification_restores_the_wire_bytes() {
        // decoding the same frame twice from one buffer must behave the
        // same both times; a scribbled-on hash field would break that
        let params = SecurityParams {
            hash: Some(HashMode::Blake3),
            ..Default::default()
        };
        let frame = encode_frame(&params, None, None, b"abc", &mut rand::thread_rng()).unwrap();

        for _ in 0..2 {
            let (payload, _) = decode(frame.clone(), &params, None, 64).unwrap();
            assert_eq!(payload.as_ref(), b"abc");
        }
    }

    #[test]
    fn otp_field_is_captured_not_checked() {
        let params = SecurityParams {
            otp: Some(OtpParams { num_otps: 8 }),
            ..Default::default()
        };
        let frame = encode_frame(
            &params,
            None,
            Some((0x0102, 0x0A0B)),
            b"pw",
            &mut rand::thread_rng(),
        )
        .unwrap();

        let (payload, otp) = decode(frame, &params, None, 64).unwrap();
        assert_eq!(payload.as_ref(), b"pw");
        assert_eq!(otp, Some((0x0102, 0x0A0B)));
    }

    #[test]
    fn full_stack_round_trip() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes256Cbc),
            hash: Some(HashMode::Blake3),
            otp: Some(OtpParams { num_otps: 8 }),
        };
        let cipher = CbcCipher::new(EncryptionMode::Aes256Cbc, &[0x77; 32]).unwrap();

        let frame = encode_frame(
            &params,
            Some(&cipher),
            Some((3, 12345)),
            &[0x42; 40],
            &mut rand::thread_rng(),
        )
        .unwrap();

        let (payload, otp) = decode(frame, &params, Some(&cipher), 64).unwrap();
        assert_eq!(payload.as_ref(), &[0x42; 40]);
        assert_eq!(otp, Some((3, 12345)));
    }

    #[test]
    fn zero_length_payload_survives_the_full_stack() {
        let params = SecurityParams {
            encryption: Some(EncryptionMode::Aes128Cbc),
            hash: Some(HashMode::Sha256),
            ..Default::default()
        };
        let cipher = test_cipher();
        let frame =
            encode_frame(&params, Some(&cipher), None, b"", &mut rand::thread_rng()).unwrap();

        let (payload, _) = decode(frame, &params, Some(&cipher), 64).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn terminator_constant_matches_the_scanner() {
        // guards against the encoder and scanner drifting apart
        assert_eq!(PADDING_TERMINATOR, 0x01);
    }
}
