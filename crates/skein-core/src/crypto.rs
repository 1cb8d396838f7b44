//! Cryptographic primitives for skein.
//!
//! Provides three things:
//!   1. Pre-shared key derivation from the mesh password (BLAKE3 KDF)
//!   2. Noise_NNpsk0 session establishment over the TCP control connection
//!   3. Encryptors that batch frames into UDP payloads, plain or sealed
//!
//! Both ends of a connection derive the same session keys from the
//! handshake. The data plane and the control plane each get their own
//! nonce space and replay window so a burst of UDP traffic can never push a
//! queued control message out of the window.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::name::{PeerName, NAME_SIZE};
use crate::wire::{FrameHeader, FRAME_HEADER_SIZE};

// ── Key derivation ────────────────────────────────────────────────────────────

const PSK_CONTEXT: &str = "skein 2024-05 mesh password psk";

/// Derive the 32-byte Noise pre-shared key from the mesh password.
pub fn derive_psk(password: &[u8]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(blake3::derive_key(PSK_CONTEXT, password))
}

// ── Noise Handshake ───────────────────────────────────────────────────────────

/// Neither side has a static key; possession of the password is the only
/// authentication.
const NOISE_PATTERN: &str = "Noise_NNpsk0_25519_ChaChaPoly_BLAKE2s";

const MAX_HANDSHAKE_MESSAGE: usize = 256;

fn builder_with_psk<'a>(psk: &'a [u8; 32]) -> Result<Builder<'a>, CryptoError> {
    let params = NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?;
    Ok(Builder::new(params).psk(0, psk))
}

/// Outbound side of the handshake. Sends message 1, reads message 2.
pub struct NoiseInitiator {
    state: HandshakeState,
}

impl NoiseInitiator {
    /// Returns the initiator and the bytes of message 1.
    pub fn new(psk: &[u8; 32]) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut state = builder_with_psk(psk)?.build_initiator()?;
        let mut msg1 = vec![0u8; MAX_HANDSHAKE_MESSAGE];
        let len = state.write_message(&[], &mut msg1)?;
        msg1.truncate(len);
        Ok((Self { state }, msg1))
    }

    pub fn finish(mut self, msg2: &[u8]) -> Result<SessionKeys, CryptoError> {
        let mut payload = vec![0u8; msg2.len()];
        self.state.read_message(msg2, &mut payload)?;
        let transport = self.state.into_stateless_transport_mode()?;
        Ok(SessionKeys {
            transport: Arc::new(transport),
        })
    }
}

/// Inbound side of the handshake. Reads message 1 and answers it.
pub struct NoiseResponder;

impl NoiseResponder {
    /// Returns the completed keys and the bytes of message 2.
    pub fn respond(psk: &[u8; 32], msg1: &[u8]) -> Result<(SessionKeys, Vec<u8>), CryptoError> {
        let mut state = builder_with_psk(psk)?.build_responder()?;
        let mut payload = vec![0u8; msg1.len()];
        state.read_message(msg1, &mut payload)?;

        let mut msg2 = vec![0u8; MAX_HANDSHAKE_MESSAGE];
        let len = state.write_message(&[], &mut msg2)?;
        msg2.truncate(len);

        let transport = state.into_stateless_transport_mode()?;
        Ok((
            SessionKeys {
                transport: Arc::new(transport),
            },
            msg2,
        ))
    }
}

/// Keys produced by a completed handshake.
#[derive(Clone)]
pub struct SessionKeys {
    transport: Arc<StatelessTransportState>,
}

const CONTROL_NONCE_BASE: u64 = 1 << 63;

impl SessionKeys {
    /// Cipher for UDP frame batches.
    pub fn data(&self) -> SessionCipher {
        SessionCipher::new(self.transport.clone(), 0)
    }

    /// Cipher for TCP control messages.
    pub fn control(&self) -> SessionCipher {
        SessionCipher::new(self.transport.clone(), CONTROL_NONCE_BASE)
    }
}

// ── Replay Window ─────────────────────────────────────────────────────────────

/// Sliding-window replay protection (RFC 6479 style).
///
/// Tracks the highest seen nonce and a bitmap of the last 2048 nonces.
/// Rejects duplicates and nonces that fall behind the window.
const WINDOW_SIZE: u64 = 2048;

pub struct ReplayWindow {
    highest: u64,
    seen_any: bool,
    bitmap: Vec<u64>,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            seen_any: false,
            bitmap: vec![0u64; (WINDOW_SIZE / 64) as usize],
        }
    }

    /// Returns true if the nonce is acceptable (not replayed, not too old).
    pub fn check(&self, nonce: u64) -> bool {
        if !self.seen_any || nonce > self.highest {
            return true;
        }
        let diff = self.highest - nonce;
        if diff >= WINDOW_SIZE {
            return false;
        }
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] & (1u64 << bit) == 0
    }

    /// Mark a nonce as seen. Call after successful decrypt.
    pub fn mark(&mut self, nonce: u64) {
        if !self.seen_any {
            self.seen_any = true;
            self.highest = nonce;
        } else if nonce > self.highest {
            self.shift_window(nonce - self.highest);
            self.highest = nonce;
        }
        let diff = self.highest - nonce;
        if diff >= WINDOW_SIZE {
            return;
        }
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] |= 1u64 << bit;
    }

    fn shift_window(&mut self, shift: u64) {
        if shift >= WINDOW_SIZE {
            self.bitmap.fill(0);
            return;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = (shift % 64) as u32;
        if word_shift > 0 {
            self.bitmap.rotate_right(word_shift);
            for w in &mut self.bitmap[..word_shift] {
                *w = 0;
            }
        }
        if bit_shift > 0 {
            let len = self.bitmap.len();
            for i in (1..len).rev() {
                self.bitmap[i] =
                    (self.bitmap[i] << bit_shift) | (self.bitmap[i - 1] >> (64 - bit_shift));
            }
            self.bitmap[0] <<= bit_shift;
        }
    }
}

// ── Session cipher ────────────────────────────────────────────────────────────

/// One direction-agnostic nonce space over the session keys.
///
/// Wire format per sealed message:
///   [u64 nonce LE (8 bytes)] [Noise ciphertext (payload + 16-byte MAC)]
///
/// Safe to share across threads: the send counter is atomic and the
/// receive window sits behind a mutex.
pub struct SessionCipher {
    transport: Arc<StatelessTransportState>,
    base: u64,
    send_nonce: AtomicU64,
    recv_window: Mutex<ReplayWindow>,
}

pub const NONCE_SIZE: usize = 8;
pub const TAG_SIZE: usize = 16;
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

impl SessionCipher {
    fn new(transport: Arc<StatelessTransportState>, base: u64) -> Self {
        Self {
            transport,
            base,
            send_nonce: AtomicU64::new(0),
            recv_window: Mutex::new(ReplayWindow::new()),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.base + self.send_nonce.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        out.extend_from_slice(&nonce.to_le_bytes());
        out.resize(SEAL_OVERHEAD + plaintext.len(), 0);
        let written = self
            .transport
            .write_message(nonce, plaintext, &mut out[NONCE_SIZE..])?;
        out.truncate(NONCE_SIZE + written);
        Ok(out)
    }

    /// Verify and decrypt. Rejects replays, nonces from the other nonce
    /// space, and anything that fails authentication.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::TooShort);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let mut raw = [0u8; NONCE_SIZE];
        raw.copy_from_slice(nonce_bytes);
        let nonce = u64::from_le_bytes(raw);
        if (nonce & CONTROL_NONCE_BASE) != self.base {
            return Err(CryptoError::Replay);
        }
        let relative = nonce - self.base;

        let mut window = self
            .recv_window
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !window.check(relative) {
            return Err(CryptoError::Replay);
        }
        let mut out = vec![0u8; ciphertext.len()];
        let written = self.transport.read_message(nonce, ciphertext, &mut out)?;
        out.truncate(written);
        window.mark(relative);
        Ok(out)
    }
}

// ── Encryptors ────────────────────────────────────────────────────────────────

/// Accumulates frames into one UDP payload.
///
/// Every payload starts with the sender's name so the receiver can find
/// the matching connection before decrypting.
pub trait Encryptor: Send {
    /// Bytes added per frame.
    fn frame_overhead(&self) -> usize {
        FRAME_HEADER_SIZE
    }

    /// Bytes added per packet.
    fn packet_overhead(&self) -> usize;

    fn is_empty(&self) -> bool;

    /// Size of the packet `bytes()` would produce right now.
    fn total_len(&self) -> usize;

    /// Frames longer than a 16-bit length prefix can describe are refused.
    fn append_frame(&mut self, src: PeerName, dst: PeerName, frame: &[u8]) -> Result<(), CryptoError>;

    /// Produce the packet and reset for the next batch.
    fn bytes(&mut self) -> Result<Vec<u8>, CryptoError>;
}

fn append_framed(
    buf: &mut Vec<u8>,
    src: PeerName,
    dst: PeerName,
    frame: &[u8],
) -> Result<(), CryptoError> {
    use zerocopy::AsBytes;
    let len = u16::try_from(frame.len()).map_err(|_| CryptoError::FrameTooLong(frame.len()))?;
    let header = FrameHeader::new(src, dst, len);
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(frame);
    Ok(())
}

pub struct PlainEncryptor {
    prefix: [u8; NAME_SIZE],
    buf: Vec<u8>,
}

impl PlainEncryptor {
    pub fn new(ours: PeerName) -> Self {
        Self {
            prefix: ours.to_bytes(),
            buf: Vec::new(),
        }
    }
}

impl Encryptor for PlainEncryptor {
    fn packet_overhead(&self) -> usize {
        NAME_SIZE
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn total_len(&self) -> usize {
        NAME_SIZE + self.buf.len()
    }

    fn append_frame(&mut self, src: PeerName, dst: PeerName, frame: &[u8]) -> Result<(), CryptoError> {
        append_framed(&mut self.buf, src, dst, frame)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mut packet = Vec::with_capacity(self.total_len());
        packet.extend_from_slice(&self.prefix);
        packet.append(&mut self.buf);
        Ok(packet)
    }
}

pub struct SealedEncryptor {
    prefix: [u8; NAME_SIZE],
    cipher: Arc<SessionCipher>,
    buf: Vec<u8>,
}

impl SealedEncryptor {
    pub fn new(ours: PeerName, cipher: Arc<SessionCipher>) -> Self {
        Self {
            prefix: ours.to_bytes(),
            cipher,
            buf: Vec::new(),
        }
    }
}

impl Encryptor for SealedEncryptor {
    fn packet_overhead(&self) -> usize {
        NAME_SIZE + SEAL_OVERHEAD
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn total_len(&self) -> usize {
        self.packet_overhead() + self.buf.len()
    }

    fn append_frame(&mut self, src: PeerName, dst: PeerName, frame: &[u8]) -> Result<(), CryptoError> {
        append_framed(&mut self.buf, src, dst, frame)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, CryptoError> {
        let sealed = self.cipher.seal(&self.buf);
        self.buf.clear();
        let sealed = sealed?;
        let mut packet = Vec::with_capacity(NAME_SIZE + sealed.len());
        packet.extend_from_slice(&self.prefix);
        packet.extend_from_slice(&sealed);
        Ok(packet)
    }
}

/// Receive-side counterpart of an encryptor. Operates on the payload after
/// the sender name has been stripped.
#[derive(Clone)]
pub enum Decryptor {
    Plain,
    Sealed(Arc<SessionCipher>),
}

impl Decryptor {
    pub fn decrypt<'a>(&self, payload: &'a [u8]) -> Result<Cow<'a, [u8]>, CryptoError> {
        match self {
            Decryptor::Plain => Ok(Cow::Borrowed(payload)),
            Decryptor::Sealed(cipher) => cipher.open(payload).map(Cow::Owned),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("ciphertext too short (need at least 24 bytes: 8 nonce + 16 MAC)")]
    TooShort,

    #[error("replayed or too-old nonce")]
    Replay,

    #[error("frame of {0} bytes does not fit a frame header")]
    FrameTooLong(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frames;

    fn completed(password_a: &[u8], password_b: &[u8]) -> Result<(SessionKeys, SessionKeys), CryptoError> {
        let (initiator, msg1) = NoiseInitiator::new(&derive_psk(password_a))?;
        let (responder_keys, msg2) = NoiseResponder::respond(&derive_psk(password_b), &msg1)?;
        let initiator_keys = initiator.finish(&msg2)?;
        Ok((initiator_keys, responder_keys))
    }

    fn name(last: u8) -> PeerName {
        PeerName::from_mac([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn psk_depends_on_password() {
        assert_eq!(*derive_psk(b"secret"), *derive_psk(b"secret"));
        assert_ne!(*derive_psk(b"secret"), *derive_psk(b"Secret"));
    }

    #[test]
    fn handshake_with_matching_passwords_interoperates() {
        let (a, b) = completed(b"hunter2", b"hunter2").unwrap();
        let sealed = a.data().seal(b"over udp").unwrap();
        assert_eq!(b.data().open(&sealed).unwrap(), b"over udp");

        let sealed = b.control().seal(b"over tcp").unwrap();
        assert_eq!(a.control().open(&sealed).unwrap(), b"over tcp");
    }

    #[test]
    fn mismatched_passwords_fail_handshake() {
        assert!(completed(b"hunter2", b"hunter3").is_err());
    }

    #[test]
    fn replayed_message_is_rejected() {
        let (a, b) = completed(b"pw", b"pw").unwrap();
        let (tx, rx) = (a.data(), b.data());
        let first = tx.seal(b"one").unwrap();
        let second = tx.seal(b"two").unwrap();
        // Out-of-order delivery is fine, repeats are not.
        assert!(rx.open(&second).is_ok());
        assert!(rx.open(&first).is_ok());
        assert!(matches!(rx.open(&first), Err(CryptoError::Replay)));
    }

    #[test]
    fn nonce_spaces_do_not_cross() {
        let (a, b) = completed(b"pw", b"pw").unwrap();
        let sealed = a.control().seal(b"control").unwrap();
        assert!(matches!(b.data().open(&sealed), Err(CryptoError::Replay)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let (a, b) = completed(b"pw", b"pw").unwrap();
        let mut sealed = a.data().seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(b.data().open(&sealed), Err(CryptoError::Noise(_))));
        assert!(matches!(b.data().open(&sealed[..10]), Err(CryptoError::TooShort)));
    }

    #[test]
    fn replay_window_rejects_too_old() {
        let mut w = ReplayWindow::new();
        assert!(w.check(0));
        w.mark(0);
        assert!(!w.check(0));
        w.mark(WINDOW_SIZE + 10);
        assert!(!w.check(5));
        assert!(w.check(WINDOW_SIZE + 9));
        w.mark(WINDOW_SIZE + 9);
        assert!(!w.check(WINDOW_SIZE + 9));
    }

    #[test]
    fn replay_window_tracks_bits_across_shifts() {
        let mut w = ReplayWindow::new();
        for n in [1u64, 3, 70, 130] {
            w.mark(n);
        }
        for n in [1u64, 3, 70, 130] {
            assert!(!w.check(n), "nonce {n} should be marked");
        }
        for n in [2u64, 4, 69, 129] {
            assert!(w.check(n), "nonce {n} should be fresh");
        }
    }

    #[test]
    fn plain_encryptor_length_matches_output() {
        let mut enc = PlainEncryptor::new(name(1));
        assert!(enc.is_empty());
        assert_eq!(enc.total_len(), NAME_SIZE);
        enc.append_frame(name(1), name(2), b"hello").unwrap();
        enc.append_frame(name(1), name(3), b"world!").unwrap();
        let expected = enc.total_len();
        let packet = enc.bytes().unwrap();
        assert_eq!(packet.len(), expected);
        assert!(enc.is_empty());

        assert_eq!(PeerName::from_bytes(&packet).unwrap(), name(1));
        let decoded: Vec<_> = frames(&packet[NAME_SIZE..]).collect::<Result<_, _>>().unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].dst, name(3));
        assert_eq!(decoded[1].frame, b"world!");
    }

    #[test]
    fn oversized_frames_are_refused() {
        let mut enc = PlainEncryptor::new(name(1));
        let err = enc.append_frame(name(1), name(2), &vec![0u8; 65536]).unwrap_err();
        assert!(matches!(err, CryptoError::FrameTooLong(65536)));
        assert!(enc.is_empty());
        enc.append_frame(name(1), name(2), &vec![0u8; 65535]).unwrap();
        assert!(!enc.is_empty());
    }

    #[test]
    fn sealed_encryptor_round_trips_through_decryptor() {
        let (a, b) = completed(b"pw", b"pw").unwrap();
        let mut enc = SealedEncryptor::new(name(1), Arc::new(a.data()));
        enc.append_frame(name(1), name(2), &[0xab; 100]).unwrap();
        let expected = enc.total_len();
        let packet = enc.bytes().unwrap();
        assert_eq!(packet.len(), expected);

        let dec = Decryptor::Sealed(Arc::new(b.data()));
        let plain = dec.decrypt(&packet[NAME_SIZE..]).unwrap();
        let frame = frames(&plain).next().unwrap().unwrap();
        assert_eq!(frame.src, name(1));
        assert_eq!(frame.frame, &[0xab; 100][..]);
    }
}
