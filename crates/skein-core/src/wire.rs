//! skein wire format: protocol constants, control tags, and the framing
//! used inside UDP payloads.
//!
//! Fixed-layout headers are #[repr(C, packed)] with zerocopy derives so
//! they can be read straight out of received buffers. Multi-byte integers
//! are big-endian on the wire except the encryption nonce, which is owned
//! by the crypto module.

use std::time::Duration;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::name::{PeerName, NAME_SIZE};

// ── Sizes and overheads ──────────────────────────────────────────────────────

/// Ethernet header without VLAN tag or FCS.
pub const ETHERNET_OVERHEAD: usize = 14;

/// IPv4 header (20) plus UDP header (8).
pub const UDP_OVERHEAD: usize = 28;

pub const DEFAULT_PORT: u16 = 6783;

/// Path MTU assumed before discovery has run.
pub const DEFAULT_PMTU: usize = 65535;

/// PMTU discovery never goes below the minimum IPv4 reassembly size.
pub const MIN_PMTU: usize = 576;

pub const MAX_UDP_PACKET_SIZE: usize = 65536;

/// Capacity of each forwarder pipeline's channel.
pub const CHANNEL_SIZE: usize = 16;

/// Upper bound for a single TCP control message.
pub const MAX_CONTROL_MESSAGE: usize = 8 * 1024 * 1024;

// ── Sentinel frames ──────────────────────────────────────────────────────────

/// Sentinel frame sent on the non-DF pipeline to test whether the path
/// fragments for us.
pub const FRAG_TEST_SIZE: usize = 60001;

/// Sentinel frame sent DF right after establishment to provoke EMSGSIZE.
pub const PMTU_DISCOVERY_SIZE: usize = 60000;

/// Source MAC of the fragmentation test and PMTU discovery frames. A group
/// address is never a real source, and verification frames carry zero
/// MACs, so neither can be mistaken for a sentinel of the same length.
pub const SENTINEL_SOURCE: [u8; 6] = [0xff; 6];

/// Zeroed Ethernet header followed by the 8-byte connection uid.
pub const HEARTBEAT_FRAME_SIZE: usize = ETHERNET_OVERHEAD + 8;

// ── Timing ───────────────────────────────────────────────────────────────────

pub const FAST_HEARTBEAT: Duration = Duration::from_millis(500);
pub const SLOW_HEARTBEAT: Duration = Duration::from_secs(10);
pub const MAX_MISSED_HEARTBEATS: u32 = 6;
pub const HEARTBEAT_TIMEOUT: Duration =
    Duration::from_secs(SLOW_HEARTBEAT.as_secs() * MAX_MISSED_HEARTBEATS as u64);
pub const FRAG_TEST_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const TCP_HEARTBEAT: Duration = Duration::from_secs(30);
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(30);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Protocol header ──────────────────────────────────────────────────────────

pub const PROTOCOL_MAGIC: [u8; 5] = *b"skein";
pub const PROTOCOL_MIN_VERSION: u8 = 1;
pub const PROTOCOL_MAX_VERSION: u8 = 1;

/// First bytes on every TCP connection, sent by both sides before anything
/// else. The highest version both sides support is used.
///
/// Wire size: 7 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ProtocolHeader {
    pub magic: [u8; 5],
    pub min_version: u8,
    pub max_version: u8,
}

assert_eq_size!(ProtocolHeader, [u8; 7]);

impl ProtocolHeader {
    pub fn ours() -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            min_version: PROTOCOL_MIN_VERSION,
            max_version: PROTOCOL_MAX_VERSION,
        }
    }

    /// Pick the version to speak with a peer that sent `theirs`.
    pub fn negotiate(&self, theirs: &ProtocolHeader) -> Result<u8, WireError> {
        if theirs.magic != PROTOCOL_MAGIC {
            return Err(WireError::BadMagic);
        }
        let (min, max) = (
            self.min_version.max(theirs.min_version),
            self.max_version.min(theirs.max_version),
        );
        if min > max {
            return Err(WireError::VersionMismatch {
                ours: (self.min_version, self.max_version),
                theirs: (theirs.min_version, theirs.max_version),
            });
        }
        Ok(max)
    }
}

// ── Control tags ─────────────────────────────────────────────────────────────

/// First byte of every TCP control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolTag {
    /// We received the peer's heartbeat over UDP.
    ConnectionEstablished = 0,
    /// The fragmentation test frame arrived intact.
    FragmentationReceived = 1,
    /// Please send us the fragmentation test frame.
    StartFragmentationTest = 2,
    /// TCP keepalive, no payload.
    Heartbeat = 3,
    /// Please send your whole topology.
    FetchAll = 4,
    /// Topology update, JSON peer summaries.
    Update = 5,
    /// A PMTU verification frame of the given u16 length arrived.
    PmtuVerified = 6,
}

impl TryFrom<u8> for ProtocolTag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProtocolTag::ConnectionEstablished),
            1 => Ok(ProtocolTag::FragmentationReceived),
            2 => Ok(ProtocolTag::StartFragmentationTest),
            3 => Ok(ProtocolTag::Heartbeat),
            4 => Ok(ProtocolTag::FetchAll),
            5 => Ok(ProtocolTag::Update),
            6 => Ok(ProtocolTag::PmtuVerified),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

impl From<ProtocolTag> for u8 {
    fn from(tag: ProtocolTag) -> u8 {
        tag as u8
    }
}

// ── Frame header ─────────────────────────────────────────────────────────────

/// Precedes every frame inside a UDP payload.
///
/// Wire size: 14 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    pub src: [u8; NAME_SIZE],
    pub dst: [u8; NAME_SIZE],
    pub len: U16<NetworkEndian>,
}

assert_eq_size!(FrameHeader, [u8; 14]);

pub const FRAME_HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

impl FrameHeader {
    pub fn new(src: PeerName, dst: PeerName, len: u16) -> Self {
        Self {
            src: src.to_bytes(),
            dst: dst.to_bytes(),
            len: U16::new(len),
        }
    }
}

/// One frame borrowed out of a decrypted UDP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    pub src: PeerName,
    pub dst: PeerName,
    pub frame: &'a [u8],
}

/// Iterate the frames of a plaintext UDP payload.
pub fn frames(payload: &[u8]) -> Frames<'_> {
    Frames { rest: payload }
}

pub struct Frames<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<FrameRef<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let Some(header) = FrameHeader::read_from_prefix(self.rest) else {
            let got = self.rest.len();
            self.rest = &[];
            return Some(Err(WireError::Truncated {
                need: FRAME_HEADER_SIZE,
                got,
            }));
        };
        let len = header.len.get() as usize;
        let body = &self.rest[FRAME_HEADER_SIZE..];
        if body.len() < len {
            let got = body.len();
            self.rest = &[];
            return Some(Err(WireError::Truncated { need: len, got }));
        }
        let (frame, rest) = body.split_at(len);
        self.rest = rest;
        Some(Ok(FrameRef {
            src: PeerName::from_mac(header.src),
            dst: PeerName::from_mac(header.dst),
            frame,
        }))
    }
}

// ── Sentinel helpers ─────────────────────────────────────────────────────────

pub fn heartbeat_frame(conn_uid: u64) -> Vec<u8> {
    let mut frame = vec![0u8; HEARTBEAT_FRAME_SIZE];
    frame[ETHERNET_OVERHEAD..].copy_from_slice(&conn_uid.to_be_bytes());
    frame
}

/// The connection uid carried by a heartbeat frame, if `frame` is one.
pub fn heartbeat_uid(frame: &[u8]) -> Option<u64> {
    if frame.len() != HEARTBEAT_FRAME_SIZE || frame[..ETHERNET_OVERHEAD].iter().any(|b| *b != 0) {
        return None;
    }
    let uid: [u8; 8] = frame[ETHERNET_OVERHEAD..].try_into().ok()?;
    Some(u64::from_be_bytes(uid))
}

fn sentinel_frame(len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    frame[6..12].copy_from_slice(&SENTINEL_SOURCE);
    frame
}

fn is_sentinel(frame: &[u8], len: usize) -> bool {
    frame.len() == len
        && frame[6..12] == SENTINEL_SOURCE
        && frame[..6].iter().chain(&frame[12..]).all(|b| *b == 0)
}

pub fn frag_test_frame() -> Vec<u8> {
    sentinel_frame(FRAG_TEST_SIZE)
}

pub fn pmtu_discovery_frame() -> Vec<u8> {
    sentinel_frame(PMTU_DISCOVERY_SIZE)
}

pub fn is_frag_test(frame: &[u8]) -> bool {
    is_sentinel(frame, FRAG_TEST_SIZE)
}

pub fn is_pmtu_discovery(frame: &[u8]) -> bool {
    is_sentinel(frame, PMTU_DISCOVERY_SIZE)
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown protocol tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("not a skein peer")]
    BadMagic,

    #[error("no common protocol version (ours {ours:?}, theirs {theirs:?})")]
    VersionMismatch { ours: (u8, u8), theirs: (u8, u8) },

    #[error("control message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn name(last: u8) -> PeerName {
        PeerName::from_mac([0, 0, 0, 0, 0, last])
    }

    fn encode(frames: &[(PeerName, PeerName, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (src, dst, frame) in frames {
            out.extend_from_slice(FrameHeader::new(*src, *dst, frame.len() as u16).as_bytes());
            out.extend_from_slice(frame);
        }
        out
    }

    #[test]
    fn frame_iterator_yields_each_frame() {
        let payload = encode(&[(name(1), name(2), b"first"), (name(3), name(4), b"")]);
        let got: Vec<_> = frames(&payload).collect::<Result<_, _>>().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].src, name(1));
        assert_eq!(got[0].dst, name(2));
        assert_eq!(got[0].frame, b"first");
        assert_eq!(got[1].src, name(3));
        assert!(got[1].frame.is_empty());
    }

    #[test]
    fn truncated_frame_is_reported_once() {
        let mut payload = encode(&[(name(1), name(2), b"abcdef")]);
        payload.truncate(payload.len() - 2);
        let mut it = frames(&payload);
        assert_eq!(
            it.next(),
            Some(Err(WireError::Truncated { need: 6, got: 4 }))
        );
        assert_eq!(it.next(), None);
    }

    #[test]
    fn short_header_is_truncated() {
        let mut it = frames(&[0u8; 5]);
        assert!(matches!(it.next(), Some(Err(WireError::Truncated { .. }))));
        assert!(it.next().is_none());
    }

    #[test]
    fn heartbeat_frames_carry_uid() {
        let frame = heartbeat_frame(0x0102_0304_0506_0708);
        assert_eq!(frame.len(), HEARTBEAT_FRAME_SIZE);
        assert_eq!(heartbeat_uid(&frame), Some(0x0102_0304_0506_0708));

        let mut not_heartbeat = frame.clone();
        not_heartbeat[0] = 1;
        assert_eq!(heartbeat_uid(&not_heartbeat), None);
        assert_eq!(heartbeat_uid(&frame[..20]), None);
    }

    #[test]
    fn sentinel_frames_are_recognised() {
        assert_eq!(pmtu_discovery_frame().len(), PMTU_DISCOVERY_SIZE);
        assert_eq!(frag_test_frame().len(), FRAG_TEST_SIZE);
        assert!(is_frag_test(&frag_test_frame()));
        assert!(!is_frag_test(&pmtu_discovery_frame()));
        assert!(is_pmtu_discovery(&pmtu_discovery_frame()));
        assert!(!is_pmtu_discovery(&frag_test_frame()));
        let mut dirty = pmtu_discovery_frame();
        dirty[100] = 7;
        assert!(!is_pmtu_discovery(&dirty));
    }

    #[test]
    fn zeroed_frames_of_sentinel_length_are_not_sentinels() {
        // Same length as the sentinels, as a verification frame may be.
        assert!(!is_pmtu_discovery(&vec![0u8; PMTU_DISCOVERY_SIZE]));
        assert!(!is_frag_test(&vec![0u8; FRAG_TEST_SIZE]));
    }

    #[test]
    fn protocol_tags_round_trip() {
        for byte in 0u8..=6 {
            let tag = ProtocolTag::try_from(byte).unwrap();
            assert_eq!(u8::from(tag), byte);
        }
        assert_eq!(ProtocolTag::try_from(7), Err(WireError::UnknownTag(7)));
    }

    #[test]
    fn version_negotiation_picks_highest_common() {
        let ours = ProtocolHeader {
            magic: PROTOCOL_MAGIC,
            min_version: 1,
            max_version: 3,
        };
        let theirs = ProtocolHeader {
            magic: PROTOCOL_MAGIC,
            min_version: 2,
            max_version: 5,
        };
        assert_eq!(ours.negotiate(&theirs), Ok(3));

        let disjoint = ProtocolHeader {
            magic: PROTOCOL_MAGIC,
            min_version: 4,
            max_version: 5,
        };
        assert!(matches!(
            ours.negotiate(&disjoint),
            Err(WireError::VersionMismatch { .. })
        ));

        let stranger = ProtocolHeader {
            magic: *b"SSH-2",
            min_version: 1,
            max_version: 1,
        };
        assert_eq!(ours.negotiate(&stranger), Err(WireError::BadMagic));
    }

    #[test]
    fn heartbeat_timeout_is_six_slow_heartbeats() {
        assert_eq!(HEARTBEAT_TIMEOUT, Duration::from_secs(60));
    }
}
