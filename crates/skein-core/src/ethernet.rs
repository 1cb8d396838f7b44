//! Ethernet and IPv4 handling on captured frames.
//!
//! Decoding goes through etherparse's zero-copy header slices. Frames we
//! emit ourselves (IP fragments, ICMP "fragmentation needed") are built by
//! hand since they are mostly copies of the original headers.

use std::net::Ipv4Addr;

use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice};

use crate::wire::ETHERNET_OVERHEAD;

pub type Mac = [u8; 6];

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const BROADCAST_MAC: Mac = [0xff; 6];
pub const ZERO_MAC: Mac = [0; 6];

const STP_PREFIX: [u8; 5] = [0x01, 0x80, 0xc2, 0x00, 0x00];
const IPV4_MULTICAST_PREFIX: [u8; 3] = [0x01, 0x00, 0x5e];
const IPV6_MULTICAST_PREFIX: [u8; 2] = [0x33, 0x33];

const IP_PROTO_ICMP: u8 = 1;
const IP_FLAG_DF: u16 = 0x4000;
const IP_FLAG_MF: u16 = 0x2000;
const IP_OFFSET_MASK: u16 = 0x1fff;

pub fn format_mac(mac: &Mac) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// The IPv4 header fields routing decisions depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Info {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub header_len: usize,
    pub total_len: usize,
    pub dont_fragment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub src_mac: Mac,
    pub dst_mac: Mac,
    pub ether_type: u16,
    pub ip: Option<Ipv4Info>,
}

impl DecodedFrame {
    /// Decode the Ethernet header and, when present and well formed, the
    /// IPv4 header behind it. A bad IPv4 header leaves `ip` empty.
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let eth = Ethernet2HeaderSlice::from_slice(frame)
            .map_err(|e| FrameError::Malformed(e.to_string()))?;
        let ether_type = eth.ether_type();
        let ip = if ether_type == ETHER_TYPE_IPV4 {
            Ipv4HeaderSlice::from_slice(&frame[ETHERNET_OVERHEAD..])
                .ok()
                .map(|ip| Ipv4Info {
                    src: ip.source_addr(),
                    dst: ip.destination_addr(),
                    header_len: usize::from(ip.ihl()) * 4,
                    total_len: usize::from(ip.total_len()),
                    dont_fragment: ip.dont_fragment(),
                })
        } else {
            None
        };
        Ok(Self {
            src_mac: eth.source(),
            dst_mac: eth.destination(),
            ether_type,
            ip,
        })
    }

    /// Spanning-tree frames must never cross the overlay.
    pub fn drop_frame(&self) -> bool {
        self.dst_mac.starts_with(&STP_PREFIX)
    }

    /// Broadcast and multicast destinations are both flooded.
    pub fn is_broadcast(&self) -> bool {
        self.dst_mac == BROADCAST_MAC
            || self.dst_mac.starts_with(&IPV4_MULTICAST_PREFIX)
            || self.dst_mac.starts_with(&IPV6_MULTICAST_PREFIX)
    }

    pub fn is_pmtu_verify(&self) -> bool {
        self.src_mac == ZERO_MAC && self.dst_mac == ZERO_MAC
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.is_some()
    }

    pub fn dont_fragment(&self) -> bool {
        self.ip.as_ref().is_some_and(|ip| ip.dont_fragment)
    }
}

// ── Fragmentation ─────────────────────────────────────────────────────────────

/// Split an IPv4 frame into fragments of at most `max_frame_len` bytes,
/// Ethernet header included.
///
/// Each fragment repeats the Ethernet and IPv4 headers. The last one keeps
/// the original flags; all others have MF set. Offsets are relative to the
/// original fragment offset so already-fragmented packets split cleanly.
pub fn fragment(frame: &[u8], max_frame_len: usize) -> Result<Vec<Vec<u8>>, FrameError> {
    let dec = DecodedFrame::decode(frame)?;
    let ip = dec.ip.ok_or(FrameError::NotIpv4)?;
    let ip_start = ETHERNET_OVERHEAD;
    let header_len = ip.header_len;
    if frame.len() < ip_start + ip.total_len || ip.total_len < header_len {
        return Err(FrameError::Malformed(format!(
            "IPv4 total length {} does not fit frame of {} bytes",
            ip.total_len,
            frame.len()
        )));
    }

    let max_segment = max_frame_len
        .checked_sub(ETHERNET_OVERHEAD + header_len)
        .map(|n| n & !7)
        .filter(|n| *n > 0)
        .ok_or(FrameError::MtuTooSmall(max_frame_len))?;

    let headers = &frame[..ip_start + header_len];
    let payload = &frame[ip_start + header_len..ip_start + ip.total_len];
    let flags_offset = u16::from_be_bytes([frame[ip_start + 6], frame[ip_start + 7]]);
    let orig_flags = flags_offset & !IP_OFFSET_MASK;
    let offset_base = usize::from(flags_offset & IP_OFFSET_MASK) * 8;

    let mut segments = Vec::with_capacity(payload.len() / max_segment + 1);
    for (index, chunk) in payload.chunks(max_segment).enumerate() {
        let offset = index * max_segment;
        let last = offset + chunk.len() >= payload.len();
        let flags = if last {
            orig_flags
        } else {
            orig_flags | IP_FLAG_MF
        };
        let frag_offset = ((offset + offset_base) / 8) as u16 & IP_OFFSET_MASK;

        let mut seg = Vec::with_capacity(headers.len() + chunk.len());
        seg.extend_from_slice(headers);
        seg.extend_from_slice(chunk);
        let ip_hdr = &mut seg[ip_start..ip_start + header_len];
        ip_hdr[2..4].copy_from_slice(&((header_len + chunk.len()) as u16).to_be_bytes());
        ip_hdr[6..8].copy_from_slice(&(flags | frag_offset).to_be_bytes());
        ip_hdr[10..12].copy_from_slice(&[0, 0]);
        let sum = checksum(ip_hdr);
        ip_hdr[10..12].copy_from_slice(&sum.to_be_bytes());
        segments.push(seg);
    }
    Ok(segments)
}

// ── ICMP ──────────────────────────────────────────────────────────────────────

/// Build an ICMP "fragmentation needed" (type 3, code 4) frame answering
/// `frame`, addressed back to its sender. `mtu` goes in the next-hop MTU
/// field; the original IPv4 header plus 8 bytes of its payload follow.
pub fn frag_needed(frame: &[u8], mtu: usize) -> Result<Vec<u8>, FrameError> {
    let dec = DecodedFrame::decode(frame)?;
    let ip = dec.ip.ok_or(FrameError::NotIpv4)?;
    let quoted_end = (ETHERNET_OVERHEAD + ip.header_len + 8).min(frame.len());
    let quoted = &frame[ETHERNET_OVERHEAD..quoted_end];
    let tos = frame[ETHERNET_OVERHEAD + 1];

    let icmp_len = 8 + quoted.len();
    let total_len = 20 + icmp_len;
    let mut out = Vec::with_capacity(ETHERNET_OVERHEAD + total_len);

    out.extend_from_slice(&dec.src_mac);
    out.extend_from_slice(&dec.dst_mac);
    out.extend_from_slice(&dec.ether_type.to_be_bytes());

    let ip_start = out.len();
    out.extend_from_slice(&[0x45, tos]);
    out.extend_from_slice(&(total_len as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]); // id, flags, offset
    out.extend_from_slice(&[64, IP_PROTO_ICMP, 0, 0]);
    out.extend_from_slice(&ip.dst.octets());
    out.extend_from_slice(&ip.src.octets());
    let sum = checksum(&out[ip_start..]);
    out[ip_start + 10..ip_start + 12].copy_from_slice(&sum.to_be_bytes());

    let icmp_start = out.len();
    out.extend_from_slice(&[3, 4, 0, 0, 0, 0]);
    out.extend_from_slice(&(mtu.min(usize::from(u16::MAX)) as u16).to_be_bytes());
    out.extend_from_slice(quoted);
    let sum = checksum(&out[icmp_start..]);
    out[icmp_start + 2..icmp_start + 4].copy_from_slice(&sum.to_be_bytes());

    Ok(out)
}

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// True when the frame is IPv4 with the don't-fragment bit set. Cheaper
/// than a full decode for callers that only need the flag.
pub fn has_dont_fragment(frame: &[u8]) -> bool {
    frame.len() >= ETHERNET_OVERHEAD + 8
        && u16::from_be_bytes([frame[12], frame[13]]) == ETHER_TYPE_IPV4
        && u16::from_be_bytes([frame[ETHERNET_OVERHEAD + 6], frame[ETHERNET_OVERHEAD + 7]])
            & IP_FLAG_DF
            != 0
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("not an IPv4 frame")]
    NotIpv4,

    #[error("MTU {0} leaves no room for IPv4 payload")]
    MtuTooSmall(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
