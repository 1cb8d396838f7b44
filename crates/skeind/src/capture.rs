//! Packet capture and injection on the bridge interface.
//!
//! `PacketSocket` is an `AF_PACKET` socket bound to one interface in
//! promiscuous mode. Frames the host sends out (including the ones we
//! inject) are skipped on read.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

use skein_core::ethernet::Mac;

const MAX_FRAME_SIZE: usize = 65536;

/// How long a read blocks before returning `TimedOut`, so the capture
/// thread can notice shutdown.
pub const READ_POLL: Duration = Duration::from_secs(1);

pub trait PacketSource: Send + Sync {
    fn read_packet(&self) -> io::Result<Vec<u8>>;
}

pub trait Injector: Send + Sync {
    fn write_packet(&self, frame: &[u8]) -> io::Result<()>;
}

pub struct PacketSocket {
    socket: Socket,
}

fn eth_p_all() -> u16 {
    (libc::ETH_P_ALL as u16).to_be()
}

impl PacketSocket {
    pub fn open(interface: &str, buf_size_mb: usize) -> Result<Self> {
        let ifindex = nix::net::if_::if_nametoindex(interface)
            .with_context(|| format!("interface '{interface}' not found"))?;
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(i32::from(eth_p_all()))),
        )
        .context("AF_PACKET socket (needs CAP_NET_RAW)")?;

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = eth_p_all();
        addr.sll_ifindex = ifindex as libc::c_int;
        let rc = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("bind to interface");
        }

        let mreq = libc::packet_mreq {
            mr_ifindex: ifindex as libc::c_int,
            mr_type: libc::PACKET_MR_PROMISC as libc::c_ushort,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("enable promiscuous mode");
        }

        socket
            .set_recv_buffer_size(buf_size_mb * 1024 * 1024)
            .context("SO_RCVBUF")?;
        socket.set_read_timeout(Some(READ_POLL)).context("SO_RCVTIMEO")?;
        tracing::info!(interface, ifindex, "capturing");
        Ok(Self { socket })
    }
}

impl PacketSource for PacketSocket {
    fn read_packet(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![MaybeUninit::<u8>::uninit(); MAX_FRAME_SIZE];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf)?;
            let outgoing = from.family() == libc::AF_PACKET as libc::sa_family_t && {
                let ll = unsafe { &*from.as_ptr().cast::<libc::sockaddr_ll>() };
                ll.sll_pkttype == libc::PACKET_OUTGOING
            };
            if outgoing {
                continue;
            }
            let frame = buf[..n]
                .iter()
                .map(|b| unsafe { b.assume_init() })
                .collect();
            return Ok(frame);
        }
    }
}

impl Injector for PacketSocket {
    fn write_packet(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).map(|_| ())
    }
}

/// Hardware address of `interface`, if it has one.
pub fn interface_mac(interface: &str) -> Option<Mac> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    addrs
        .filter(|a| a.interface_name == interface)
        .filter_map(|a| a.address)
        .find_map(|addr| addr.as_link_addr().and_then(|link| link.addr()))
        .filter(|mac| *mac != [0; 6])
}

/// Discards injected frames. Used when no interface is configured and
/// the router only relays.
pub struct NullInjector;

impl Injector for NullInjector {
    fn write_packet(&self, _frame: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_interface_is_reported() {
        let err = PacketSocket::open("skein-nonexistent0", 1)
            .err()
            .expect("no such interface");
        assert!(err.to_string().contains("skein-nonexistent0"));
    }

    #[test]
    fn loopback_has_no_hardware_address() {
        assert_eq!(interface_mac("lo"), None);
    }
}
