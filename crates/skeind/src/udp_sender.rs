//! UDP senders used by the forwarder pipelines.
//!
//! The non-DF pipeline shares the router's UDP socket, which never sets
//! the don't-fragment bit. The DF pipeline gets its own raw socket so the
//! kernel reports `EMSGSIZE` (and the path MTU) when a packet is too big,
//! while still sending from the router's UDP port.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

const UDP_HEADER_SIZE: usize = 8;

pub trait UdpSender: Send + Sync {
    fn send(&self, packet: &[u8]) -> Result<(), SendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The packet exceeds the path MTU. `pmtu` is the kernel's current
    /// estimate when it could be read.
    #[error("message too big (pmtu {pmtu:?})")]
    MsgTooBig { pmtu: Option<usize> },

    /// Local congestion; the packet was dropped.
    #[error("packet dropped: {0}")]
    Dropped(io::Error),

    #[error(transparent)]
    Io(io::Error),
}

fn classify(err: io::Error, pmtu: impl FnOnce() -> Option<usize>) -> SendError {
    match err.raw_os_error() {
        Some(libc::EMSGSIZE) => SendError::MsgTooBig { pmtu: pmtu() },
        Some(libc::ENOBUFS) | Some(libc::EAGAIN) => SendError::Dropped(err),
        _ => SendError::Io(err),
    }
}

/// Set `IP_MTU_DISCOVER` on an IPv4 socket.
pub fn set_pmtu_discovery(socket: SockRef<'_>, mode: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &mode as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Path MTU of a connected socket.
fn path_mtu(socket: &Socket) -> io::Result<usize> {
    let mut mtu: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU,
            &mut mtu as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    usize::try_from(mtu).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative MTU"))
}

// ── Simple ────────────────────────────────────────────────────────────────────

pub struct SimpleUdpSender {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
}

impl SimpleUdpSender {
    pub fn new(socket: Arc<UdpSocket>, addr: SocketAddr) -> Self {
        Self { socket, addr }
    }
}

impl UdpSender for SimpleUdpSender {
    fn send(&self, packet: &[u8]) -> Result<(), SendError> {
        self.socket
            .send_to(packet, self.addr)
            .map(|_| ())
            .map_err(|e| classify(e, || None))
    }
}

// ── Raw ───────────────────────────────────────────────────────────────────────

/// Sends UDP datagrams with DF set through a raw IPv4 socket. The kernel
/// builds the IP header; we build the UDP header so the source port
/// matches the router's listening port.
pub struct RawUdpSender {
    socket: Socket,
    local_port: u16,
    remote: SocketAddrV4,
}

impl RawUdpSender {
    pub fn new(local_port: u16, remote: SocketAddrV4) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP))?;
        set_pmtu_discovery(SockRef::from(&socket), libc::IP_PMTUDISC_DO)?;
        // Raw sockets see every inbound UDP packet; we never read them.
        socket.set_recv_buffer_size(0)?;
        socket.connect(&SocketAddr::V4(SocketAddrV4::new(*remote.ip(), 0)).into())?;
        Ok(Self {
            socket,
            local_port,
            remote,
        })
    }
}

/// UDP header followed by `payload`. The checksum is left zero, which
/// IPv4 permits.
fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Result<Vec<u8>, SendError> {
    let len = u16::try_from(UDP_HEADER_SIZE + payload.len())
        .map_err(|_| SendError::MsgTooBig { pmtu: None })?;
    let mut datagram = Vec::with_capacity(usize::from(len));
    datagram.extend_from_slice(&src_port.to_be_bytes());
    datagram.extend_from_slice(&dst_port.to_be_bytes());
    datagram.extend_from_slice(&len.to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(payload);
    Ok(datagram)
}

impl UdpSender for RawUdpSender {
    fn send(&self, packet: &[u8]) -> Result<(), SendError> {
        let datagram = udp_datagram(self.local_port, self.remote.port(), packet)?;
        self.socket
            .send(&datagram)
            .map(|_| ())
            .map_err(|e| classify(e, || path_mtu(&self.socket).ok()))
    }
}
