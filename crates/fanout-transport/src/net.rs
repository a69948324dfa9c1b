//! # Datagram and Back-Channel Plumbing
//!
//! Thin socket wrappers: an IPv4 multicast channel (send or receive side)
//! and framed header+body I/O over the TCP back-channel. No session state
//! lives here.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream, UdpSocket};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use bytes::BytesMut;

use crate::error::{Result, TransportError};
use crate::wire::{PacketHeader, HEADER_LEN};

/// Upper bound on any framed back-channel body. Nothing legitimate comes
/// close; larger values mean a desynchronized or hostile peer.
const MAX_FRAME_BODY: u32 = 1 << 20;

// ─── Multicast Channel ──────────────────────────────────────────────────────

/// One side of the multicast datagram channel.
pub struct McastChannel {
    sock: UdpSocket,
    group: SocketAddrV4,
}

impl McastChannel {
    /// Open a sending socket on `iface` with the given TTL. Loopback
    /// delivery is left enabled so co-located receivers (and tests) work.
    pub fn sender(group: Ipv4Addr, port: u16, iface: Ipv4Addr, ttl: u8) -> io::Result<Self> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_multicast_if_v4(&iface)?;
        sock.set_multicast_ttl_v4(ttl as u32)?;
        sock.set_multicast_loop_v4(true)?;
        sock.bind(&SocketAddrV4::new(iface, 0).into())?;
        Ok(McastChannel {
            sock: sock.into(),
            group: SocketAddrV4::new(group, port),
        })
    }

    /// Join `group` on `iface` for receiving (IGMP membership included).
    pub fn receiver(group: Ipv4Addr, port: u16, iface: Ipv4Addr) -> io::Result<Self> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        sock.bind(&SocketAddrV4::new(group, port).into())?;
        sock.join_multicast_v4(&group, &iface)?;
        // Line-rate bursts outrun the default receive buffer; ask for a
        // deeper one (clamped by net.core.rmem_max, so best effort).
        let _ = sock.set_recv_buffer_size(4 * 1024 * 1024);
        Ok(McastChannel {
            sock: sock.into(),
            group: SocketAddrV4::new(group, port),
        })
    }

    /// Multicast one packet to the group.
    pub fn send_packet(&self, packet: &[u8]) -> io::Result<usize> {
        self.sock.send_to(packet, self.group)
    }

    /// Blocking receive of one packet.
    pub fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.sock.recv(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is queued. Used to drain
    /// straggler packets after EOF.
    pub fn try_recv_packet(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        self.sock.set_nonblocking(true)?;
        let res = self.sock.recv(buf);
        self.sock.set_nonblocking(false)?;
        match res {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }
}

#[cfg(unix)]
impl AsRawFd for McastChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

// ─── Back-Channel Framing ───────────────────────────────────────────────────

/// Read one 16-byte header off a stream.
pub(crate) fn read_header(stream: &mut TcpStream) -> Result<PacketHeader> {
    let mut raw = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut raw)
        .map_err(TransportError::from_socket)?;
    PacketHeader::decode(&mut &raw[..])
}

/// Read a `len`-byte body off a stream.
pub(crate) fn read_body(stream: &mut TcpStream, len: u32) -> Result<BytesMut> {
    if len > MAX_FRAME_BODY {
        return Err(TransportError::MalformedHeader("oversized frame body"));
    }
    let mut body = BytesMut::zeroed(len as usize);
    stream
        .read_exact(&mut body)
        .map_err(TransportError::from_socket)?;
    Ok(body)
}

/// Discard a `len`-byte body, keeping the stream framing intact.
pub(crate) fn skip_body(stream: &mut TcpStream, len: u32) -> Result<()> {
    let mut remaining = len as usize;
    let mut scratch = [0u8; 4096];
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        let n = stream
            .read(&mut scratch[..want])
            .map_err(TransportError::from_socket)?;
        if n == 0 {
            return Err(TransportError::PeerGone(io::ErrorKind::UnexpectedEof.into()));
        }
        remaining -= n;
    }
    Ok(())
}

/// Write one header+body frame.
pub(crate) fn write_frame(stream: &mut TcpStream, header: &PacketHeader, body: &[u8]) -> Result<()> {
    debug_assert_eq!(header.data_len as usize, body.len());
    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    header.encode(&mut frame);
    frame.extend_from_slice(body);
    stream
        .write_all(&frame)
        .map_err(TransportError::from_socket)?;
    Ok(())
}

/// Resolve and connect to the sender's back-channel server.
pub(crate) fn connect_back_channel(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).map_err(TransportError::from_socket)?;
    stream.set_nodelay(true).map_err(TransportError::from_socket)?;
    Ok(stream)
}

// ─── Readiness ──────────────────────────────────────────────────────────────

/// Wait up to `timeout` for either fd to become readable.
/// Returns `(a_ready, b_ready)`; `(false, false)` on timeout or EINTR.
#[cfg(unix)]
pub(crate) fn poll2(a: RawFd, b: RawFd, timeout: Duration) -> io::Result<(bool, bool)> {
    const READABLE: libc::c_short = libc::POLLIN | libc::POLLERR | libc::POLLHUP;
    let mut fds = [
        libc::pollfd {
            fd: a,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: b,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok((false, false));
        }
        return Err(err);
    }
    Ok((
        fds[0].revents & READABLE != 0,
        fds[1].revents & READABLE != 0,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_multicast_roundtrip() {
        let group = Ipv4Addr::new(239, 89, 77, 1);
        let iface = Ipv4Addr::new(127, 0, 0, 1);
        let rx = McastChannel::receiver(group, 47011, iface).unwrap();
        let tx = McastChannel::sender(group, 47011, iface, 1).unwrap();

        tx.send_packet(b"fanout probe").unwrap();
        let mut buf = [0u8; 64];
        let n = rx.recv_packet(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"fanout probe");
    }

    #[test]
    fn try_recv_returns_none_when_idle() {
        let group = Ipv4Addr::new(239, 89, 77, 2);
        let iface = Ipv4Addr::new(127, 0, 0, 1);
        let rx = McastChannel::receiver(group, 47012, iface).unwrap();
        let mut buf = [0u8; 64];
        assert!(rx.try_recv_packet(&mut buf).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn poll2_reports_readiness() {
        let group = Ipv4Addr::new(239, 89, 77, 3);
        let iface = Ipv4Addr::new(127, 0, 0, 1);
        let rx = McastChannel::receiver(group, 47013, iface).unwrap();
        let other = McastChannel::receiver(Ipv4Addr::new(239, 89, 77, 4), 47014, iface).unwrap();
        let tx = McastChannel::sender(group, 47013, iface, 1).unwrap();

        // Nothing pending: poll times out.
        let (a, b) = poll2(
            rx.as_raw_fd(),
            other.as_raw_fd(),
            Duration::from_millis(20),
        )
        .unwrap();
        assert!(!a && !b);

        tx.send_packet(b"x").unwrap();
        let (a, b) = poll2(rx.as_raw_fd(), other.as_raw_fd(), Duration::from_secs(2)).unwrap();
        assert!(a);
        assert!(!b);
    }
}
