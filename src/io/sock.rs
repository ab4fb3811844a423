// Numan Thabit 2025
// io/sock.rs - nonblocking UDP socket with msg-family syscalls and multicast
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use nix::errno::Errno;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::ChannelOptions;
use crate::io::packets::PacketArray;

/// Interface selector for multicast group operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastInterface {
    /// IPv4 interface identified by one of its addresses.
    V4(Ipv4Addr),
    /// IPv6 interface identified by index.
    V6(u32),
    /// Let the kernel pick via the routing table.
    Unspecified,
}

/// Nonblocking UDP socket. socket2 carries creation and option plumbing;
/// the batched and ancillary-data paths go through raw fd syscalls on the
/// staging array.
///
/// All wrappers surface EAGAIN as a zero return: the edge-triggered loop
/// treats zero as "not ready, re-arm and come back".
#[derive(Debug)]
pub struct UdpSock {
    sock: Option<Socket>,
    ipv6: bool,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}

impl UdpSock {
    /// Creates a nonblocking datagram socket for the requested family.
    pub fn new(ipv6: bool) -> io::Result<Self> {
        let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_nonblocking(true)?;
        sock.set_cloexec(true)?;
        Ok(Self {
            sock: Some(sock),
            ipv6,
        })
    }

    /// Adopts an already-bound std socket (inbound construction).
    pub fn from_std(socket: UdpSocket) -> io::Result<Self> {
        let ipv6 = matches!(socket.local_addr()?, SocketAddr::V6(_));
        let sock = unsafe { Socket::from_raw_fd(socket.into_raw_fd()) };
        sock.set_nonblocking(true)?;
        Ok(Self {
            sock: Some(sock),
            ipv6,
        })
    }

    fn sock(&self) -> io::Result<&Socket> {
        self.sock.as_ref().ok_or_else(closed)
    }

    /// Raw fd for epoll registration. -1 once closed.
    pub fn raw_fd(&self) -> RawFd {
        self.sock.as_ref().map_or(-1, |s| s.as_raw_fd())
    }

    /// True while the fd is open.
    pub fn is_open(&self) -> bool {
        self.sock.is_some()
    }

    /// True for AF_INET6 sockets.
    pub fn is_ipv6(&self) -> bool {
        self.ipv6
    }

    /// Applies configured socket options. Unsupported GRO is reported by the
    /// capability probe before this runs, so errors here are real failures.
    pub fn apply_options(&self, opts: &ChannelOptions) -> io::Result<()> {
        let sock = self.sock()?;
        if let Some(reuse) = opts.reuse_address {
            sock.set_reuse_address(reuse)?;
        }
        if let Some(broadcast) = opts.broadcast {
            sock.set_broadcast(broadcast)?;
        }
        if let Some(size) = opts.recv_buffer_size {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(size) = opts.send_buffer_size {
            sock.set_send_buffer_size(size)?;
        }
        if let Some(ttl) = opts.multicast_ttl {
            if !self.ipv6 {
                sock.set_multicast_ttl_v4(ttl)?;
            }
        }
        if let Some(on) = opts.multicast_loop {
            if self.ipv6 {
                sock.set_multicast_loop_v6(on)?;
            } else {
                sock.set_multicast_loop_v4(on)?;
            }
        }
        if opts.udp_gro {
            self.set_udp_gro()?;
        }
        Ok(())
    }

    fn set_udp_gro(&self) -> io::Result<()> {
        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                self.raw_fd(),
                libc::SOL_UDP,
                libc::UDP_GRO,
                &on as *const _ as *const libc::c_void,
                mem::size_of_val(&on) as libc::socklen_t,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Binds to `local`.
    pub fn bind(&self, local: SocketAddr) -> io::Result<()> {
        self.sock()?.bind(&SockAddr::from(local))
    }

    /// Connects the socket to a single peer.
    pub fn connect(&self, remote: SocketAddr) -> io::Result<()> {
        self.sock()?.connect(&SockAddr::from(remote))
    }

    /// Dissolves the peer association with an AF_UNSPEC connect.
    pub fn disconnect(&self) -> io::Result<()> {
        let fd = self.sock()?.as_raw_fd();
        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        addr.ss_family = libc::AF_UNSPEC as libc::sa_family_t;
        let rc = unsafe {
            libc::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr>() as libc::socklen_t,
            )
        };
        // Linux may report EAFNOSUPPORT even though the association was
        // dissolved.
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(Errno::EAFNOSUPPORT as i32) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Closes the fd. Further operations fail with a closed error.
    pub fn close(&mut self) {
        self.sock = None;
    }

    /// Locally bound address.
    pub fn local_addr(&self) -> io::Result<Option<SocketAddr>> {
        Ok(self.sock()?.local_addr()?.as_socket())
    }

    /// Connected peer address, if any.
    pub fn peer_addr(&self) -> io::Result<Option<SocketAddr>> {
        match self.sock()?.peer_addr() {
            Ok(addr) => Ok(addr.as_socket()),
            Err(err) if err.raw_os_error() == Some(Errno::ENOTCONN as i32) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Reads one datagram on a connected socket. Zero means EAGAIN or an
    /// empty datagram; either way the read loop stops.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.sock()?.as_raw_fd();
        loop {
            let n = unsafe {
                libc::recv(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            return match n {
                -1 => match Errno::last() {
                    Errno::EAGAIN => Ok(0),
                    Errno::EINTR => continue,
                    errno => Err(io::Error::from_raw_os_error(errno as i32)),
                },
                n => Ok(n as usize),
            };
        }
    }

    /// Sends one datagram to the connected peer. Zero means EAGAIN.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self.sock()?.send(buf) {
            Ok(n) => Ok(n),
            Err(err) => Self::zero_on_eagain(err),
        }
    }

    /// Sends one datagram to `addr`. Zero means EAGAIN.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.sock()?.send_to(buf, &SockAddr::from(addr)) {
            Ok(n) => Ok(n),
            Err(err) => Self::zero_on_eagain(err),
        }
    }

    fn zero_on_eagain(err: io::Error) -> io::Result<usize> {
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(0)
        } else {
            Err(err)
        }
    }

    /// Sends the staged slots with one `sendmmsg`. Returns the number of
    /// messages the kernel accepted; zero means EAGAIN.
    pub fn sendmmsg(&self, array: &mut PacketArray) -> io::Result<usize> {
        let fd = self.sock()?.as_raw_fd();
        let (hdrs, count) = array.raw_parts();
        if count == 0 {
            return Ok(0);
        }
        loop {
            let n = unsafe { libc::sendmmsg(fd, hdrs, count, 0) };
            return match n {
                -1 => match Errno::last() {
                    Errno::EAGAIN => Ok(0),
                    Errno::EINTR => continue,
                    errno => Err(io::Error::from_raw_os_error(errno as i32)),
                },
                n => Ok(n as usize),
            };
        }
    }

    /// Receives one datagram into slot 0 of the staged array, capturing the
    /// peer address and any GRO control message. Zero means EAGAIN or an
    /// empty datagram.
    pub fn recvmsg(&self, array: &mut PacketArray) -> io::Result<usize> {
        let fd = self.sock()?.as_raw_fd();
        let (hdrs, count) = array.raw_parts();
        debug_assert!(count >= 1);
        loop {
            let n = unsafe { libc::recvmsg(fd, &mut (*hdrs).msg_hdr, 0) };
            return match n {
                -1 => match Errno::last() {
                    Errno::EAGAIN => Ok(0),
                    Errno::EINTR => continue,
                    errno => Err(io::Error::from_raw_os_error(errno as i32)),
                },
                n => {
                    array.set_received_len(0, n as usize);
                    Ok(n as usize)
                }
            };
        }
    }

    /// Receives up to the staged slot count with one `recvmmsg`. Returns the
    /// number of datagrams; zero means EAGAIN.
    pub fn recvmmsg(&self, array: &mut PacketArray) -> io::Result<usize> {
        let fd = self.sock()?.as_raw_fd();
        let (hdrs, count) = array.raw_parts();
        if count == 0 {
            return Ok(0);
        }
        loop {
            let n = unsafe { libc::recvmmsg(fd, hdrs, count, 0, std::ptr::null_mut()) };
            return match n {
                -1 => match Errno::last() {
                    Errno::EAGAIN => Ok(0),
                    Errno::EINTR => continue,
                    errno => Err(io::Error::from_raw_os_error(errno as i32)),
                },
                n => Ok(n as usize),
            };
        }
    }

    /// Joins a multicast group, optionally source-specific.
    pub fn join_group(
        &self,
        group: IpAddr,
        iface: MulticastInterface,
        source: Option<IpAddr>,
    ) -> io::Result<()> {
        let sock = self.sock()?;
        match (group, source) {
            (IpAddr::V4(group), None) => {
                sock.join_multicast_v4(&group, &iface.v4_addr())
            }
            (IpAddr::V4(group), Some(IpAddr::V4(source))) => {
                sock.join_ssm_v4(&source, &group, &iface.v4_addr())
            }
            (IpAddr::V6(group), None) => sock.join_multicast_v6(&group, iface.v6_index()),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "source-specific multicast is IPv4-only",
            )),
        }
    }

    /// Leaves a multicast group, optionally source-specific.
    pub fn leave_group(
        &self,
        group: IpAddr,
        iface: MulticastInterface,
        source: Option<IpAddr>,
    ) -> io::Result<()> {
        let sock = self.sock()?;
        match (group, source) {
            (IpAddr::V4(group), None) => {
                sock.leave_multicast_v4(&group, &iface.v4_addr())
            }
            (IpAddr::V4(group), Some(IpAddr::V4(source))) => {
                sock.leave_ssm_v4(&source, &group, &iface.v4_addr())
            }
            (IpAddr::V6(group), None) => sock.leave_multicast_v6(&group, iface.v6_index()),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "source-specific multicast is IPv4-only",
            )),
        }
    }
}

impl MulticastInterface {
    fn v4_addr(self) -> Ipv4Addr {
        match self {
            MulticastInterface::V4(addr) => addr,
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }

    fn v6_index(self) -> u32 {
        match self {
            MulticastInterface::V6(index) => index,
            _ => 0,
        }
    }
}
