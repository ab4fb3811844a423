// Numan Thabit 2025
// io/packets.rs - reusable mmsghdr/iovec/sockaddr staging for sendmmsg/recvmmsg
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

use bytes::{Bytes, BytesMut};

use crate::msg::Datagram;
use crate::queue::OutboundQueue;

/// Control-message scratch per slot. Sized for one SOL_UDP option (GSO on
/// send, GRO on receive) plus slack, aligned for cmsghdr access.
const CMSG_SCRATCH: usize = 64;

#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct CmsgSpace([u8; CMSG_SCRATCH]);

/// Pooled staging area marshalling buffers and peer addresses to and from
/// the kernel for `sendmmsg`/`recvmmsg`. One array exists per event-loop
/// registration and is shared by every channel on that loop.
///
/// The slot vectors are allocated once and never grow, so the raw pointers
/// written into each `msghdr` stay valid even if the array value itself is
/// moved. Pointers into payload and receive buffers are only valid from
/// staging until the following syscall: callers must not mutate the staged
/// buffers in between, and must drain every received slot into owned
/// [`Datagram`]s before dispatching to user code.
pub struct PacketArray {
    hdrs: Vec<libc::mmsghdr>,
    iovs: Vec<libc::iovec>,
    addrs: Vec<libc::sockaddr_storage>,
    cmsgs: Vec<CmsgSpace>,
    count: usize,
}

impl PacketArray {
    /// Creates an array with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            hdrs: (0..capacity).map(|_| unsafe { mem::zeroed() }).collect(),
            iovs: (0..capacity).map(|_| unsafe { mem::zeroed() }).collect(),
            addrs: (0..capacity).map(|_| unsafe { mem::zeroed() }).collect(),
            cmsgs: vec![CmsgSpace([0; CMSG_SCRATCH]); capacity],
            count: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.hdrs.len()
    }

    /// Slots staged since the last reset.
    pub fn count(&self) -> usize {
        self.count
    }

    /// True when no slot is staged.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Empties the slot view. Underlying allocations are preserved.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Stages one outbound payload. The recipient is omitted (kernel uses
    /// the connected peer) when `recipient` is `None`; a segment size adds
    /// the UDP_SEGMENT control message. Returns false at capacity.
    pub fn add_send(
        &mut self,
        payload: &Bytes,
        recipient: Option<SocketAddr>,
        segment_size: Option<u16>,
    ) -> bool {
        if self.count == self.capacity() {
            return false;
        }
        let i = self.count;

        self.iovs[i] = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };

        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        if let Some(addr) = recipient {
            let len = write_sockaddr(addr, &mut self.addrs[i]);
            hdr.msg_name = &mut self.addrs[i] as *mut _ as *mut libc::c_void;
            hdr.msg_namelen = len;
        }
        hdr.msg_iov = &mut self.iovs[i];
        hdr.msg_iovlen = 1;
        if let Some(segment) = segment_size {
            unsafe {
                encode_cmsg(
                    &mut hdr,
                    &mut self.cmsgs[i],
                    libc::SOL_UDP,
                    libc::UDP_SEGMENT,
                    segment,
                );
            }
        }

        self.hdrs[i] = libc::mmsghdr {
            msg_hdr: hdr,
            msg_len: 0,
        };
        self.count += 1;
        true
    }

    /// Stages up to `max` messages from the front of the outbound queue.
    /// Peer addresses are omitted in connected mode. Returns the number of
    /// slots staged.
    pub fn add_outbound(&mut self, queue: &OutboundQueue, connected: bool, max: usize) -> usize {
        let mut staged = 0;
        for msg in queue.iter().take(max) {
            let recipient = if connected { None } else { msg.recipient() };
            if !self.add_send(msg.payload(), recipient, msg.segment_size()) {
                break;
            }
            staged += 1;
        }
        staged
    }

    /// Stages one writable region of the receive buffer as a slot with room
    /// for a peer address and receive control messages. Returns false at
    /// capacity.
    pub fn add_writable(&mut self, buf: &mut BytesMut, offset: usize, len: usize) -> bool {
        if self.count == self.capacity() {
            return false;
        }
        assert!(offset + len <= buf.len(), "writable region out of bounds");
        let i = self.count;

        self.iovs[i] = libc::iovec {
            iov_base: unsafe { buf.as_mut_ptr().add(offset) } as *mut libc::c_void,
            iov_len: len,
        };
        self.addrs[i] = unsafe { mem::zeroed() };

        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        hdr.msg_name = &mut self.addrs[i] as *mut _ as *mut libc::c_void;
        hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        hdr.msg_iov = &mut self.iovs[i];
        hdr.msg_iovlen = 1;
        hdr.msg_control = self.cmsgs[i].0.as_mut_ptr() as *mut libc::c_void;
        hdr.msg_controllen = CMSG_SCRATCH as _;

        self.hdrs[i] = libc::mmsghdr {
            msg_hdr: hdr,
            msg_len: 0,
        };
        self.count += 1;
        true
    }

    /// Bytes the kernel reported for slot `i`.
    pub fn received_len(&self, i: usize) -> usize {
        self.hdrs[i].msg_len as usize
    }

    pub(crate) fn set_received_len(&mut self, i: usize, len: usize) {
        self.hdrs[i].msg_len = len as _;
    }

    /// Peer address the kernel filled into slot `i`, if any.
    pub fn sender(&self, i: usize) -> Option<SocketAddr> {
        decode_sockaddr(&self.addrs[i], self.hdrs[i].msg_hdr.msg_namelen)
    }

    /// Kernel-reported gso_size for slot `i` when UDP_GRO coalesced the
    /// datagram.
    pub fn gro_segment_size(&self, i: usize) -> Option<u16> {
        decode_gro(&self.hdrs[i].msg_hdr)
    }

    /// Materialises the inbound datagram for slot `i` around an owned
    /// payload. Carries the slot's sender and, when GRO fired, its segment
    /// size, so the caller can fan it out before delivery.
    pub fn datagram(&self, i: usize, payload: Bytes, recipient: Option<SocketAddr>) -> Datagram {
        Datagram {
            sender: self.sender(i),
            segment_size: self.gro_segment_size(i),
            payload,
            recipient,
        }
    }

    pub(crate) fn raw_parts(&mut self) -> (*mut libc::mmsghdr, libc::c_uint) {
        (self.hdrs.as_mut_ptr(), self.count as libc::c_uint)
    }

    #[cfg(test)]
    fn hdr(&self, i: usize) -> &libc::msghdr {
        &self.hdrs[i].msg_hdr
    }
}

// The staged pointers are only dereferenced by syscalls issued from the
// owning event-loop thread.
unsafe impl Send for PacketArray {}

/// Encodes one fixed-size control message into the slot scratch space and
/// points the header at it.
///
/// # Safety
/// `space` must stay alive and unmoved until the syscall using `hdr` returns.
unsafe fn encode_cmsg<T: Copy>(
    hdr: &mut libc::msghdr,
    space: &mut CmsgSpace,
    level: libc::c_int,
    ty: libc::c_int,
    value: T,
) {
    let payload_len = mem::size_of::<T>() as libc::c_uint;
    hdr.msg_control = space.0.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = libc::CMSG_SPACE(payload_len) as _;
    let cmsg = libc::CMSG_FIRSTHDR(hdr);
    (*cmsg).cmsg_level = level;
    (*cmsg).cmsg_type = ty;
    (*cmsg).cmsg_len = libc::CMSG_LEN(payload_len) as _;
    ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut T, value);
}

fn decode_gro(hdr: &libc::msghdr) -> Option<u16> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(hdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_UDP && (*cmsg).cmsg_type == libc::UDP_GRO {
                let size = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                return u16::try_from(size).ok().filter(|s| *s > 0);
            }
            cmsg = libc::CMSG_NXTHDR(hdr, cmsg);
        }
    }
    None
}

/// Writes `addr` into a `sockaddr_storage`, returning the populated length.
pub(crate) fn write_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { ptr::write(storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Decodes a kernel-filled `sockaddr_storage`. A zero length means the
/// kernel provided no peer address (connected receive).
pub(crate) fn decode_sockaddr(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    if len == 0 {
        return None;
    }
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let sin: libc::sockaddr_in = unsafe { ptr::read(storage as *const _ as *const _) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6: libc::sockaddr_in6 = unsafe { ptr::read(storage as *const _ as *const _) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::DatagramMessage;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn sockaddr_round_trips_both_families() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let v4 = addr(4433);
        let len = write_sockaddr(v4, &mut storage);
        assert_eq!(decode_sockaddr(&storage, len), Some(v4));

        let v6: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        let len = write_sockaddr(v6, &mut storage);
        assert_eq!(decode_sockaddr(&storage, len), Some(v6));
    }

    #[test]
    fn unconnected_send_carries_peer_address() {
        let mut array = PacketArray::new(4);
        assert!(array.add_send(&Bytes::from_static(b"x"), Some(addr(7)), None));
        assert_eq!(array.count(), 1);
        assert!(array.hdr(0).msg_namelen > 0);
        assert!(array.hdr(0).msg_controllen == 0);
    }

    #[test]
    fn connected_send_omits_peer_address() {
        let mut array = PacketArray::new(4);
        let mut queue = OutboundQueue::new();
        queue.push_detached(DatagramMessage::Addressed {
            payload: Bytes::from_static(b"x"),
            recipient: Some(addr(7)),
        });

        let staged = array.add_outbound(&queue, true, 8);
        assert_eq!(staged, 1);
        assert_eq!(array.hdr(0).msg_namelen, 0);
        assert!(array.hdr(0).msg_name.is_null());
    }

    #[test]
    fn segmented_send_encodes_gso_control_message() {
        let mut array = PacketArray::new(4);
        assert!(array.add_send(&Bytes::from_static(b"abcdef"), Some(addr(7)), Some(3)));
        let hdr = array.hdr(0);
        assert!(hdr.msg_controllen > 0);

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(hdr);
            assert!(!cmsg.is_null());
            assert_eq!((*cmsg).cmsg_level, libc::SOL_UDP);
            assert_eq!((*cmsg).cmsg_type, libc::UDP_SEGMENT);
            let size = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const u16);
            assert_eq!(size, 3);
        }
    }

    #[test]
    fn staging_stops_at_capacity() {
        let mut array = PacketArray::new(2);
        let mut queue = OutboundQueue::new();
        for _ in 0..5 {
            queue.push_detached(DatagramMessage::Addressed {
                payload: Bytes::from_static(b"x"),
                recipient: Some(addr(7)),
            });
        }

        assert_eq!(array.add_outbound(&queue, false, 8), 2);
        assert_eq!(array.count(), 2);

        array.reset();
        assert_eq!(array.add_outbound(&queue, false, 1), 1);
    }

    #[test]
    fn writable_regions_stride_through_the_buffer() {
        let mut array = PacketArray::new(4);
        let mut buf = BytesMut::new();
        buf.resize(4096, 0);
        let base = buf.as_ptr() as usize;

        assert!(array.add_writable(&mut buf, 0, 1024));
        assert!(array.add_writable(&mut buf, 1024, 1024));
        assert_eq!(array.count(), 2);

        assert_eq!(array.iovs[0].iov_base as usize, base);
        assert_eq!(array.iovs[1].iov_base as usize, base + 1024);
        assert_eq!(array.iovs[1].iov_len, 1024);
        assert!(array.hdr(1).msg_namelen > 0);
    }

    #[test]
    fn gro_segment_size_decodes_from_control_message() {
        let mut array = PacketArray::new(1);
        let mut buf = BytesMut::new();
        buf.resize(2048, 0);
        assert!(array.add_writable(&mut buf, 0, 2048));

        // Pretend the kernel reported gso_size = 500.
        let space = &mut array.cmsgs[0];
        let hdr = &mut array.hdrs[0].msg_hdr;
        unsafe {
            encode_cmsg(hdr, space, libc::SOL_UDP, libc::UDP_GRO, 500 as libc::c_int);
        }

        assert_eq!(array.gro_segment_size(0), Some(500));
    }

    #[test]
    fn reset_preserves_capacity() {
        let mut array = PacketArray::new(8);
        assert!(array.add_send(&Bytes::from_static(b"x"), Some(addr(7)), None));
        array.reset();
        assert_eq!(array.count(), 0);
        assert_eq!(array.capacity(), 8);
    }
}
