// Numan Thabit 2025
// channel.rs - epoll edge-triggered UDP datagram channel
use std::cell::RefCell;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::alloc::{AdaptiveRecvAllocator, RecvAllocator};
use crate::config::ChannelOptions;
use crate::error::ChannelError;
use crate::eventloop::{EpollHandler, EventLoop, Registration, EPOLL_IN, EPOLL_OUT, EPOLL_RDHUP};
use crate::filter::{filter_outbound, OutboundMessage};
use crate::io::caps::Caps;
use crate::io::sock::{MulticastInterface, UdpSock};
use crate::metrics::Metrics;
use crate::msg::{Datagram, DatagramMessage};
use crate::pipeline::Pipeline;
use crate::queue::{OutboundQueue, WriteResult};

enum SpinOutcome {
    Done,
    Again,
    Fail(ChannelError),
}

/// UDP datagram channel driven by an edge-triggered epoll loop.
///
/// All data-path methods must run on the loop thread that owns the channel's
/// [`Registration`]. Lifecycle flags mutate only when the underlying syscall
/// succeeded.
pub struct UdpChannel<P> {
    sock: UdpSock,
    cfg: ChannelOptions,
    caps: Caps,
    reg: Rc<Registration>,
    metrics: Arc<Metrics>,
    pipeline: P,
    queue: OutboundQueue,
    alloc: AdaptiveRecvAllocator,
    token: Option<u64>,
    flags: u32,
    open: bool,
    bound: bool,
    connected: bool,
    active: bool,
    registered: bool,
    read_pending: bool,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl<P: Pipeline> UdpChannel<P> {
    /// Creates a channel for the given address family on the loop owning
    /// `reg`.
    pub fn new(
        ipv6: bool,
        cfg: ChannelOptions,
        pipeline: P,
        reg: Rc<Registration>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ChannelError> {
        let sock = UdpSock::new(ipv6)?;
        sock.apply_options(&cfg)?;
        Ok(Self::from_parts(sock, cfg, pipeline, reg, metrics, false))
    }

    /// Adopts an already-bound std socket. The channel starts out active,
    /// matching inbound construction from a bound fd.
    pub fn from_std(
        socket: UdpSocket,
        cfg: ChannelOptions,
        pipeline: P,
        reg: Rc<Registration>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ChannelError> {
        let sock = UdpSock::from_std(socket)?;
        sock.apply_options(&cfg)?;
        Ok(Self::from_parts(sock, cfg, pipeline, reg, metrics, true))
    }

    fn from_parts(
        sock: UdpSock,
        cfg: ChannelOptions,
        pipeline: P,
        reg: Rc<Registration>,
        metrics: Arc<Metrics>,
        bound: bool,
    ) -> Self {
        let local = if bound {
            sock.local_addr().ok().flatten()
        } else {
            None
        };
        Self {
            sock,
            cfg,
            caps: Caps::probe(),
            reg,
            metrics,
            pipeline,
            queue: OutboundQueue::new(),
            alloc: AdaptiveRecvAllocator::new(),
            token: None,
            flags: 0,
            open: true,
            bound,
            connected: false,
            active: bound,
            registered: false,
            read_pending: false,
            local,
            remote: None,
        }
    }

    /// Adds the channel to the event loop's interest set. Reads are armed
    /// immediately.
    pub fn register(channel: &Rc<RefCell<Self>>, evloop: &mut EventLoop) -> Result<(), ChannelError>
    where
        P: 'static,
    {
        let token = evloop.register(Rc::clone(channel) as Rc<RefCell<dyn EpollHandler>>)?;
        let mut this = channel.borrow_mut();
        this.token = Some(token);
        this.registered = true;
        this.flags = EPOLL_IN | EPOLL_RDHUP;
        Ok(())
    }

    /// Event-loop token assigned at registration.
    pub fn token(&self) -> Option<u64> {
        self.token
    }

    /// Platform capabilities the channel selected its strategies from.
    pub fn caps(&self) -> Caps {
        self.caps
    }

    /// Borrow of the pipeline, e.g. for inspecting a test sink.
    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// True while the fd is open.
    pub fn is_open(&self) -> bool {
        self.open && self.sock.is_open()
    }

    /// True after a successful `connect`.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Active state: the socket is open and either registration (with
    /// `active_on_open`) or a successful bind made the channel live.
    pub fn is_active(&self) -> bool {
        self.sock.is_open() && ((self.cfg.active_on_open && self.registered) || self.active)
    }

    /// True while the channel wants writability events.
    pub fn is_write_pending(&self) -> bool {
        self.flags & EPOLL_OUT != 0
    }

    /// Locally bound address, re-read from the kernel when not cached.
    pub fn local_addr(&mut self) -> Option<SocketAddr> {
        if self.local.is_none() {
            self.local = self.sock.local_addr().ok().flatten();
        }
        self.local
    }

    /// Connected peer address, re-read from the kernel when not cached.
    pub fn remote_addr(&mut self) -> Option<SocketAddr> {
        if self.remote.is_none() {
            self.remote = self.sock.peer_addr().ok().flatten();
        }
        self.remote
    }

    // ---- lifecycle ----

    /// Binds the socket. An IPv4 wildcard on an IPv6 socket is rewritten to
    /// the IPv6 wildcard at the same port.
    pub fn bind(&mut self, local: SocketAddr) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let local = self.translate_wildcard(local);
        self.sock.bind(local)?;
        self.local = self.sock.local_addr()?;
        self.bound = true;
        self.active = true;
        debug!(local = ?self.local, "channel bound");
        Ok(())
    }

    /// Connects to a single peer, optionally binding first.
    pub fn connect(
        &mut self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<(), ChannelError> {
        self.ensure_open()?;
        if let Some(local) = local {
            if !self.bound {
                let local = self.translate_wildcard(local);
                self.sock.bind(local)?;
                self.bound = true;
            }
        }
        self.sock.connect(remote)?;
        self.connected = true;
        self.active = true;
        self.local = self.sock.local_addr()?;
        self.remote = self.sock.peer_addr()?;
        debug!(remote = ?self.remote, "channel connected");
        Ok(())
    }

    /// Dissolves the peer association. Cached addresses are invalidated so
    /// the next query re-reads from the kernel.
    pub fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.sock.disconnect()?;
        self.connected = false;
        self.active = false;
        self.local = None;
        self.remote = None;
        Ok(())
    }

    /// Deregisters and closes the fd exactly once. Queued writes fail with
    /// [`ChannelError::Closed`].
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.connected = false;
        self.active = false;
        self.queue.fail_all_closed();
        self.metrics.queue_depth.set(0);
        if self.registered {
            if let Err(err) = self.reg.delete(self.sock.raw_fd()) {
                warn!(?err, "epoll removal on close failed");
            }
            self.registered = false;
        }
        self.flags = 0;
        self.sock.close();
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.open {
            Ok(())
        } else {
            Err(ChannelError::Closed)
        }
    }

    fn translate_wildcard(&self, addr: SocketAddr) -> SocketAddr {
        match addr {
            SocketAddr::V4(v4) if v4.ip().is_unspecified() && self.sock.is_ipv6() => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), v4.port())
            }
            other => other,
        }
    }

    // ---- multicast ----

    /// Joins a multicast group. Without an explicit interface the configured
    /// one is used, else the interface of the bound address; a wildcard bind
    /// leaves the choice to the kernel routing table.
    pub fn join_group(
        &mut self,
        group: IpAddr,
        iface: Option<MulticastInterface>,
        source: Option<IpAddr>,
    ) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let iface = iface.unwrap_or_else(|| self.resolve_interface());
        self.sock.join_group(group, iface, source)?;
        Ok(())
    }

    /// Leaves a multicast group.
    pub fn leave_group(
        &mut self,
        group: IpAddr,
        iface: Option<MulticastInterface>,
        source: Option<IpAddr>,
    ) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let iface = iface.unwrap_or_else(|| self.resolve_interface());
        self.sock.leave_group(group, iface, source)?;
        Ok(())
    }

    /// Blocks a source within a joined group. Resolves an interface and
    /// delegates to [`UdpChannel::block_group_on`].
    pub fn block_group(&mut self, group: IpAddr, source: IpAddr) -> Result<(), ChannelError> {
        let iface = self.resolve_interface();
        self.block_group_on(group, iface, source)
    }

    /// Blocking a multicast source is not supported by this channel.
    pub fn block_group_on(
        &mut self,
        _group: IpAddr,
        _iface: MulticastInterface,
        _source: IpAddr,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::Multicast(
            "blocking a multicast source is not supported",
        ))
    }

    fn resolve_interface(&mut self) -> MulticastInterface {
        if let Some(ip) = self.cfg.network_interface {
            return match ip {
                IpAddr::V4(addr) => MulticastInterface::V4(addr),
                IpAddr::V6(_) => MulticastInterface::V6(0),
            };
        }
        match self.local_addr() {
            Some(SocketAddr::V4(v4)) if !v4.ip().is_unspecified() => {
                MulticastInterface::V4(*v4.ip())
            }
            _ => MulticastInterface::Unspecified,
        }
    }

    // ---- write path ----

    /// Filters and enqueues an outbound message. The returned receiver
    /// resolves when the write path removes the message: success after the
    /// kernel accepted it, failure otherwise. Unsupported shapes and a
    /// missing recipient on an unconnected channel fail here, synchronously,
    /// regardless of which send strategy the flush later picks.
    pub fn write<B: Buf>(
        &mut self,
        msg: OutboundMessage<B>,
    ) -> Result<oneshot::Receiver<WriteResult>, ChannelError> {
        self.ensure_open()?;
        let msg = filter_outbound(msg, &self.caps)?;
        if msg.recipient().is_none() && !self.connected {
            return Err(ChannelError::NotConnected);
        }
        let rx = self.queue.push(msg);
        self.metrics.queue_depth.set(self.queue.len() as i64);
        Ok(rx)
    }

    /// Writes a bare payload to the connected peer.
    pub fn write_buffer<B: Buf>(
        &mut self,
        payload: B,
    ) -> Result<oneshot::Receiver<WriteResult>, ChannelError> {
        self.write(OutboundMessage::Buffer(payload))
    }

    /// Writes a payload to an explicit recipient.
    pub fn write_to<B: Buf>(
        &mut self,
        payload: B,
        recipient: SocketAddr,
    ) -> Result<oneshot::Receiver<WriteResult>, ChannelError> {
        self.write(OutboundMessage::Addressed {
            payload,
            recipient: Some(recipient),
        })
    }

    /// Writes one large payload the kernel splits into `segment_size`-byte
    /// datagrams.
    pub fn write_segmented<B: Buf>(
        &mut self,
        payload: B,
        segment_size: u16,
        recipient: Option<SocketAddr>,
    ) -> Result<oneshot::Receiver<WriteResult>, ChannelError> {
        self.write(OutboundMessage::Segmented {
            payload,
            segment_size,
            recipient,
        })
    }

    /// Drains the outbound queue towards the kernel.
    pub fn flush(&mut self) {
        self.do_write();
    }

    fn do_write(&mut self) {
        let mut budget = self.cfg.max_messages_per_write;
        while budget > 0 {
            let Some(head) = self.queue.current() else {
                break;
            };
            // Segmented packets always go through sendmmsg: the GSO control
            // message rides in the staged header.
            let batch = (self.caps.sendmmsg && self.queue.len() > 1)
                || matches!(head, DatagramMessage::Segmented { .. });

            if batch {
                let sent = {
                    let mut array = self.reg.packets();
                    array.reset();
                    let staged = array.add_outbound(&self.queue, self.connected, budget);
                    debug_assert!(staged >= 1);
                    self.sock.sendmmsg(&mut array)
                };
                match sent {
                    Ok(0) => {
                        self.metrics.send_eagain.inc();
                        break;
                    }
                    Ok(sent) => {
                        self.queue.remove_first(sent);
                        self.metrics.send_batches.inc();
                        self.metrics.send_batch_size.observe(sent as f64);
                        self.metrics.datagrams_sent.inc_by(sent as u64);
                        budget -= sent;
                    }
                    Err(err) => {
                        // One unreachable peer must not poison the batch:
                        // fail the head message and keep draining.
                        let err = ChannelError::translate_for_connected(err, self.connected);
                        self.metrics.send_errors.inc();
                        self.queue.remove_err(err);
                        budget -= 1;
                    }
                }
                continue;
            }

            match self.spin_send() {
                SpinOutcome::Done => {
                    self.queue.remove();
                    self.metrics.datagrams_sent.inc();
                    budget -= 1;
                }
                SpinOutcome::Again => {
                    self.metrics.send_eagain.inc();
                    break;
                }
                SpinOutcome::Fail(err) => {
                    self.metrics.send_errors.inc();
                    self.queue.remove_err(err);
                    budget -= 1;
                }
            }
        }

        if self.queue.is_empty() {
            self.clear_flag(EPOLL_OUT);
        } else {
            self.set_flag(EPOLL_OUT);
        }
        self.metrics.queue_depth.set(self.queue.len() as i64);
    }

    fn spin_send(&self) -> SpinOutcome {
        let Some(msg) = self.queue.current() else {
            return SpinOutcome::Again;
        };
        // write() rejects recipient-less messages on an unconnected channel;
        // a disconnect after enqueue can still leave one at the head.
        let recipient = match msg {
            DatagramMessage::Buffer(_) => {
                if !self.connected {
                    return SpinOutcome::Fail(ChannelError::NotConnected);
                }
                None
            }
            DatagramMessage::Addressed { recipient, .. } => {
                if recipient.is_none() && !self.connected {
                    return SpinOutcome::Fail(ChannelError::NotConnected);
                }
                *recipient
            }
            DatagramMessage::Segmented { .. } => {
                return SpinOutcome::Fail(ChannelError::UnsupportedMessage(
                    "segmented datagrams need sendmmsg",
                ));
            }
        };

        let payload = msg.payload();
        if payload.is_empty() {
            return SpinOutcome::Done;
        }
        for _ in 0..self.cfg.write_spin_count {
            let res = match recipient {
                Some(addr) => self.sock.send_to(payload, addr),
                None => self.sock.send(payload),
            };
            match res {
                Ok(0) => continue,
                Ok(_) => return SpinOutcome::Done,
                Err(err) => {
                    return SpinOutcome::Fail(ChannelError::translate_for_connected(
                        err,
                        self.connected,
                    ));
                }
            }
        }
        SpinOutcome::Again
    }

    // ---- read path ----

    /// Requests one read pass and arms readability.
    pub fn read(&mut self) {
        self.read_pending = true;
        self.set_flag(EPOLL_IN | EPOLL_RDHUP);
    }

    fn handle_readable(&mut self) {
        self.reg.assert_in_loop();
        self.metrics.read_passes.inc();
        if !self.cfg.auto_read && !self.read_pending {
            self.clear_flag(EPOLL_IN);
            return;
        }
        if !self.open {
            return;
        }
        self.alloc.reset(self.cfg.max_messages_per_read);

        let mut exception = None;
        loop {
            match self.read_once() {
                Ok(true) => self.read_pending = false,
                Ok(false) => break,
                Err(err) => {
                    exception = Some(ChannelError::translate_for_connected(err, self.connected));
                    break;
                }
            }
            // Reading less than attempted is fine for datagrams; keep going
            // while the last read produced data and the message cap allows.
            if !self.alloc.continue_reading() {
                break;
            }
        }

        self.alloc.read_complete();
        self.pipeline.channel_read_complete();
        if let Some(err) = exception {
            self.pipeline.exception_caught(err);
        }
        self.post_read();
    }

    fn read_once(&mut self) -> io::Result<bool> {
        let datagram_size = self.cfg.max_datagram_payload_size;
        let buf = self.alloc.allocate();
        let num_datagram = if self.caps.recvmmsg {
            if datagram_size == 0 {
                1
            } else {
                buf.len() / datagram_size
            }
        } else {
            0
        };

        if num_datagram <= 1 {
            if self.connected && !self.cfg.udp_gro {
                self.connected_read(buf, datagram_size)
            } else {
                self.recvmsg_read(buf)
            }
        } else {
            self.scattering_read(buf, datagram_size, num_datagram)
        }
    }

    fn connected_read(&mut self, mut buf: BytesMut, datagram_size: usize) -> io::Result<bool> {
        let writable = if datagram_size != 0 {
            buf.len().min(datagram_size)
        } else {
            buf.len()
        };
        self.alloc.attempted_bytes_read(writable);

        let n = self.sock.recv(&mut buf[..writable])?;
        if n == 0 {
            self.alloc.last_bytes_read(0);
            return Ok(false);
        }
        buf.truncate(n);
        // With a datagram size cap the attempted size is recorded so the
        // allocator's growth heuristic is not misled by short datagrams.
        self.alloc.last_bytes_read(if datagram_size == 0 {
            n as isize
        } else {
            writable as isize
        });

        let datagram = Datagram {
            payload: buf.freeze(),
            sender: self.remote,
            recipient: self.local,
            segment_size: None,
        };
        self.alloc.incr_messages_read(1);
        self.metrics.datagrams_received.inc();
        self.metrics.recv_bytes.inc_by(n as u64);
        self.pipeline.channel_read(datagram);
        Ok(true)
    }

    fn recvmsg_read(&mut self, mut buf: BytesMut) -> io::Result<bool> {
        let writable = buf.len();
        self.alloc.attempted_bytes_read(writable);

        let received = {
            let mut array = self.reg.packets();
            array.reset();
            let added = array.add_writable(&mut buf, 0, writable);
            debug_assert!(added, "fresh packet array rejected its sole slot");
            let n = self.sock.recvmsg(&mut array)?;
            if n == 0 {
                None
            } else {
                Some((n, array.sender(0), array.gro_segment_size(0)))
            }
        };
        let Some((n, sender, segment_size)) = received else {
            self.alloc.last_bytes_read(-1);
            return Ok(false);
        };

        buf.truncate(n);
        let datagram = Datagram {
            payload: buf.freeze(),
            sender,
            recipient: self.local,
            segment_size,
        };
        self.alloc.last_bytes_read(n as isize);
        self.metrics.recv_bytes.inc_by(n as u64);

        if datagram.is_segmented() {
            // Drained out of the staging array already; safe to fan out and
            // dispatch.
            let mut list = Vec::new();
            datagram.fan_out(&mut list);
            self.metrics.gro_fanout.inc();
            self.deliver_list(list);
        } else {
            self.alloc.incr_messages_read(1);
            self.metrics.datagrams_received.inc();
            self.pipeline.channel_read(datagram);
        }
        Ok(true)
    }

    fn scattering_read(
        &mut self,
        mut buf: BytesMut,
        datagram_size: usize,
        num_datagram: usize,
    ) -> io::Result<bool> {
        let received = {
            let mut array = self.reg.packets();
            array.reset();
            let mut offset = 0;
            for _ in 0..num_datagram {
                if !array.add_writable(&mut buf, offset, datagram_size) {
                    break;
                }
                offset += datagram_size;
            }
            self.alloc.attempted_bytes_read(offset);
            self.sock.recvmmsg(&mut array)?
        };
        if received == 0 {
            self.alloc.last_bytes_read(-1);
            return Ok(false);
        }
        self.metrics.recv_batches.inc();

        // Every slot is turned into an owned packet before any pipeline
        // dispatch; the staging array must not be live across user code.
        let mut list = Vec::with_capacity(received);
        let mut actual_bytes = 0u64;
        {
            let array = self.reg.packets();
            for i in 0..received {
                let len = array.received_len(i).min(datagram_size);
                actual_bytes += len as u64;
                let mut region = buf.split_to(datagram_size);
                region.truncate(len);
                let datagram = array.datagram(i, region.freeze(), self.local);
                if datagram.is_segmented() {
                    self.metrics.gro_fanout.inc();
                }
                datagram.fan_out(&mut list);
            }
        }
        // Remaining unread regions of the receive buffer are released here;
        // delivered payloads keep the shared allocation alive.
        drop(buf);

        self.alloc.last_bytes_read((received * datagram_size) as isize);
        self.metrics.recv_bytes.inc_by(actual_bytes);
        self.deliver_list(list);
        Ok(true)
    }

    fn deliver_list(&mut self, list: Vec<Datagram>) {
        self.alloc.incr_messages_read(list.len());
        self.metrics.datagrams_received.inc_by(list.len() as u64);
        for datagram in list {
            self.pipeline.channel_read(datagram);
        }
    }

    fn post_read(&mut self) {
        if self.cfg.auto_read {
            self.read();
        } else if !self.read_pending {
            self.clear_flag(EPOLL_IN);
        }
    }

    // ---- interest flags ----

    fn set_flag(&mut self, flag: u32) {
        if self.flags & flag != flag {
            self.flags |= flag;
            self.sync_interest();
        }
    }

    fn clear_flag(&mut self, flag: u32) {
        if self.flags & flag != 0 {
            self.flags &= !flag;
            self.sync_interest();
        }
    }

    fn sync_interest(&self) {
        let Some(token) = self.token else {
            return;
        };
        if !self.registered || !self.open {
            return;
        }
        if let Err(err) = self
            .reg
            .update_interest(self.sock.raw_fd(), token, self.flags)
        {
            warn!(?err, "failed to update epoll interest");
        }
    }

    #[cfg(test)]
    fn force_caps(&mut self, caps: Caps) {
        self.caps = caps;
    }
}

impl<P: Pipeline> EpollHandler for UdpChannel<P> {
    fn fd(&self) -> RawFd {
        self.sock.raw_fd()
    }

    fn epoll_in_ready(&mut self) {
        self.handle_readable();
    }

    fn epoll_out_ready(&mut self) {
        self.do_write();
    }
}
