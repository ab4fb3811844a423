// Numan Thabit 2025
// eventloop.rs - edge-triggered epoll loop, registrations, interest flags
use std::cell::{RefCell, RefMut};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use ahash::AHashMap;
use tracing::warn;

use crate::io::packets::PacketArray;

/// Readiness interest bits, re-exported so channels can manipulate their own
/// registration without reaching into libc.
pub const EPOLL_IN: u32 = libc::EPOLLIN as u32;
/// Writability interest bit.
pub const EPOLL_OUT: u32 = libc::EPOLLOUT as u32;
/// Peer shut down bit.
pub const EPOLL_RDHUP: u32 = libc::EPOLLRDHUP as u32;
const EPOLL_ET: u32 = libc::EPOLLET as u32;
const EPOLL_ERR: u32 = libc::EPOLLERR as u32;

const MAX_EVENTS: usize = 256;

/// A channel registered with the loop.
pub trait EpollHandler {
    /// File descriptor driving the registration.
    fn fd(&self) -> RawFd;
    /// The fd became readable (or errored).
    fn epoll_in_ready(&mut self);
    /// The fd became writable.
    fn epoll_out_ready(&mut self);
}

/// State shared between the loop and its channels: the epoll fd for interest
/// updates, the pooled [`PacketArray`], and the owning thread for affinity
/// assertions.
///
/// The array is handed out through a `RefCell`: a borrow must end before any
/// pipeline dispatch, which structurally enforces that no staged state
/// survives into user callbacks.
pub struct Registration {
    epfd: OwnedFd,
    packets: RefCell<PacketArray>,
    thread: ThreadId,
}

impl Registration {
    /// Asserts the caller runs on the loop thread. Data-path entry points
    /// call this; it compiles to nothing in release builds.
    pub fn assert_in_loop(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.thread,
            "channel touched off its event-loop thread"
        );
    }

    /// Borrows the shared staging array. Callers reset it before use.
    pub fn packets(&self) -> RefMut<'_, PacketArray> {
        self.assert_in_loop();
        self.packets.borrow_mut()
    }

    /// Rewrites the interest set for a registered fd.
    pub(crate) fn update_interest(&self, fd: RawFd, token: u64, flags: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: flags | EPOLL_ET,
            u64: token,
        };
        epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)
    }

    pub(crate) fn add(&self, fd: RawFd, token: u64, flags: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: flags | EPOLL_ET,
            u64: token,
        };
        epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
    }
}

fn epoll_ctl(
    epfd: RawFd,
    op: libc::c_int,
    fd: RawFd,
    event: *mut libc::epoll_event,
) -> io::Result<()> {
    let rc = unsafe { libc::epoll_ctl(epfd, op, fd, event) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Single-threaded edge-triggered epoll loop. Owns the handler table and the
/// registration shared with its channels.
pub struct EventLoop {
    reg: Rc<Registration>,
    handlers: AHashMap<u64, Rc<RefCell<dyn EpollHandler>>>,
    next_token: u64,
}

impl EventLoop {
    /// Creates a loop whose staging array holds `packet_array_capacity`
    /// slots.
    pub fn new(packet_array_capacity: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };
        Ok(Self {
            reg: Rc::new(Registration {
                epfd,
                packets: RefCell::new(PacketArray::new(packet_array_capacity)),
                thread: thread::current().id(),
            }),
            handlers: AHashMap::new(),
            next_token: 1,
        })
    }

    /// Shared registration for constructing channels on this loop.
    pub fn registration(&self) -> Rc<Registration> {
        Rc::clone(&self.reg)
    }

    /// Registers a handler for read readiness and returns its token.
    pub fn register(&mut self, handler: Rc<RefCell<dyn EpollHandler>>) -> io::Result<u64> {
        let token = self.next_token;
        let fd = handler.borrow().fd();
        self.reg.add(fd, token, EPOLL_IN | EPOLL_RDHUP)?;
        self.handlers.insert(token, handler);
        self.next_token += 1;
        Ok(token)
    }

    /// Drops a registration. The fd is removed from the interest set exactly
    /// once; removal after close is a no-op.
    pub fn deregister(&mut self, token: u64) {
        if let Some(handler) = self.handlers.remove(&token) {
            let fd = handler.borrow().fd();
            if fd >= 0 {
                if let Err(err) = self.reg.delete(fd) {
                    warn!(?err, fd, "epoll deregistration failed");
                }
            }
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs one `epoll_wait` pass and dispatches readiness to handlers.
    /// Returns the number of events seen.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.reg.assert_in_loop();
        let timeout_ms = timeout.map_or(-1, |t| {
            i32::try_from(t.as_millis()).unwrap_or(i32::MAX)
        });
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            unsafe { std::mem::zeroed() };

        let n = loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.reg.epfd.as_raw_fd(),
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout_ms,
                )
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break n as usize;
        };

        for event in &events[..n] {
            // epoll_event is packed on some targets; copy fields out before
            // borrowing.
            let token = event.u64;
            let ready = event.events;
            let Some(handler) = self.handlers.get(&token).cloned() else {
                continue;
            };
            if ready & EPOLL_OUT != 0 {
                handler.borrow_mut().epoll_out_ready();
            }
            // Errors and peer hangups are drained through the read path,
            // which surfaces them to the pipeline.
            if ready & (EPOLL_IN | EPOLL_ERR | EPOLL_RDHUP) != 0 {
                handler.borrow_mut().epoll_in_ready();
            }
        }
        Ok(n)
    }

    /// Polls until `done` returns true or `max_passes` passes elapse. Test
    /// and example helper.
    pub fn poll_until(
        &mut self,
        max_passes: usize,
        mut done: impl FnMut() -> bool,
    ) -> io::Result<()> {
        for _ in 0..max_passes {
            if done() {
                return Ok(());
            }
            self.poll(Some(Duration::from_millis(20)))?;
        }
        Ok(())
    }
}
