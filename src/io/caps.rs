// Numan Thabit 2025
// io/caps.rs - platform capability probing for batched and offloaded UDP I/O
use std::sync::OnceLock;

/// Capability flags the channel consults when selecting send/receive
/// strategies. A value with every flag false selects the portable
/// single-`sendmsg`/`recvmsg` paths, which stay correct everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caps {
    /// `sendmmsg(2)` is available.
    pub sendmmsg: bool,
    /// `recvmmsg(2)` is available.
    pub recvmmsg: bool,
    /// The kernel accepts the UDP_SEGMENT socket option (GSO).
    pub udp_segment: bool,
    /// The kernel accepts the UDP_GRO socket option.
    pub udp_gro: bool,
}

impl Caps {
    /// Probes the running system once and caches the result for the process
    /// lifetime.
    pub fn probe() -> Self {
        static PROBED: OnceLock<Caps> = OnceLock::new();
        *PROBED.get_or_init(Self::probe_uncached)
    }

    /// All capabilities off. Useful for forcing the portable paths in tests.
    pub fn none() -> Self {
        Self {
            sendmmsg: false,
            recvmmsg: false,
            udp_segment: false,
            udp_gro: false,
        }
    }

    #[cfg(target_os = "linux")]
    fn probe_uncached() -> Self {
        // The msg-batch syscalls predate every kernel this crate targets.
        let sendmmsg = true;
        let recvmmsg = true;
        Self {
            sendmmsg,
            recvmmsg,
            // Segmented sends are flushed through sendmmsg, so GSO is only
            // advertised together with it.
            udp_segment: sendmmsg && probe_sockopt(libc::UDP_SEGMENT, 1460),
            udp_gro: probe_sockopt(libc::UDP_GRO, 1),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn probe_uncached() -> Self {
        Self::none()
    }
}

/// Tries the given SOL_UDP option on a throwaway socket. ENOPROTOOPT or
/// EINVAL from an older kernel means the offload is absent.
#[cfg(target_os = "linux")]
fn probe_sockopt(opt: libc::c_int, value: libc::c_int) -> bool {
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;

    let Ok(socket) = UdpSocket::bind("127.0.0.1:0") else {
        return false;
    };
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_UDP,
            opt,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    rc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_stable_across_calls() {
        assert_eq!(Caps::probe(), Caps::probe());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_always_has_msg_batch_syscalls() {
        let caps = Caps::probe();
        assert!(caps.sendmmsg);
        assert!(caps.recvmmsg);
    }

    #[test]
    fn none_disables_everything() {
        let caps = Caps::none();
        assert!(!caps.sendmmsg && !caps.recvmmsg && !caps.udp_segment && !caps.udp_gro);
    }
}
