// Numan Thabit 2025
// error.rs - channel error taxonomy and errno translation
use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Errors surfaced by channel operations and delivered through write
/// completions and the pipeline.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A native I/O error that carries no more specific meaning.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// ECONNREFUSED observed on a connected socket. The kernel saw an ICMP
    /// port-unreachable from the peer.
    #[error("peer port unreachable: {source}")]
    PortUnreachable {
        /// Underlying native error.
        #[source]
        source: io::Error,
    },
    /// The message shape is not accepted by this channel on this platform.
    #[error("unsupported message type: {0}")]
    UnsupportedMessage(&'static str),
    /// A bare payload was written without a prior `connect`.
    #[error("bare payload requires a connected channel")]
    NotConnected,
    /// The channel was closed before the operation completed.
    #[error("channel closed")]
    Closed,
    /// A multicast operation the platform or address family cannot perform.
    #[error("multicast: {0}")]
    Multicast(&'static str),
}

impl ChannelError {
    /// Translates a native error for a connected channel. ECONNREFUSED turns
    /// into [`ChannelError::PortUnreachable`] so callers see the same shape
    /// the portable runtime reports; everything else passes through.
    pub fn translate_for_connected(err: io::Error, connected: bool) -> Self {
        if connected && err.raw_os_error() == Some(Errno::ECONNREFUSED as i32) {
            ChannelError::PortUnreachable { source: err }
        } else {
            ChannelError::Io(err)
        }
    }

    /// Returns true for errors scoped to a single message rather than the
    /// whole channel.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            ChannelError::Io(_)
                | ChannelError::PortUnreachable { .. }
                | ChannelError::NotConnected
        )
    }
}
