// dgramport public library surface.
// Numan Thabit 2025

pub mod config;

pub mod error;

pub mod msg;

pub mod filter;

pub mod queue;

pub mod alloc;

pub mod pipeline;

pub mod metrics;

pub mod io;

#[cfg(target_os = "linux")]
pub mod eventloop;

#[cfg(target_os = "linux")]
pub mod channel;

pub use config::{BatchOptions, ChannelOptions, Config, ConfigError};

pub use error::ChannelError;

pub use msg::{Datagram, DatagramMessage};

pub use filter::{filter_outbound, is_contiguous, OutboundMessage};

pub use queue::{OutboundQueue, WriteResult};

pub use alloc::{AdaptiveRecvAllocator, RecvAllocator};

pub use pipeline::Pipeline;

pub use io::caps::Caps;

#[cfg(target_os = "linux")]
pub use io::{packets::PacketArray, sock::{MulticastInterface, UdpSock}};

#[cfg(target_os = "linux")]
pub use eventloop::{EpollHandler, EventLoop, Registration};

#[cfg(target_os = "linux")]
pub use channel::UdpChannel;

pub use metrics::{Metrics, MetricsError};
