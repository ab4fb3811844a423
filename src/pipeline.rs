// Numan Thabit 2025
// pipeline.rs - inbound event sink contract
use crate::error::ChannelError;
use crate::msg::Datagram;

/// Sink for inbound channel events.
///
/// Event order per read pass: zero or more `channel_read` calls, then exactly
/// one `channel_read_complete`, then at most one `exception_caught`. Handlers
/// must not re-enter the owning channel synchronously; queue follow-up work
/// and perform it after the dispatch returns.
pub trait Pipeline {
    /// One decoded datagram. Called once per delivered datagram.
    fn channel_read(&mut self, datagram: Datagram);

    /// The current read pass finished draining the socket.
    fn channel_read_complete(&mut self);

    /// An error captured during the read pass, delivered after
    /// `channel_read_complete`.
    fn exception_caught(&mut self, error: ChannelError);
}

impl<P: Pipeline + ?Sized> Pipeline for Box<P> {
    fn channel_read(&mut self, datagram: Datagram) {
        (**self).channel_read(datagram);
    }

    fn channel_read_complete(&mut self) {
        (**self).channel_read_complete();
    }

    fn exception_caught(&mut self, error: ChannelError) {
        (**self).exception_caught(error);
    }
}
