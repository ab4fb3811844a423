// Numan Thabit 2025
// queue.rs - outbound queue with per-message completion promises
use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::error::ChannelError;
use crate::msg::DatagramMessage;

/// Completion of a single queued write.
pub type WriteResult = Result<(), ChannelError>;

struct Pending {
    msg: DatagramMessage,
    done: Option<oneshot::Sender<WriteResult>>,
}

impl Pending {
    fn complete(mut self, result: WriteResult) {
        if let Some(done) = self.done.take() {
            // Receiver may have been dropped; completion is best-effort.
            let _ = done.send(result);
        }
    }
}

/// FIFO of outbound messages owned by the channel and drained on the event
/// loop thread. Every entry is completed exactly once: success when the
/// write path removes it after a send, failure when it is removed with an
/// error or the queue is dropped.
#[derive(Default)]
pub struct OutboundQueue {
    entries: VecDeque<Pending>,
}

impl OutboundQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message and returns the receiver for its completion.
    pub fn push(&mut self, msg: DatagramMessage) -> oneshot::Receiver<WriteResult> {
        let (tx, rx) = oneshot::channel();
        self.entries.push_back(Pending {
            msg,
            done: Some(tx),
        });
        rx
    }

    /// Enqueues a message whose completion nobody observes.
    pub fn push_detached(&mut self, msg: DatagramMessage) {
        self.entries.push_back(Pending { msg, done: None });
    }

    /// Head of the queue, if any.
    pub fn current(&self) -> Option<&DatagramMessage> {
        self.entries.front().map(|p| &p.msg)
    }

    /// Iterates messages front to back without removing them.
    pub fn iter(&self) -> impl Iterator<Item = &DatagramMessage> {
        self.entries.iter().map(|p| &p.msg)
    }

    /// Removes the head message, completing its promise with success.
    pub fn remove(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            entry.complete(Ok(()));
        }
    }

    /// Removes the first `n` messages, completing each with success.
    pub fn remove_first(&mut self, n: usize) {
        for _ in 0..n {
            match self.entries.pop_front() {
                Some(entry) => entry.complete(Ok(())),
                None => break,
            }
        }
    }

    /// Removes the head message, completing its promise with `err`.
    pub fn remove_err(&mut self, err: ChannelError) {
        if let Some(entry) = self.entries.pop_front() {
            entry.complete(Err(err));
        }
    }

    /// Fails every queued message with [`ChannelError::Closed`].
    pub fn fail_all_closed(&mut self) {
        while let Some(entry) = self.entries.pop_front() {
            entry.complete(Err(ChannelError::Closed));
        }
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        self.fail_all_closed();
    }
}
