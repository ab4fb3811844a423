// Numan Thabit 2025
// alloc.rs - receive-buffer allocator with adaptive size guessing
use bytes::BytesMut;

/// Per-read-loop allocator handle. Decides the next receive-buffer size,
/// records per-iteration statistics, and tells the read loop when to stop.
pub trait RecvAllocator {
    /// Resets per-pass counters. Called once at the start of each epoll-in
    /// dispatch with the configured messages-per-read cap.
    fn reset(&mut self, max_messages_per_read: usize);

    /// Allocates a zero-initialised writable buffer of the current guess.
    fn allocate(&mut self) -> BytesMut;

    /// Bytes the next syscall will attempt to read.
    fn attempted_bytes_read(&mut self, bytes: usize);

    /// Bytes actually produced by the last syscall. Zero or negative means
    /// no data and stops the loop.
    fn last_bytes_read(&mut self, bytes: isize);

    /// Records datagrams handed to the pipeline this pass.
    fn incr_messages_read(&mut self, messages: usize);

    /// Whether the read loop should run another iteration. Datagram
    /// semantics: reading less than attempted does not stop the loop as long
    /// as the last read produced at least one byte.
    fn continue_reading(&self) -> bool;

    /// End of pass; adapts the next size guess from what this pass read.
    fn read_complete(&mut self);
}

const SIZE_MIN: usize = 64;
const SIZE_MAX: usize = 64 * 1024;
const SIZE_INITIAL: usize = 2048;

/// Doubling/halving size guesser in the spirit of the adaptive allocator the
/// portable runtime ships: grow immediately after a read that filled the
/// attempted size, shrink only after two consecutive small reads.
#[derive(Debug, Clone)]
pub struct AdaptiveRecvAllocator {
    guess: usize,
    max_messages: usize,
    messages: usize,
    attempted: usize,
    last: isize,
    total_bytes: usize,
    shrink_streak: u8,
}

impl AdaptiveRecvAllocator {
    /// Creates an allocator starting from the default 2 KiB guess.
    pub fn new() -> Self {
        Self::with_initial(SIZE_INITIAL)
    }

    /// Creates an allocator starting from `initial` bytes, clamped to the
    /// supported range.
    pub fn with_initial(initial: usize) -> Self {
        Self {
            guess: initial.clamp(SIZE_MIN, SIZE_MAX),
            max_messages: 1,
            messages: 0,
            attempted: 0,
            last: 0,
            total_bytes: 0,
            shrink_streak: 0,
        }
    }

    /// Current size guess.
    pub fn guess(&self) -> usize {
        self.guess
    }

    /// Total bytes recorded this pass.
    pub fn total_bytes_read(&self) -> usize {
        self.total_bytes
    }
}

impl Default for AdaptiveRecvAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvAllocator for AdaptiveRecvAllocator {
    fn reset(&mut self, max_messages_per_read: usize) {
        self.max_messages = max_messages_per_read.max(1);
        self.messages = 0;
        self.attempted = 0;
        self.last = 0;
        self.total_bytes = 0;
    }

    fn allocate(&mut self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.guess);
        buf.resize(self.guess, 0);
        buf
    }

    fn attempted_bytes_read(&mut self, bytes: usize) {
        self.attempted = bytes;
    }

    fn last_bytes_read(&mut self, bytes: isize) {
        self.last = bytes;
        if bytes > 0 {
            self.total_bytes = self.total_bytes.saturating_add(bytes as usize);
        }
    }

    fn incr_messages_read(&mut self, messages: usize) {
        self.messages += messages;
    }

    fn continue_reading(&self) -> bool {
        self.messages < self.max_messages && self.last > 0
    }

    fn read_complete(&mut self) {
        if self.attempted == 0 {
            return;
        }
        let read = self.total_bytes;
        if read >= self.attempted {
            self.guess = (self.guess * 2).min(SIZE_MAX);
            self.shrink_streak = 0;
        } else if read <= self.attempted / 2 {
            self.shrink_streak += 1;
            if self.shrink_streak >= 2 {
                self.guess = (self.guess / 2).max(SIZE_MIN);
                self.shrink_streak = 0;
            }
        } else {
            self.shrink_streak = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_zeroed_buffers_of_the_guess() {
        let mut alloc = AdaptiveRecvAllocator::with_initial(1024);
        let buf = alloc.allocate();
        assert_eq!(buf.len(), 1024);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn grows_after_a_full_read() {
        let mut alloc = AdaptiveRecvAllocator::with_initial(1024);
        alloc.reset(16);
        alloc.attempted_bytes_read(1024);
        alloc.last_bytes_read(1024);
        alloc.read_complete();
        assert_eq!(alloc.guess(), 2048);
    }

    #[test]
    fn shrinks_only_after_two_small_passes() {
        let mut alloc = AdaptiveRecvAllocator::with_initial(4096);

        alloc.reset(16);
        alloc.attempted_bytes_read(4096);
        alloc.last_bytes_read(100);
        alloc.read_complete();
        assert_eq!(alloc.guess(), 4096);

        alloc.reset(16);
        alloc.attempted_bytes_read(4096);
        alloc.last_bytes_read(100);
        alloc.read_complete();
        assert_eq!(alloc.guess(), 2048);
    }

    #[test]
    fn stops_at_message_cap() {
        let mut alloc = AdaptiveRecvAllocator::new();
        alloc.reset(2);
        alloc.last_bytes_read(512);
        alloc.incr_messages_read(1);
        assert!(alloc.continue_reading());
        alloc.incr_messages_read(1);
        assert!(!alloc.continue_reading());
    }

    #[test]
    fn stops_when_nothing_was_read() {
        let mut alloc = AdaptiveRecvAllocator::new();
        alloc.reset(16);
        alloc.last_bytes_read(-1);
        assert!(!alloc.continue_reading());
        alloc.last_bytes_read(0);
        assert!(!alloc.continue_reading());
    }

    #[test]
    fn short_read_with_data_continues() {
        let mut alloc = AdaptiveRecvAllocator::new();
        alloc.reset(16);
        alloc.attempted_bytes_read(2048);
        alloc.last_bytes_read(1);
        alloc.incr_messages_read(1);
        assert!(alloc.continue_reading());
    }

    #[test]
    fn guess_respects_bounds() {
        let mut alloc = AdaptiveRecvAllocator::with_initial(SIZE_MAX);
        alloc.reset(16);
        alloc.attempted_bytes_read(SIZE_MAX);
        alloc.last_bytes_read(SIZE_MAX as isize);
        alloc.read_complete();
        assert_eq!(alloc.guess(), SIZE_MAX);

        let mut alloc = AdaptiveRecvAllocator::with_initial(SIZE_MIN);
        for _ in 0..2 {
            alloc.reset(16);
            alloc.attempted_bytes_read(SIZE_MIN);
            alloc.last_bytes_read(1);
            alloc.read_complete();
        }
        assert_eq!(alloc.guess(), SIZE_MIN);
    }
}
