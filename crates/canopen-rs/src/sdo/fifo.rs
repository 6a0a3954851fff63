use super::CrcCcitt;
use alloc::vec;
use alloc::vec::Vec;

/// Circular byte FIFO backing streaming SDO transfers.
///
/// Besides the usual committed read cursor, the FIFO keeps a tentative
/// "alternate" cursor. The block-upload state machine uses it to examine
/// buffered bytes (fill frames, compute the CRC, measure) without consuming
/// them, and only commits consumption once the receiver has acknowledged the
/// sub-block. Retransmission after a lost frame restarts from the committed
/// cursor.
#[derive(Debug)]
pub struct Fifo {
    buf: Vec<u8>,
    read: usize,
    write: usize,
    alt_read: usize,
}

impl Fifo {
    /// Creates a FIFO able to hold `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            // One slot is sacrificed to distinguish full from empty.
            buf: vec![0; capacity + 1],
            read: 0,
            write: 0,
            alt_read: 0,
        }
    }

    /// Discards all buffered data and both cursors.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.alt_read = 0;
    }

    /// Number of readable bytes from the committed cursor.
    pub fn len(&self) -> usize {
        (self.write + self.buf.len() - self.read) % self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Number of bytes that can currently be written.
    pub fn space(&self) -> usize {
        self.buf.len() - 1 - self.len()
    }

    /// Grows the ring so at least `additional` more bytes fit. Buffered data
    /// survives; the tentative cursor collapses onto the committed one.
    pub fn reserve(&mut self, additional: usize) {
        if self.space() >= additional {
            return;
        }
        let len = self.len();
        let mut held = vec![0u8; len];
        self.read(&mut held);
        let new_capacity = (len + additional).max(2 * (self.buf.len() - 1));
        self.buf = vec![0; new_capacity + 1];
        self.read = 0;
        self.write = 0;
        self.alt_read = 0;
        self.write(&held);
    }

    /// Appends as much of `data` as fits; returns the number of bytes taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.space());
        for &byte in &data[..count] {
            self.buf[self.write] = byte;
            self.write = (self.write + 1) % self.buf.len();
        }
        count
    }

    /// Pops up to `buf.len()` bytes from the committed cursor.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.len());
        for slot in buf[..count].iter_mut() {
            *slot = self.buf[self.read];
            self.read = (self.read + 1) % self.buf.len();
        }
        // The tentative cursor must never trail the committed one.
        self.alt_read = self.read;
        count
    }

    /// Positions the tentative cursor `offset` bytes past the committed one.
    /// `offset` is clamped to the readable region.
    pub fn alt_begin(&mut self, offset: usize) {
        let offset = offset.min(self.len());
        self.alt_read = (self.read + offset) % self.buf.len();
    }

    /// Number of bytes readable from the tentative cursor.
    pub fn alt_len(&self) -> usize {
        (self.write + self.buf.len() - self.alt_read) % self.buf.len()
    }

    /// Reads from the tentative cursor without consuming.
    pub fn alt_read(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.alt_len());
        for slot in buf[..count].iter_mut() {
            *slot = self.buf[self.alt_read];
            self.alt_read = (self.alt_read + 1) % self.buf.len();
        }
        count
    }

    /// Commits consumption up to the tentative cursor. The bytes passed over
    /// are folded into `crc` when one is supplied. Returns the number of
    /// bytes committed.
    pub fn alt_finish(&mut self, mut crc: Option<&mut CrcCcitt>) -> usize {
        let mut count = 0;
        while self.read != self.alt_read {
            if let Some(crc) = crc.as_deref_mut() {
                crc.push(self.buf[self.read]);
            }
            self.read = (self.read + 1) % self.buf.len();
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let mut fifo = Fifo::with_capacity(16);
        assert_eq!(fifo.write(b"hello world"), 11);
        assert_eq!(fifo.len(), 11);

        let mut out = [0u8; 5];
        assert_eq!(fifo.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(fifo.len(), 6);
    }

    #[test]
    fn test_wraparound() {
        let mut fifo = Fifo::with_capacity(8);
        let mut out = [0u8; 8];
        for _ in 0..10 {
            assert_eq!(fifo.write(b"abcdef"), 6);
            assert_eq!(fifo.read(&mut out[..6]), 6);
            assert_eq!(&out[..6], b"abcdef");
        }
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_write_clamps_to_space() {
        let mut fifo = Fifo::with_capacity(4);
        assert_eq!(fifo.write(b"abcdef"), 4);
        assert_eq!(fifo.space(), 0);
        assert_eq!(fifo.write(b"x"), 0);
    }

    #[test]
    fn test_alt_cursor_peeks_without_consuming() {
        let mut fifo = Fifo::with_capacity(32);
        fifo.write(b"0123456789");

        fifo.alt_begin(0);
        let mut peek = [0u8; 7];
        assert_eq!(fifo.alt_read(&mut peek), 7);
        assert_eq!(&peek, b"0123456");
        // Committed cursor untouched: a normal read still sees byte '0'.
        assert_eq!(fifo.len(), 10);

        // Rewind and re-read, as after a lost sub-block frame.
        fifo.alt_begin(0);
        assert_eq!(fifo.alt_read(&mut peek), 7);
        assert_eq!(&peek, b"0123456");
    }

    #[test]
    fn test_alt_finish_commits_and_crcs() {
        let mut fifo = Fifo::with_capacity(32);
        fifo.write(b"0123456789");

        fifo.alt_begin(0);
        let mut peek = [0u8; 7];
        fifo.alt_read(&mut peek);

        let mut crc = CrcCcitt::new();
        assert_eq!(fifo.alt_finish(Some(&mut crc)), 7);
        assert_eq!(fifo.len(), 3);

        let mut expected = CrcCcitt::new();
        expected.update(b"0123456");
        assert_eq!(crc.value(), expected.value());
    }

    #[test]
    fn test_reserve_preserves_content() {
        let mut fifo = Fifo::with_capacity(4);
        fifo.write(b"abcd");
        fifo.reserve(16);
        assert_eq!(fifo.len(), 4);
        assert!(fifo.space() >= 16);
        let mut out = [0u8; 4];
        fifo.read(&mut out);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn test_read_resets_alt_cursor() {
        let mut fifo = Fifo::with_capacity(16);
        fifo.write(b"abcdef");
        fifo.alt_begin(4);
        let mut out = [0u8; 2];
        fifo.read(&mut out);
        // After a committed read the tentative cursor follows it.
        assert_eq!(fifo.alt_len(), fifo.len());
    }
}
