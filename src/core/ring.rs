//! Bounded ring buffer for post-mortem PTY output.
//!
//! Background tasks have no client attached, so their output lands here:
//! the last N bytes survive for late attach and for inspection after the
//! task completes. When the buffer is full, old data is overwritten.

#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    capacity: usize,
    /// Where the next byte goes once the buffer is full.
    write_pos: usize,
    /// Total bytes ever written; exceeds `capacity` after wraparound.
    total_written: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Appends `data`, overwriting the oldest bytes once full. Writes larger
    /// than the whole buffer keep only their last `capacity` bytes.
    pub fn write(&mut self, data: &[u8]) {
        if self.capacity == 0 || data.is_empty() {
            return;
        }
        self.total_written += data.len();

        let mut rest = if data.len() >= self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        // Fill phase: the backing Vec grows until it reaches capacity.
        if self.data.len() < self.capacity {
            let take = rest.len().min(self.capacity - self.data.len());
            self.data.extend_from_slice(&rest[..take]);
            self.write_pos = if self.data.len() == self.capacity {
                0
            } else {
                self.data.len()
            };
            rest = &rest[take..];
        }

        // Overwrite phase, wrapping at the end of the buffer.
        while !rest.is_empty() {
            let take = rest.len().min(self.capacity - self.write_pos);
            self.data[self.write_pos..self.write_pos + take].copy_from_slice(&rest[..take]);
            self.write_pos = (self.write_pos + take) % self.capacity;
            rest = &rest[take..];
        }
    }

    /// Returns the buffered bytes in chronological order, oldest first.
    pub fn read_all(&self) -> Vec<u8> {
        if self.data.len() < self.capacity {
            // Not yet full: contents are contiguous from the start.
            return self.data.clone();
        }
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(&self.data[self.write_pos..]);
        out.extend_from_slice(&self.data[..self.write_pos]);
        out
    }

    pub fn len(&self) -> usize {
        self.total_written.min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.total_written == 0
    }

    pub fn has_wrapped(&self) -> bool {
        self.total_written > self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.write_pos = 0;
        self.total_written = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_is_empty() {
        let buf = RingBuffer::new(100);
        assert_eq!(buf.capacity(), 100);
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
        assert!(buf.read_all().is_empty());
    }

    #[test]
    fn simple_write_read() {
        let mut buf = RingBuffer::new(100);
        buf.write(b"hello");
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.read_all(), b"hello");
    }

    #[test]
    fn multiple_writes_concatenate() {
        let mut buf = RingBuffer::new(100);
        buf.write(b"hello ");
        buf.write(b"world");
        assert_eq!(buf.read_all(), b"hello world");
    }

    #[test]
    fn wraparound_keeps_newest_in_order() {
        let mut buf = RingBuffer::new(10);
        buf.write(b"12345678");
        buf.write(b"abcd");
        assert!(buf.has_wrapped());
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.read_all(), b"345678abcd");
    }

    #[test]
    fn write_larger_than_capacity_keeps_tail() {
        let mut buf = RingBuffer::new(5);
        buf.write(b"this is way too long");
        assert_eq!(buf.read_all(), b" long");
    }

    #[test]
    fn exact_fill_then_overwrite() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"abcd");
        assert!(!buf.has_wrapped());
        assert_eq!(buf.read_all(), b"abcd");
        buf.write(b"ef");
        assert!(buf.has_wrapped());
        assert_eq!(buf.read_all(), b"cdef");
    }

    #[test]
    fn clear_resets() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"abcdef");
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.read_all().is_empty());
        buf.write(b"xy");
        assert_eq!(buf.read_all(), b"xy");
    }
}
