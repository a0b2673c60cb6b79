use std::io;

// Scratch size for a single read(2) call during ingress.
const READ_CHUNK: usize = 8192;

// Consumed prefix beyond which the backing store is compacted.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// A contiguous byte FIFO. Data is appended at the tail and consumed from
/// the head; the readable portion is always one contiguous slice.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer { data: Vec::new(), head: 0 }
    }

    /// The number of readable bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slice containing the readable data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Appends bytes at the tail.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Discards `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "consumed past buffer end");
        self.head += count;

        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > COMPACT_THRESHOLD {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Reads from the supplied reader until it would block. An end of
    /// stream surfaces as `UnexpectedEof`; a would-block stop is normal and
    /// returns the byte count ingested so far.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.data.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes buffered data to the supplied writer until it would block or
    /// the buffer drains. Returns the byte count written.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.consume(n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::{Read, Write};

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel { data, cursor: 0, chunk, max_size }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..10_000).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new();
        let received = buffer.ingress(&mut channel).unwrap();

        assert_eq!(received, mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let sent = buffer.egress(&mut channel).unwrap();

        assert_eq!(sent, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_eof_is_an_error() {
        let mut empty: &[u8] = &[];
        let mut buffer = Buffer::new();

        let err = buffer.ingress(&mut empty).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut full = MockChannel::new(Vec::new(), 16, 0);
        let mut buffer = Buffer::new();
        buffer.extend(&[1]);

        let err = buffer.egress(&mut full).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_egress_stops_at_would_block() {
        let mut channel = MockChannel::new(Vec::new(), 4, 8);
        let mut buffer = Buffer::new();
        buffer.extend(&[9; 10]);

        let sent = buffer.egress(&mut channel).unwrap();

        // Two chunks of four fill the mock; the rest stays buffered.
        assert_eq!(sent, 8);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_consume_compacts_when_drained() {
        let mut buffer = Buffer::new();
        buffer.extend(&[1, 2, 3]);
        buffer.consume(3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.head, 0);

        buffer.extend(&[4, 5]);
        buffer.consume(1);
        assert_eq!(buffer.read_slice(), &[5]);
    }

    #[test]
    #[should_panic(expected = "consumed past buffer end")]
    fn test_consume_past_end_panics() {
        let mut buffer = Buffer::new();
        buffer.extend(&[1]);
        buffer.consume(2);
    }
}
