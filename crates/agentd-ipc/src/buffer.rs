use std::io;

use slice_deque::SliceDeque;

type ByteDeque = SliceDeque<u8>;

const BUF_SIZE_INCREMENT: usize = 65536;

/// An append-friendly, double-ended FIFO byte queue backing every socket
/// context's read and write side (§4.2). Bytes are appended at the tail and
/// consumed from the head; a frame decoder peeks without consuming until it
/// has enough bytes to parse a whole frame, then drains exactly that many.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    pub fn new(size: usize) -> Buffer {
        if size % BUF_SIZE_INCREMENT != 0 {
            panic!(
                "buffer size must be divisible by {}, got {}",
                BUF_SIZE_INCREMENT, size
            );
        }

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// A buffer sized to hold one full authenticated packet (§4.1 `size` cap)
    /// plus header and MAC overhead, rounded up to the increment.
    pub fn for_authed_frame() -> Buffer {
        Buffer::new(11 * BUF_SIZE_INCREMENT)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn free_capacity(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// All currently buffered bytes, in order.
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    pub fn write_slice(&mut self) -> &mut [u8] {
        unsafe { self.data.tail_head_slice() }
    }

    /// Peeks the first `count` bytes without consuming them. Returns `None`
    /// if fewer than `count` bytes are buffered, matching the "peek first N
    /// bytes, possibly returning null if insufficient" operation of §4.2.
    pub fn peek(&self, count: usize) -> Option<&[u8]> {
        if self.data.len() < count {
            return None;
        }
        Some(&self.data[..count])
    }

    /// Consumes and discards the first `count` bytes. Panics if fewer than
    /// `count` bytes are buffered; callers must `peek` first.
    pub fn drain(&mut self, count: usize) {
        assert!(count <= self.data.len(), "drain past buffered length");
        self.move_head(count);
    }

    /// Appends `bytes` to the tail of the buffer. Panics if there is not
    /// enough reserved capacity left; buffers are sized up front for the
    /// largest frame they are expected to carry.
    pub fn push(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.free_capacity(), "push past reserved capacity");
        self.write_slice()[..bytes.len()].copy_from_slice(bytes);
        self.move_tail(bytes.len());
    }

    /// Writes the buffered bytes out to `writer`, advancing the head as it
    /// goes, stopping at the first short write or `WouldBlock`.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while self.data.len() > 0 {
            let write_count = writer.write(&self.data)?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(write_count);
        }

        Ok(orig_len - self.data.len())
    }

    /// Reads as many bytes as `reader` will currently yield into the buffer,
    /// stopping on `WouldBlock`/EOF or once the buffer's configured size is
    /// reached (an overrun at that point is itself a protocol error: no
    /// in-flight frame should ever need more than this much slack).
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let orig_capacity = self.free_capacity();

        while self.data.len() < self.size {
            unsafe {
                let read_count = reader.read(self.data.tail_head_slice())?;

                if read_count == 0 {
                    return Ok(orig_capacity - self.free_capacity());
                }

                self.move_tail(read_count);
            }
        }

        Err(io::Error::new(io::ErrorKind::Other, "buffer overrun"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
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

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn roundtrip() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT / 2).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let result = buffer.ingress(&mut channel);
        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn peek_returns_none_when_short() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.ingress(&mut Cursor::new(vec![1u8, 2, 3])).unwrap();

        assert!(buffer.peek(4).is_none());
        assert_eq!(buffer.peek(3), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn drain_consumes_leading_bytes_only() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer
            .ingress(&mut Cursor::new(vec![1u8, 2, 3, 4, 5]))
            .unwrap();

        buffer.drain(2);
        assert_eq!(buffer.read_slice(), &[3u8, 4, 5]);
    }

    #[test]
    fn push_then_egress_roundtrip() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.push(&[1u8, 2, 3]);
        assert_eq!(buffer.read_slice(), &[1u8, 2, 3]);

        let mut out = Vec::new();
        buffer.egress(&mut out).unwrap();
        assert_eq!(out, vec![1u8, 2, 3]);
    }

    #[test]
    fn egress_error_on_zero_write() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.ingress(&mut Cursor::new(vec![1u8])).unwrap();

        let result = buffer.egress(&mut (&mut [][..]));
        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    #[should_panic(expected = "buffer size must be divisible by 65536, got 100000")]
    fn fails_on_incorrect_increment() {
        let _ = Buffer::new(100000);
    }
}
