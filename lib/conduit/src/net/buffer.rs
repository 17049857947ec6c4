use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

/// A bounded, buffered FIFO byte queue. Data is appended at the tail and
/// consumed from the head. The logical capacity is fixed at construction;
/// the backing deque may reserve more but writes never exceed `size`.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true when the buffer holds `size` bytes and accepts no more.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.data.len() >= self.size
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Consume `count` bytes from the head.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Commit `count` bytes previously written through `write_slice`.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Drop tail bytes so that exactly `len` bytes remain.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        let excess = self.data.len() - len;
        unsafe { self.data.move_tail(-(excess as isize)) }
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    /// Slice containing free capacity to be written, bounded by the logical
    /// capacity.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        let free = self.free_capacity();
        unsafe { &mut self.data.tail_head_slice()[..free] }
    }

    /// Append `bytes` to the tail. The caller must have checked capacity.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.write_slice()[..bytes.len()].copy_from_slice(bytes);
        self.move_tail(bytes.len());
    }

    /// Write the contents of the buffer to the supplied writer, advancing
    /// the head past everything the writer accepted. A blocked writer ends
    /// the call with the bytes written so far; a writer that accepts zero
    /// bytes is an error.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => self.move_head(count),
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(orig_len - self.data.len())
    }

    /// Read from the supplied reader until the buffer is full or the reader
    /// blocks. Returns the bytes read and whether the reader reported
    /// end-of-stream.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, bool)> {
        let orig_len = self.data.len();

        while self.data.len() < self.size {
            let slot = self.free_capacity();
            let read = unsafe {
                match reader.read(&mut self.data.tail_head_slice()[..slot]) {
                    Ok(count) => count,
                    Err(ref err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::Interrupted =>
                    {
                        return Ok((self.data.len() - orig_len, false));
                    }
                    Err(err) => return Err(err),
                }
            };

            if read == 0 {
                return Ok((self.data.len() - orig_len, true));
            }

            self.move_tail(read);
        }

        Ok((self.data.len() - orig_len, false))
    }
}
