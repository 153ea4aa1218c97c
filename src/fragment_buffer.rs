//! Fixed-length reusable buffers backing fragment payloads. Their main purpose is to minimize
//!  copying and allocation on the send/receive hot path: buffers cycle through the fragment
//!  pool instead of being freed.
//!
//! Salient points:
//!
//! * backed by a fixed-length, pre-allocated buffer with an explicit valid length
//! * implement `BufMut` to fit into the `bytes` ecosystem (sequential fill on split/decode)
//! * random-access writes and zero-filled extension for the seekable message writer

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

/// A fixed-length dynamically allocated buffer
#[derive(Eq)]
pub struct FragmentBuf {
    buf: Vec<u8>,
    len: usize,
}

impl FragmentBuf {
    /// create a new buffer with the given capacity
    pub fn new(capacity: usize) -> FragmentBuf {
        FragmentBuf {
            // no benefit in lazily initializing the buffer: buffers are reused aggressively,
            //  so we trade one initial zeroing for simplicity
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// copy `src` to `offset`, growing the valid length if the write ends past it.
    ///  `offset` must not exceed the current length (a seekable caller extends with
    ///  [FragmentBuf::extend_zeroed] first, so there are never undefined holes), and the
    ///  write must fit the capacity.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        assert!(offset <= self.len);
        assert!(offset + src.len() <= self.capacity());
        self.buf[offset..offset + src.len()].copy_from_slice(src);
        self.len = self.len.max(offset + src.len());
    }

    /// grow the valid length to `new_len`, zero-filling the added bytes. Reused buffers hold
    ///  stale bytes from their previous life beyond `len`, and those must never surface.
    pub fn extend_zeroed(&mut self, new_len: usize) {
        assert!(new_len >= self.len && new_len <= self.capacity());
        self.buf[self.len..new_len].fill(0);
        self.len = new_len;
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len = len;
    }

    /// This is a convenience function for test code. It derives the buffer's capacity from an
    ///  explicit parameter, which is a shortcut not intended for production usage.
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> FragmentBuf {
        let mut result = FragmentBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

/// the empty placeholder left behind when a buffer is taken back into the pool
impl Default for FragmentBuf {
    fn default() -> Self {
        FragmentBuf { buf: Vec::new(), len: 0 }
    }
}

impl PartialEq for FragmentBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FragmentBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FragmentBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FragmentBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for FragmentBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FragmentBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use rstest::rstest;
    use super::*;

    fn new_buf(capacity: usize, content: &[u8]) -> FragmentBuf {
        let mut result = FragmentBuf::new(capacity);
        result.put_slice(content);
        result
    }

    #[rstest]
    #[case::empty(new_buf(100, b""), 0)]
    #[case::simple(new_buf(100, b"abc"), 3)]
    fn test_len(#[case] buf: FragmentBuf, #[case] expected: usize) {
        assert_eq!(buf.len(), expected);
        assert_eq!(buf.is_empty(), expected == 0);
    }

    #[rstest]
    #[case::empty_100(new_buf(100, b""), 100)]
    #[case::data_100(new_buf(100, b"abc"), 100)]
    #[case::full(new_buf(5, b"abcde"), 5)]
    fn test_capacity(#[case] buf: FragmentBuf, #[case] expected: usize) {
        assert_eq!(buf.capacity(), expected);
        assert_eq!(buf.is_full(), buf.len() == expected);
    }

    #[rstest]
    #[case::empty(new_buf(100, b""))]
    #[case::data(new_buf(200, b"123"))]
    #[case::full(new_buf(5, b"12345"))]
    fn test_clear(#[case] mut buf: FragmentBuf) {
        let capacity = buf.capacity();

        buf.clear();

        assert_eq!(0, buf.len());
        assert_eq!(b"", buf.as_ref());
        assert_eq!(capacity, buf.capacity());
    }

    #[rstest]
    #[case::empty                    (new_buf(100, b""),   new_buf(100, b""),   true)]
    #[case::empty_different_capacity (new_buf(100, b""),   new_buf(200, b""),   true)]
    #[case::simple                   (new_buf(100, b"hi"), new_buf(200, b"hi"), true)]
    #[case::different                (new_buf(100, b"hi"), new_buf(100, b"yo"), false)]
    #[case::prefix                   (new_buf(100, b"h"),  new_buf(100, b"hi"), false)]
    #[case::empty_non_empty          (new_buf(100, b""),   new_buf(100, b"hi"), false)]
    fn test_eq(#[case] buf1: FragmentBuf, #[case] buf2: FragmentBuf, #[case] expected: bool) {
        assert_eq!(buf1.eq(&buf2), expected);
        assert_eq!(buf2.eq(&buf1), expected);
    }

    #[rstest]
    #[case::empty(new_buf(20, b""), b"")]
    #[case::data(new_buf(45, b"abc"), b"abc")]
    #[case::full(new_buf(5, b"abcde"), b"abcde")]
    fn test_borrow(#[case] mut buf: FragmentBuf, #[case] expected: &[u8]) {
        let borrowed: &[u8] = buf.borrow();
        assert_eq!(borrowed, expected);
        assert_eq!(buf.as_ref(), expected);
        assert_eq!(buf.as_mut(), expected);
    }

    #[rstest]
    #[case::data(new_buf(20, b"abc"), b"Abc")]
    #[case::full(new_buf(5, b"qrstu"), b"Arstu")]
    fn test_as_mut_modification(#[case] mut buf: FragmentBuf, #[case] expected: &[u8]) {
        buf.as_mut()[0] = 65;
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::append_to_empty(new_buf(10, b""), 0, b"abc", b"abc")]
    #[case::append(new_buf(10, b"abc"), 3, b"de", b"abcde")]
    #[case::overwrite(new_buf(10, b"abcde"), 1, b"XY", b"aXYde")]
    #[case::overwrite_and_grow(new_buf(10, b"abc"), 2, b"XYZ", b"abXYZ")]
    #[case::fill_to_capacity(new_buf(5, b"abc"), 3, b"de", b"abcde")]
    fn test_write_at(#[case] mut buf: FragmentBuf, #[case] offset: usize, #[case] src: &[u8], #[case] expected: &[u8]) {
        buf.write_at(offset, src);
        assert_eq!(buf.as_ref(), expected);
    }

    #[test]
    fn test_extend_zeroed_covers_stale_bytes() {
        let mut buf = new_buf(8, b"abcdef");
        buf.clear();

        buf.extend_zeroed(4);

        assert_eq!(buf.as_ref(), b"\0\0\0\0");
        assert_eq!(buf.len(), 4);
    }

    #[rstest]
    #[case::l5(5, b"hello")]
    #[case::l3(3, b"hel")]
    #[case::l0(0, b"")]
    fn test_truncate(#[case] len: usize, #[case] expected: &[u8]) {
        let mut buf = new_buf(1000, b"hello");
        buf.truncate(len);
        assert_eq!(buf.as_ref(), expected);
    }

    #[test]
    fn test_from_slice() {
        let buf = FragmentBuf::from_slice(20, b"hello");
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.as_ref(), b"hello");
        assert_eq!(buf.capacity(), 20);
    }

    #[test]
    fn test_default_is_empty_placeholder() {
        let buf = FragmentBuf::default();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn test_buf_mut_chunk_mut() {
        let mut buffer = FragmentBuf::new(1000);
        buffer.put_slice(b"hello");

        assert_eq!(buffer.remaining_mut(), 1000 - 5);

        let chunk = buffer.chunk_mut();
        assert_eq!(chunk.len(), 1000 - 5);

        chunk[..7].copy_from_slice(b" world!");
        assert_eq!(buffer.as_ref(), b"hello");

        unsafe { buffer.advance_mut(6); }
        assert_eq!(buffer.remaining_mut(), 1000 - 11);
        assert_eq!(buffer.as_ref(), b"hello world");
    }
}
