//! Fixed-capacity circular byte buffer for incoming link data.
//!
//! The buffer never grows: writing more data than there is free space overwrites the oldest
//!  unread bytes. Unread data can be inspected without copying through [RingBuffer::readable_chunks],
//!  which returns up to two slices because the data may wrap around the end of the backing store.

use std::cmp::min;
use std::fmt::{Debug, Formatter};

use crate::error::CodecError;

pub struct RingBuffer<S> {
    storage: S,
    read_offset: usize,
    readable: usize,
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> RingBuffer<S> {
    /// The backing store's length is the buffer's capacity. It can be anything that derefs to
    ///  a byte slice, e.g. a `[u8; N]` for allocation-free use or a `Vec<u8>`.
    pub fn new(storage: S) -> RingBuffer<S> {
        assert!(!storage.as_ref().is_empty(), "ring buffer needs a non-empty backing store");
        RingBuffer {
            storage,
            read_offset: 0,
            readable: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.as_ref().len()
    }

    pub fn readable_len(&self) -> usize {
        self.readable
    }

    pub fn free_space(&self) -> usize {
        self.capacity() - self.readable
    }

    pub fn is_empty(&self) -> bool {
        self.readable == 0
    }

    fn write_offset(&self) -> usize {
        (self.read_offset + self.readable) % self.capacity()
    }

    /// Appends data, discarding the oldest unread bytes if there is not enough free space
    pub fn write(&mut self, mut data: &[u8]) {
        let capacity = self.capacity();
        if data.len() >= capacity {
            data = &data[data.len() - capacity..];
            self.storage.as_mut().copy_from_slice(data);
            self.read_offset = 0;
            self.readable = capacity;
            return;
        }

        if data.len() > self.free_space() {
            self.erase(data.len() - self.free_space());
        }

        let write_offset = self.write_offset();
        let first_len = min(data.len(), capacity - write_offset);
        let storage = self.storage.as_mut();
        storage[write_offset..write_offset + first_len].copy_from_slice(&data[..first_len]);
        storage[..data.len() - first_len].copy_from_slice(&data[first_len..]);

        self.readable += data.len();
    }

    /// Copies `dest.len()` bytes starting `offset` bytes after the read position without
    ///  consuming them
    pub fn peek(&self, offset: usize, dest: &mut [u8]) -> Result<(), CodecError> {
        if offset + dest.len() > self.readable {
            return Err(CodecError::NotEnoughData);
        }

        let capacity = self.capacity();
        let start = (self.read_offset + offset) % capacity;
        let first_len = min(dest.len(), capacity - start);
        let storage = self.storage.as_ref();

        let (first, second) = dest.split_at_mut(first_len);
        first.copy_from_slice(&storage[start..start + first_len]);
        second.copy_from_slice(&storage[..second.len()]);
        Ok(())
    }

    pub fn peek_u8(&self, offset: usize) -> Option<u8> {
        if offset >= self.readable {
            return None;
        }
        Some(self.storage.as_ref()[(self.read_offset + offset) % self.capacity()])
    }

    /// Consumes up to `len` bytes from the read end
    pub fn erase(&mut self, len: usize) {
        let len = min(len, self.readable);
        self.read_offset = (self.read_offset + len) % self.capacity();
        self.readable -= len;
        if self.readable == 0 {
            self.read_offset = 0;
        }
    }

    pub fn clear(&mut self) {
        self.read_offset = 0;
        self.readable = 0;
    }

    /// All unread data in order, as up to two contiguous slices. The second slice is non-empty
    ///  only if the unread data wraps around the end of the backing store.
    pub fn readable_chunks(&self) -> (&[u8], &[u8]) {
        let storage = self.storage.as_ref();
        let end = self.read_offset + self.readable;
        if end <= storage.len() {
            (&storage[self.read_offset..end], &[])
        }
        else {
            (&storage[self.read_offset..], &storage[..end - storage.len()])
        }
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> Debug for RingBuffer<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RingBuffer{{capacity:{}, read_offset:{}, readable:{}}}", self.capacity(), self.read_offset, self.readable)
    }
}


#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use rstest::rstest;
    use super::*;

    fn ring_with(capacity: usize, read_offset: usize, data: &[u8]) -> RingBuffer<Vec<u8>> {
        let mut ring = RingBuffer::new(vec![0; capacity]);
        ring.write(&vec![0xee; read_offset]);
        ring.erase(read_offset);
        // erasing everything resets the read position, so move it explicitly
        ring.read_offset = read_offset % capacity;
        ring.write(data);
        ring
    }

    fn readable(ring: &RingBuffer<Vec<u8>>) -> Vec<u8> {
        let (a, b) = ring.readable_chunks();
        let mut result = a.to_vec();
        result.extend_from_slice(b);
        result
    }

    #[rstest]
    #[case::empty(8, 0, b"", b"", b"")]
    #[case::contiguous(8, 0, b"abc", b"abc", b"")]
    #[case::contiguous_offset(8, 3, b"abc", b"abc", b"")]
    #[case::up_to_end(8, 5, b"abc", b"abc", b"")]
    #[case::wrapped(8, 6, b"abcd", b"ab", b"cd")]
    #[case::wrapped_almost_full(8, 6, b"abcdefg", b"ab", b"cdefg")]
    #[case::full_length_write_realigns(8, 6, b"abcdefgh", b"abcdefgh", b"")]
    #[case::full_at_start(4, 0, b"abcd", b"abcd", b"")]
    fn test_readable_chunks(#[case] capacity: usize, #[case] read_offset: usize, #[case] data: &[u8], #[case] expected_first: &[u8], #[case] expected_second: &[u8]) {
        let ring = ring_with(capacity, read_offset, data);
        let (first, second) = ring.readable_chunks();
        assert_eq!(first, expected_first);
        assert_eq!(second, expected_second);
        assert_eq!(ring.free_space() + ring.readable_len(), capacity);
    }

    #[rstest]
    #[case::fits(4, 0, b"ab", b"cd", b"abcd")]
    #[case::overwrites_oldest(4, 0, b"abc", b"de", b"bcde")]
    #[case::overwrites_oldest_wrapped(4, 3, b"abc", b"de", b"bcde")]
    #[case::longer_than_capacity(4, 1, b"ab", b"cdefgh", b"efgh")]
    #[case::exactly_capacity(4, 2, b"ab", b"wxyz", b"wxyz")]
    fn test_write_overflow(#[case] capacity: usize, #[case] read_offset: usize, #[case] initial: &[u8], #[case] data: &[u8], #[case] expected: &[u8]) {
        let mut ring = ring_with(capacity, read_offset, initial);
        ring.write(data);
        assert_eq!(readable(&ring), expected);
        assert_eq!(ring.free_space() + ring.readable_len(), capacity);
    }

    #[rstest]
    #[case::start(6, 4, b"abcde", 0, 3, Ok(b"abc".to_vec()))]
    #[case::across_wrap(6, 4, b"abcde", 1, 3, Ok(b"bcd".to_vec()))]
    #[case::after_wrap(6, 4, b"abcde", 2, 3, Ok(b"cde".to_vec()))]
    #[case::everything(6, 4, b"abcde", 0, 5, Ok(b"abcde".to_vec()))]
    #[case::empty_read(6, 4, b"abc", 3, 0, Ok(vec![]))]
    #[case::beyond_end(6, 4, b"abc", 2, 2, Err(CodecError::NotEnoughData))]
    fn test_peek(#[case] capacity: usize, #[case] read_offset: usize, #[case] data: &[u8], #[case] offset: usize, #[case] len: usize, #[case] expected: Result<Vec<u8>, CodecError>) {
        let ring = ring_with(capacity, read_offset, data);
        let mut dest = vec![0; len];
        match ring.peek(offset, &mut dest) {
            Ok(()) => assert_eq!(Ok(dest), expected),
            Err(e) => assert_eq!(Err(e), expected),
        }
    }

    #[rstest]
    #[case::first(b"abc", 0, Some(b'a'))]
    #[case::last(b"abc", 2, Some(b'c'))]
    #[case::beyond(b"abc", 3, None)]
    fn test_peek_u8(#[case] data: &[u8], #[case] offset: usize, #[case] expected: Option<u8>) {
        let ring = ring_with(4, 3, data);
        assert_eq!(ring.peek_u8(offset), expected);
    }

    #[rstest]
    #[case::nothing(b"abcd", 0, b"abcd")]
    #[case::some(b"abcd", 3, b"d")]
    #[case::all(b"abcd", 4, b"")]
    #[case::more_than_readable(b"abcd", 9, b"")]
    fn test_erase(#[case] data: &[u8], #[case] len: usize, #[case] expected: &[u8]) {
        let mut ring = ring_with(5, 3, data);
        ring.erase(len);
        assert_eq!(readable(&ring), expected);
    }

    #[test]
    fn test_array_backing_store() {
        let mut ring = RingBuffer::new([0u8; 4]);
        ring.write(b"abc");
        ring.erase(2);
        ring.write(b"def");
        assert_eq!(ring.readable_chunks(), (&b"cd"[..], &b"ef"[..]));
    }

    /// interleaved writes and erases that never exceed capacity must behave like a queue
    #[test]
    fn test_against_queue_model() {
        let capacity = 13;
        let mut ring = RingBuffer::new(vec![0; capacity]);
        let mut model = VecDeque::new();
        let mut next_byte = 0u8;

        for step in 0..500usize {
            let write_len = min((step * 7) % 6, capacity - model.len());
            let data = (0..write_len)
                .map(|_| { next_byte = next_byte.wrapping_add(1); next_byte })
                .collect::<Vec<_>>();
            ring.write(&data);
            model.extend(data);

            let erase_len = (step * 3) % 5;
            ring.erase(erase_len);
            for _ in 0..min(erase_len, model.len()) {
                model.pop_front();
            }

            assert_eq!(readable(&ring), model.iter().cloned().collect::<Vec<_>>());
            let mut peeked = vec![0; model.len()];
            ring.peek(0, &mut peeked).unwrap();
            assert_eq!(peeked, model.iter().cloned().collect::<Vec<_>>());
            assert_eq!(ring.free_space() + ring.readable_len(), capacity);
        }
    }
}
