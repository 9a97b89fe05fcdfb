//! A fixed-capacity byte buffer that lives inline (on the stack or inside the owning struct).
//!  This is what the embedded endpoint uses for outgoing frames, cached receipts and handler
//!  output, so that nothing on its hot path allocates.
//!
//! It implements `BufMut` to fit into the `bytes` ecosystem. Writing beyond the capacity is a bug
//!  in the caller and panics, so writers are expected to check [ArrayBuf::remaining_capacity]
//!  first.

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

#[derive(Clone, Eq)]
pub struct ArrayBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> ArrayBuf<N> {
    pub fn new() -> ArrayBuf<N> {
        ArrayBuf {
            buf: [0; N],
            len: 0,
        }
    }

    /// Returns `None` if the data does not fit
    pub fn from_slice(data: &[u8]) -> Option<ArrayBuf<N>> {
        let mut result = ArrayBuf::new();
        result.replace_with(data)
            .then_some(result)
    }

    /// Replaces the content with a copy of `data`, leaving the buffer unchanged and returning
    ///  `false` if it does not fit
    pub fn replace_with(&mut self, data: &[u8]) -> bool {
        if data.len() > N {
            return false;
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn remaining_capacity(&self) -> usize {
        N - self.len
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<const N: usize> Default for ArrayBuf<N> {
    fn default() -> Self {
        ArrayBuf::new()
    }
}

impl <const N: usize> PartialEq for ArrayBuf<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl <const N: usize> Debug for ArrayBuf<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl <const N: usize> Borrow<[u8]> for ArrayBuf<N> {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl <const N: usize> AsRef<[u8]> for ArrayBuf<N> {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl <const N: usize> AsMut<[u8]> for ArrayBuf<N> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl <const N: usize> bytes::BufMut for ArrayBuf<N> {
    fn remaining_mut(&self) -> usize {
        self.remaining_capacity()
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= N);
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}
