//! A `Buf` implementation that gathers several non-contiguous chunks without copying.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

#[derive(Debug, Clone)]
pub struct BufList<T> {
    bufs: VecDeque<T>,
}

impl<T: Buf> BufList<T> {
    pub fn new() -> Self {
        Self { bufs: VecDeque::new() }
    }

    pub fn push_bytes(&mut self, buf: &mut T)
    where
        T: Default,
    {
        if buf.has_remaining() {
            self.bufs.push_back(std::mem::take(buf));
        }
    }

    pub fn push(&mut self, buf: T) {
        if buf.has_remaining() {
            self.bufs.push_back(buf);
        }
    }

    pub fn take_first(&mut self) -> Option<T> {
        self.bufs.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }
}

impl BufList<Bytes> {
    /// Remove and return up to `max_len` bytes from the front of the list, splitting
    /// the leading chunk if it is longer than requested.
    pub fn take_chunk(&mut self, max_len: usize) -> Option<Bytes> {
        let front = self.bufs.front_mut()?;
        if front.len() <= max_len {
            self.bufs.pop_front()
        } else {
            Some(front.split_to(max_len))
        }
    }
}

impl From<bytes::BytesMut> for BufList<Bytes> {
    fn from(buf: bytes::BytesMut) -> Self {
        let mut list = Self::new();
        list.push(buf.freeze());
        list
    }
}

impl<T: Buf> Default for BufList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Buf> Buf for BufList<T> {
    fn remaining(&self) -> usize {
        self.bufs.iter().map(Buf::remaining).sum()
    }

    fn chunk(&self) -> &[u8] {
        self.bufs.front().map(Buf::chunk).unwrap_or(&[])
    }

    fn advance(&mut self, mut cnt: usize) {
        while cnt > 0 {
            let front = match self.bufs.front_mut() {
                Some(b) => b,
                None => break,
            };
            let rem = front.remaining();
            if rem > cnt {
                front.advance(cnt);
                break;
            }
            front.advance(rem);
            cnt -= rem;
            self.bufs.pop_front();
        }
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [std::io::IoSlice<'a>]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let mut n = 0;
        for buf in &self.bufs {
            n += buf.chunks_vectored(&mut dst[n..]);
            if n == dst.len() {
                break;
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn empty_list_has_no_remaining() {
        let list: BufList<Bytes> = BufList::new();
        assert_eq!(list.remaining(), 0);
    }

    #[test]
    fn advance_across_chunk_boundary() {
        let mut list = BufList::new();
        list.push(Bytes::from_static(b"hello "));
        list.push(Bytes::from_static(b"world"));
        assert_eq!(list.remaining(), 11);
        list.advance(6);
        assert_eq!(list.chunk(), b"world");
        list.advance(5);
        assert_eq!(list.remaining(), 0);
    }

    #[test]
    fn push_empty_buf_is_skipped() {
        let mut list = BufList::new();
        list.push(Bytes::new());
        assert!(list.is_empty());
    }
}
